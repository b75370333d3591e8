//! Message-passing fabric abstraction (spec section 4.5). Process
//! launch and MPI bootstrap are explicitly out of core scope; only the
//! reduction/scatter protocol the [`crate::tree::TreeCommunicator`]
//! drives over this trait is.

use tokio::sync::{mpsc, watch};

use crate::message::SampleMessage;
use crate::policy::PolicyMessage;

/// Non-blocking receive result: either a fresh value or nothing ready
/// yet. Never blocks the calling task.
#[derive(Debug, Clone, PartialEq)]
pub enum FabricStatus<T> {
    Ready(T),
    WouldBlock,
}

/// One tree edge's up/down channels. `send_sample`/`receive_sample` move
/// child-to-parent aggregates; `send_policy`/`receive_policy` move
/// parent-to-child policy. Implementations decide how losslessly samples
/// are delivered — spec section 5 only requires best-effort, coalescing
/// delivery for samples and strictly causal delivery for policy.
pub trait Fabric: Send {
    fn send_sample(&self, sample: SampleMessage) -> crate::error::Result<()>;
    fn receive_sample(&mut self) -> FabricStatus<SampleMessage>;
    fn send_policy(&self, policy: PolicyMessage) -> crate::error::Result<()>;
    fn receive_policy(&mut self) -> FabricStatus<PolicyMessage>;
}

/// Reference [`Fabric`] for a single process: `tokio::sync::mpsc` carries
/// samples up (every sample delivered, backpressured), `tokio::sync::watch`
/// carries policy down (only the latest value is ever observed, which is
/// exactly the coalescing the spec calls for on the down path and, paired
/// with the `version` field on [`PolicyMessage`], still lets a receiver
/// detect a skipped version).
pub struct ChannelFabric {
    sample_tx: mpsc::UnboundedSender<SampleMessage>,
    sample_rx: mpsc::UnboundedReceiver<SampleMessage>,
    policy_tx: watch::Sender<Option<PolicyMessage>>,
    policy_rx: watch::Receiver<Option<PolicyMessage>>,
}

impl ChannelFabric {
    pub fn new() -> Self {
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (policy_tx, policy_rx) = watch::channel(None);
        ChannelFabric { sample_tx, sample_rx, policy_tx, policy_rx }
    }

    /// A fresh handle sharing this fabric's sample sender and policy
    /// receiver, suitable for handing to a child's controller task. Each
    /// endpoint also gets its own sample channel for the up direction it
    /// owns, so callers construct one `ChannelFabric` per edge and wire
    /// `child.sender_for_parent()` into the parent's `receiver_endpoint()`.
    pub fn sender_for_parent(&self) -> mpsc::UnboundedSender<SampleMessage> {
        self.sample_tx.clone()
    }

    pub fn policy_receiver(&self) -> watch::Receiver<Option<PolicyMessage>> {
        self.policy_rx.clone()
    }
}

impl Default for ChannelFabric {
    fn default() -> Self {
        ChannelFabric::new()
    }
}

impl Fabric for ChannelFabric {
    fn send_sample(&self, sample: SampleMessage) -> crate::error::Result<()> {
        self.sample_tx
            .send(sample)
            .map_err(|_| pwrctl_err_runtime("sample channel closed"))
    }

    fn receive_sample(&mut self) -> FabricStatus<SampleMessage> {
        match self.sample_rx.try_recv() {
            Ok(sample) => FabricStatus::Ready(sample),
            Err(_) => FabricStatus::WouldBlock,
        }
    }

    fn send_policy(&self, policy: PolicyMessage) -> crate::error::Result<()> {
        self.policy_tx
            .send(Some(policy))
            .map_err(|_| pwrctl_err_runtime("policy channel closed"))
    }

    fn receive_policy(&mut self) -> FabricStatus<PolicyMessage> {
        let has_changed = self.policy_rx.has_changed().unwrap_or(false);
        if !has_changed {
            return FabricStatus::WouldBlock;
        }
        let value = self.policy_rx.borrow_and_update().clone();
        match value {
            Some(policy) => FabricStatus::Ready(policy),
            None => FabricStatus::WouldBlock,
        }
    }
}

fn pwrctl_err_runtime(message: &str) -> crate::error::Error {
    crate::pwrctl_err!(crate::error::ErrorCode::Runtime, "{message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Flags, Mode};

    fn sample(region_id: u64) -> SampleMessage {
        SampleMessage { region_id, runtime: 1.0, progress: 0.5, energy: 10.0, frequency: 2000.0 }
    }

    fn policy(version: u64) -> PolicyMessage {
        PolicyMessage {
            mode: Mode::FreqUniformStatic,
            power_budget_watts: 100.0,
            flags: Flags::default(),
            num_sample: 1,
            target: vec![100.0],
            version,
        }
    }

    #[test]
    fn receive_sample_is_would_block_when_empty() {
        let mut fabric = ChannelFabric::new();
        assert_eq!(fabric.receive_sample(), FabricStatus::WouldBlock);
    }

    #[test]
    fn send_then_receive_sample_round_trips() {
        let mut fabric = ChannelFabric::new();
        fabric.send_sample(sample(7)).unwrap();
        assert_eq!(fabric.receive_sample(), FabricStatus::Ready(sample(7)));
        assert_eq!(fabric.receive_sample(), FabricStatus::WouldBlock);
    }

    #[test]
    fn policy_watch_coalesces_to_latest() {
        let mut fabric = ChannelFabric::new();
        fabric.send_policy(policy(1)).unwrap();
        fabric.send_policy(policy(2)).unwrap();
        match fabric.receive_policy() {
            FabricStatus::Ready(p) => assert_eq!(p.version, 2),
            FabricStatus::WouldBlock => panic!("expected a policy"),
        }
        assert_eq!(fabric.receive_policy(), FabricStatus::WouldBlock);
    }
}
