//! `TreeCommunicator` (spec section 4.5): builds `L = ceil(log_F(N))`
//! levels over `N` ranks with a bounded per-level fanout, and exposes
//! non-blocking sample-up / policy-down exchange over a [`Fabric`].
//!
//! Process launch and the underlying job communicator are out of core
//! scope (spec section 1 Non-goals); this type only computes the level
//! topology and forwards exchanges to one [`Fabric`] instance per level.

use crate::error::{ErrorCode, Result};
use crate::fabric::{Fabric, FabricStatus};
use crate::message::SampleMessage;
use crate::policy::PolicyMessage;
use crate::pwrctl_err;

pub const DEFAULT_FAN_OUT: usize = 16;

/// Computes `fan_out[l]` for `num_rank` ranks using a uniform fanout
/// everywhere except the top level, which covers whatever remains — the
/// same construction `KNLPlatformImp`'s communicator setup uses for an
/// uneven rank count.
pub fn build_fan_out(num_rank: usize, max_fan_out: usize) -> Vec<usize> {
    if num_rank <= 1 {
        return vec![1];
    }
    let mut fan_out = Vec::new();
    let mut remaining = num_rank;
    while remaining > max_fan_out {
        fan_out.push(max_fan_out);
        remaining = remaining.div_ceil(max_fan_out);
    }
    fan_out.push(remaining);
    fan_out
}

/// One rank's position within the tree: its index within its immediate
/// group at each level, used to decide whether it is the group's rank-0
/// (and therefore participates one level up).
pub fn rank_index_at_level(rank: usize, fan_out: &[usize], level: usize) -> usize {
    let mut group_size: usize = fan_out[..level].iter().product();
    if group_size == 0 {
        group_size = 1;
    }
    (rank / group_size) % fan_out.get(level).copied().unwrap_or(1)
}

pub fn is_group_root(rank: usize, fan_out: &[usize], level: usize) -> bool {
    rank_index_at_level(rank, fan_out, level) == 0
}

/// The tree fabric for one rank: one [`Fabric`] edge per level that rank
/// participates in, indexed from leaf (0) to the level below the root.
pub struct TreeCommunicator<F: Fabric> {
    fan_out: Vec<usize>,
    edges: Vec<F>,
}

impl<F: Fabric> TreeCommunicator<F> {
    pub fn new(fan_out: Vec<usize>, edges: Vec<F>) -> Result<Self> {
        if edges.len() != fan_out.len() {
            return Err(pwrctl_err!(
                ErrorCode::LevelRange,
                "tree communicator given {} edges for {} levels",
                edges.len(),
                fan_out.len()
            ));
        }
        Ok(TreeCommunicator { fan_out, edges })
    }

    pub fn num_level(&self) -> usize {
        self.fan_out.len()
    }

    pub fn fan_out(&self) -> &[usize] {
        &self.fan_out
    }

    pub fn send_sample(&self, level: usize, sample: SampleMessage) -> Result<()> {
        self.edge(level)?.send_sample(sample)
    }

    pub fn receive_sample(&mut self, level: usize) -> Result<FabricStatus<SampleMessage>> {
        Ok(self.edge_mut(level)?.receive_sample())
    }

    pub fn send_policy(&self, level: usize, policy: PolicyMessage) -> Result<()> {
        self.edge(level)?.send_policy(policy)
    }

    pub fn receive_policy(&mut self, level: usize) -> Result<FabricStatus<PolicyMessage>> {
        Ok(self.edge_mut(level)?.receive_policy())
    }

    fn edge(&self, level: usize) -> Result<&F> {
        self.edges
            .get(level)
            .ok_or_else(|| pwrctl_err!(ErrorCode::LevelRange, "no edge at level {level}"))
    }

    fn edge_mut(&mut self, level: usize) -> Result<&mut F> {
        self.edges
            .get_mut(level)
            .ok_or_else(|| pwrctl_err!(ErrorCode::LevelRange, "no edge at level {level}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::ChannelFabric;

    #[test]
    fn build_fan_out_matches_scenario_s4() {
        let fan_out = build_fan_out(16, 4);
        assert_eq!(fan_out, vec![4, 4]);
    }

    #[test]
    fn build_fan_out_single_rank_is_trivial() {
        assert_eq!(build_fan_out(1, 16), vec![1]);
    }

    #[test]
    fn group_root_detection_is_consistent_across_level() {
        let fan_out = vec![4, 4];
        assert!(is_group_root(0, &fan_out, 0));
        assert!(!is_group_root(1, &fan_out, 0));
        assert!(is_group_root(4, &fan_out, 0));
        assert!(is_group_root(0, &fan_out, 1));
    }

    #[test]
    fn tree_communicator_rejects_mismatched_edge_count() {
        let fan_out = vec![4, 4];
        let edges = vec![ChannelFabric::new()];
        assert!(TreeCommunicator::new(fan_out, edges).is_err());
    }

    #[test]
    fn tree_communicator_exchanges_per_level() {
        let fan_out = vec![4];
        let edges = vec![ChannelFabric::new()];
        let mut tree = TreeCommunicator::new(fan_out, edges).unwrap();
        let sample = SampleMessage { region_id: 1, runtime: 1.0, progress: 0.1, energy: 5.0, frequency: 2000.0 };
        tree.send_sample(0, sample).unwrap();
        match tree.receive_sample(0).unwrap() {
            FabricStatus::Ready(got) => assert_eq!(got, sample),
            FabricStatus::WouldBlock => panic!("expected a sample"),
        }
    }
}
