//! Per-region, per-level rolling aggregate of samples (spec section 4.3),
//! grounded in shape on the teacher's bounded `RingBuffer` in
//! `metrics/series.rs` — aggregation here is pure and never decides
//! policy itself.

use std::collections::VecDeque;

use crate::message::SampleMessage;
use crate::policy::Policy;

/// Fixed-capacity ring buffer: the concrete choice behind spec section
/// 3's "bounded history" for `aggregate_samples`.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// Derived telemetry for one region at one level: summed energy, max
/// runtime, mean frequency across the most recent contribution from
/// each child. The decider, not the region, turns this into policy.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegionTelemetry {
    pub total_energy: f64,
    pub max_runtime: f64,
    pub mean_frequency: f64,
    pub mean_progress: f64,
    pub num_children: usize,
}

/// Controller lifecycle state for a region (spec section 4.7):
/// UNOBSERVED on creation, ACTIVE on first sample, SHUTDOWN terminal on
/// receipt of a shutdown policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Unobserved,
    Active,
    Shutdown,
}

/// Per `(region_id, level)` aggregate and policy state. Created lazily on
/// first observation, destroyed with the owning [`crate::controller::Controller`].
pub struct Region {
    pub region_id: u64,
    pub state: RegionState,
    history: RingBuffer<RegionTelemetry>,
    latest: Vec<SampleMessage>,
    pub current_policy: Policy,
    pub last_policy_version: u64,
}

const DEFAULT_HISTORY_CAPACITY: usize = 64;

impl Region {
    pub fn new(region_id: u64, num_domain: usize) -> Self {
        Region {
            region_id,
            state: RegionState::Unobserved,
            history: RingBuffer::new(DEFAULT_HISTORY_CAPACITY),
            latest: Vec::new(),
            current_policy: Policy::new(num_domain),
            last_policy_version: 0,
        }
    }

    /// Inserts this period's per-child sample bundle, replacing the
    /// previous one, and transitions UNOBSERVED → ACTIVE on first call.
    pub fn insert(&mut self, child_samples: Vec<SampleMessage>) {
        if self.state == RegionState::Unobserved {
            self.state = RegionState::Active;
        }
        let telemetry = aggregate(&child_samples);
        self.history.push(telemetry);
        self.latest = child_samples;
    }

    pub fn telemetry(&self) -> RegionTelemetry {
        self.history.iter().last().copied().unwrap_or_default()
    }

    pub fn history(&self) -> &RingBuffer<RegionTelemetry> {
        &self.history
    }

    pub fn latest_samples(&self) -> &[SampleMessage] {
        &self.latest
    }

    pub fn mark_shutdown(&mut self) {
        self.state = RegionState::Shutdown;
    }
}

fn aggregate(samples: &[SampleMessage]) -> RegionTelemetry {
    if samples.is_empty() {
        return RegionTelemetry::default();
    }
    let total_energy: f64 = samples.iter().map(|s| s.energy).sum();
    let max_runtime = samples.iter().map(|s| s.runtime).fold(f64::MIN, f64::max);
    let mean_frequency: f64 = samples.iter().map(|s| s.frequency).sum::<f64>() / samples.len() as f64;
    let mean_progress: f64 = samples.iter().map(|s| s.progress).sum::<f64>() / samples.len() as f64;
    RegionTelemetry {
        total_energy,
        max_runtime,
        mean_frequency,
        mean_progress,
        num_children: samples.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(region_id: u64, energy: f64, runtime: f64, frequency: f64) -> SampleMessage {
        SampleMessage { region_id, runtime, progress: 0.5, energy, frequency }
    }

    #[test]
    fn insert_transitions_unobserved_to_active() {
        let mut region = Region::new(1, 4);
        assert_eq!(region.state, RegionState::Unobserved);
        region.insert(vec![sample(1, 10.0, 1.0, 2000.0)]);
        assert_eq!(region.state, RegionState::Active);
    }

    #[test]
    fn aggregate_sums_energy_and_maxes_runtime() {
        let mut region = Region::new(1, 4);
        region.insert(vec![
            sample(1, 10.0, 1.0, 2000.0),
            sample(1, 20.0, 3.0, 2200.0),
        ]);
        let telemetry = region.telemetry();
        assert_eq!(telemetry.total_energy, 30.0);
        assert_eq!(telemetry.max_runtime, 3.0);
        assert_eq!(telemetry.mean_frequency, 2100.0);
        assert_eq!(telemetry.num_children, 2);
    }

    #[test]
    fn history_is_bounded() {
        let mut region = Region::new(1, 4);
        for i in 0..(DEFAULT_HISTORY_CAPACITY + 10) {
            region.insert(vec![sample(1, i as f64, 1.0, 2000.0)]);
        }
        assert_eq!(region.history().len(), DEFAULT_HISTORY_CAPACITY);
    }

    #[test]
    fn shutdown_is_terminal() {
        let mut region = Region::new(1, 4);
        region.mark_shutdown();
        assert_eq!(region.state, RegionState::Shutdown);
    }
}
