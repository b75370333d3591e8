//! Leaf and tree deciders (spec section 4.4): pure functions from
//! observations and incoming policy to an actuation or a per-child
//! policy split. The core pins only the trait contracts; concrete
//! deciders are selected by [`leaf_decider_for_mode`] /
//! [`tree_decider_for_mode`], keyed on [`Mode`].

use crate::error::{ErrorCode, Result};
use crate::policy::{Mode, Policy};
use crate::pwrctl_err;
use crate::region::RegionTelemetry;

/// One leaf actuation: a frequency target plus the PKG/DRAM power caps
/// to apply, handed to `Platform::tdp_limit` / `Platform::manual_frequency`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Actuation {
    pub frequency_mhz: u32,
    pub tdp_percent: u32,
}

/// `decide(region, policy_in) -> actuation`, called once per step per
/// active region at level 0. Pure except for its own EWMA state.
pub trait LeafDecider {
    fn decide(&mut self, telemetry: &RegionTelemetry, policy_in: &Policy) -> Result<Actuation>;
}

/// `decide(level, children_samples, policy_in) -> children_policy_out[k]`,
/// called once per step per active region at levels >= 1. Must split the
/// incoming budget across `k` children summing to the incoming budget
/// within +/-1 W.
pub trait TreeDecider {
    fn decide(
        &mut self,
        children_telemetry: &[RegionTelemetry],
        policy_in: &Policy,
    ) -> Result<Vec<f64>>;
}

/// Splits `policy_in.budget_watts` evenly across all children, rounding
/// the last share so the sum matches the input exactly (spec testable
/// property 4 / Scenario S4).
#[derive(Debug, Default)]
pub struct UniformTreeDecider;

impl TreeDecider for UniformTreeDecider {
    fn decide(&mut self, children_telemetry: &[RegionTelemetry], policy_in: &Policy) -> Result<Vec<f64>> {
        let k = children_telemetry.len();
        if k == 0 {
            return Err(pwrctl_err!(ErrorCode::Invalid, "tree decider called with zero children"));
        }
        let budget = policy_in.budget_watts;
        let share = budget / k as f64;
        let mut out = vec![share; k];
        let rounding_error = budget - out.iter().sum::<f64>();
        *out.last_mut().unwrap() += rounding_error;
        Ok(out)
    }
}

/// Exponentially-weighted moving average over the incoming budget-derived
/// frequency target, damping step-to-step oscillation. `alpha` is the
/// smoothing factor; the first observation is taken verbatim.
#[derive(Debug)]
pub struct EwmaLeafDecider {
    alpha: f64,
    smoothed_mhz: Option<f64>,
}

impl EwmaLeafDecider {
    pub fn new(alpha: f64) -> Self {
        EwmaLeafDecider { alpha, smoothed_mhz: None }
    }
}

impl Default for EwmaLeafDecider {
    fn default() -> Self {
        EwmaLeafDecider::new(0.5)
    }
}

impl LeafDecider for EwmaLeafDecider {
    fn decide(&mut self, _telemetry: &RegionTelemetry, policy_in: &Policy) -> Result<Actuation> {
        if policy_in.is_shutdown() {
            return Ok(Actuation { frequency_mhz: 0, tdp_percent: 0 });
        }
        let target_mhz = policy_in.flags.frequency_mhz() as f64;
        let next = match self.smoothed_mhz {
            None => target_mhz,
            Some(prev) => self.alpha * target_mhz + (1.0 - self.alpha) * prev,
        };
        self.smoothed_mhz = Some(next);
        Ok(Actuation {
            frequency_mhz: next.round() as u32,
            tdp_percent: policy_in.flags.tdp_percent(),
        })
    }
}

pub fn leaf_decider_for_mode(_mode: Mode) -> Box<dyn LeafDecider + Send> {
    Box::new(EwmaLeafDecider::default())
}

pub fn tree_decider_for_mode(_mode: Mode) -> Box<dyn TreeDecider + Send> {
    Box::new(UniformTreeDecider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Flags;

    fn telemetry() -> RegionTelemetry {
        RegionTelemetry { total_energy: 0.0, max_runtime: 0.0, mean_frequency: 0.0, mean_progress: 0.0, num_children: 1 }
    }

    #[test]
    fn uniform_tree_decider_splits_within_rounding() {
        let mut decider = UniformTreeDecider;
        let children: Vec<RegionTelemetry> = (0..16).map(|_| telemetry()).collect();
        let mut policy = Policy::new(16);
        policy.budget_watts = 1000.0;
        let out = decider.decide(&children, &policy).unwrap();
        assert_eq!(out.len(), 16);
        for share in &out {
            assert!((share - 62.5).abs() <= 1.0, "share {share} out of tolerance");
        }
        let sum: f64 = out.iter().sum();
        assert!((sum - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn uniform_tree_decider_rejects_zero_children() {
        let mut decider = UniformTreeDecider;
        let policy = Policy::new(0);
        assert!(decider.decide(&[], &policy).is_err());
    }

    #[test]
    fn ewma_leaf_decider_tracks_target_with_damping() {
        let mut decider = EwmaLeafDecider::new(0.5);
        let mut policy = Policy::new(1);
        policy.mode = Mode::FreqUniformStatic;
        let mut flags = Flags::default();
        flags.set_frequency_mhz(2000);
        policy.flags = flags;

        let first = decider.decide(&telemetry(), &policy).unwrap();
        assert_eq!(first.frequency_mhz, 2000);

        flags.set_frequency_mhz(3000);
        policy.flags = flags;
        let second = decider.decide(&telemetry(), &policy).unwrap();
        assert_eq!(second.frequency_mhz, 2500);
    }

    #[test]
    fn ewma_leaf_decider_shutdown_zeroes_actuation() {
        let mut decider = EwmaLeafDecider::default();
        let mut policy = Policy::new(1);
        policy.mode = Mode::Shutdown;
        let actuation = decider.decide(&telemetry(), &policy).unwrap();
        assert_eq!(actuation.frequency_mhz, 0);
        assert_eq!(actuation.tdp_percent, 0);
    }
}
