//! Daemon bring-up configuration: environment-variable bind address
//! plus the control-loop knobs that are not part of the operator-facing
//! [`crate::global_policy::GlobalPolicy`] (spec section 4.6). This is the
//! daemon's own runtime configuration, analogous to the teacher's
//! `DaemonConfig`/`SISCTL_BIND` handling in `config.rs`/`main.rs`.

use std::time::Duration;

use serde::Serialize;
use utoipa::ToSchema;

use crate::tree::DEFAULT_FAN_OUT;

/// Runtime configuration for one node's controller, loaded from
/// environment variables with the teacher's `std::env::var(...)
/// .unwrap_or_else(...)` style rather than a config-file parser — this
/// knob set is bring-up plumbing, not the GlobalPolicy wire format.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Address the operator HTTP surface binds to.
    pub bind_addr: String,

    /// Control period between successive `Controller::step` calls.
    #[serde(skip)]
    pub control_period: Duration,

    /// Maximum fanout per tree level (spec section 4.5 default: 16).
    pub max_fan_out: usize,

    /// Policy input descriptor string (file path or `/name` shared
    /// memory), parsed by [`crate::global_policy::PolicyDescriptor::parse`].
    pub policy_descriptor: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            bind_addr: "127.0.0.1:8910".to_string(),
            control_period: Duration::from_millis(100),
            max_fan_out: DEFAULT_FAN_OUT,
            policy_descriptor: "/pwrctl-policy".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Builds configuration from environment variables, falling back to
    /// [`RuntimeConfig::default`] for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = RuntimeConfig::default();

        if let Ok(addr) = std::env::var("PWRCTLD_BIND") {
            config.bind_addr = addr;
        }

        if let Ok(period_ms) = std::env::var("PWRCTLD_PERIOD_MS") {
            if let Ok(val) = period_ms.parse::<u64>() {
                config.control_period = Duration::from_millis(val);
            }
        }

        if let Ok(fan_out) = std::env::var("PWRCTLD_FAN_OUT") {
            if let Ok(val) = fan_out.parse::<usize>() {
                config.max_fan_out = val;
            }
        }

        if let Ok(descriptor) = std::env::var("PWRCTLD_POLICY") {
            config.policy_descriptor = descriptor;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_to_local_loopback() {
        let config = RuntimeConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8910");
        assert_eq!(config.max_fan_out, DEFAULT_FAN_OUT);
    }

    #[test]
    fn from_env_overrides_bind_addr() {
        std::env::set_var("PWRCTLD_BIND", "0.0.0.0:9000");
        let config = RuntimeConfig::from_env();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        std::env::remove_var("PWRCTLD_BIND");
    }
}
