//! Coordinator configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use stampede_resilience::RetryPolicy;
use std::time::Duration;

use super::utils::serde_duration;

/// Configuration for the coordinator node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Port agents listen on
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// Timeout for establishing one agent connection
    #[serde(with = "serde_duration", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Retry policy for agent connection attempts
    #[serde(default = "default_connect_retry")]
    pub connect_retry: RetryPolicy,

    /// Interval between liveness pings to each agent
    #[serde(with = "serde_duration", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Consecutive missed pings before an agent is marked unreachable
    #[serde(default = "default_heartbeat_miss_threshold")]
    pub heartbeat_miss_threshold: u32,
}

fn default_agent_port() -> u16 {
    9500
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_retry() -> RetryPolicy {
    RetryPolicy::linear(3, Duration::from_secs(2))
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_miss_threshold() -> u32 {
    3
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            agent_port: default_agent_port(),
            connect_timeout: default_connect_timeout(),
            connect_retry: default_connect_retry(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_miss_threshold: default_heartbeat_miss_threshold(),
        }
    }
}

impl Validatable for CoordinatorConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.agent_port, "agent_port", self.domain_name())?;
        validate_positive(
            self.heartbeat_miss_threshold,
            "heartbeat_miss_threshold",
            self.domain_name(),
        )?;
        if self.heartbeat_interval.is_zero() {
            return Err(self.validation_error("heartbeat_interval must be greater than 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(self.validation_error("connect_timeout must be greater than 0"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "coordinator"
    }
}
