//! Dispatch configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use stampede_resilience::RetryPolicy;
use std::time::Duration;

use super::utils::serde_duration;

/// Configuration for envelope delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-attempt deadline for receiving an ack
    #[serde(with = "serde_duration", default = "default_ack_deadline")]
    pub ack_deadline: Duration,

    /// Retry policy applied when an ack deadline elapses
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_ack_deadline() -> Duration {
    Duration::from_secs(10)
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_deadline: default_ack_deadline(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Validatable for DispatchConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.retry.max_attempts, "retry.max_attempts", self.domain_name())?;
        if self.ack_deadline.is_zero() {
            return Err(self.validation_error("ack_deadline must be greater than 0"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "dispatch"
    }
}
