//! Test lifecycle configuration

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::utils::{default_false, serde_duration_option};

/// Configuration for the test lifecycle engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Abort the whole run on the first failed phase outcome
    #[serde(default = "default_false")]
    pub abort_on_failure: bool,

    /// Optional ceiling on how long the engine waits for one phase's
    /// completions; stragglers beyond it are recorded as timed out
    #[serde(with = "serde_duration_option", default)]
    pub phase_timeout: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            abort_on_failure: false,
            phase_timeout: None,
        }
    }
}

impl Validatable for LifecycleConfig {
    fn validate(&self) -> ConfigResult<()> {
        if let Some(timeout) = self.phase_timeout {
            if timeout.is_zero() {
                return Err(self.validation_error("phase_timeout must be greater than 0"));
            }
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "lifecycle"
    }
}
