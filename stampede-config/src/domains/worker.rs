//! Worker configuration

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::utils::serde_duration_ms;

/// Configuration for a worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How often probe recordings are rotated and shipped upward during the
    /// RUN phase
    #[serde(with = "serde_duration_ms", default = "default_probe_flush_interval")]
    pub probe_flush_interval: Duration,
}

fn default_probe_flush_interval() -> Duration {
    Duration::from_millis(1000)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            probe_flush_interval: default_probe_flush_interval(),
        }
    }
}

impl Validatable for WorkerConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.probe_flush_interval.is_zero() {
            return Err(self.validation_error("probe_flush_interval must be greater than 0"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "worker"
    }
}
