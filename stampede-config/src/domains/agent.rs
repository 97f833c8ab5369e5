//! Agent configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::utils::serde_duration;

/// Configuration for an agent node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Address the agent listens on for the coordinator
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Listening port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Binary to launch workers with. Defaults to the agent's own executable
    /// (re-invoked in worker mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_binary: Option<PathBuf>,

    /// How long a spawned worker may take to announce readiness
    #[serde(with = "serde_duration", default = "default_worker_startup_timeout")]
    pub worker_startup_timeout: Duration,

    /// Grace period between a terminate request and a hard kill
    #[serde(with = "serde_duration", default = "default_worker_grace_timeout")]
    pub worker_grace_timeout: Duration,

    /// Number of trailing worker output lines kept for failure reports
    #[serde(default = "default_output_capture_lines")]
    pub output_capture_lines: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9500
}

fn default_worker_startup_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_worker_grace_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_output_capture_lines() -> usize {
    40
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            worker_binary: None,
            worker_startup_timeout: default_worker_startup_timeout(),
            worker_grace_timeout: default_worker_grace_timeout(),
            output_capture_lines: default_output_capture_lines(),
        }
    }
}

impl Validatable for AgentConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.bind_address, "bind_address", self.domain_name())?;
        validate_positive(self.port, "port", self.domain_name())?;
        validate_positive(
            self.output_capture_lines,
            "output_capture_lines",
            self.domain_name(),
        )?;
        if self.worker_startup_timeout.is_zero() {
            return Err(self.validation_error("worker_startup_timeout must be greater than 0"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "agent"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_bind_address_rejected() {
        let config = AgentConfig {
            bind_address: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
