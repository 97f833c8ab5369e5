//! Result reporting configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for run artifacts and exception capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Directory run summaries and exception logs are written under
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,

    /// Maximum number of exceptions persisted per run; the rest are
    /// counted but not stored
    #[serde(default = "default_exception_cap")]
    pub exception_cap: usize,
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_exception_cap() -> usize {
    1000
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: default_artifacts_dir(),
            exception_cap: default_exception_cap(),
        }
    }
}

impl Validatable for ReportConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.artifacts_dir.as_os_str().is_empty() {
            return Err(self.validation_error("artifacts_dir cannot be empty"));
        }
        validate_positive(self.exception_cap, "exception_cap", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "report"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ReportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.exception_cap, 1000);
    }

    #[test]
    fn test_zero_cap_rejected() {
        let config = ReportConfig {
            exception_cap: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_dir_rejected() {
        let config = ReportConfig {
            artifacts_dir: PathBuf::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
