//! Configuration loading and environment variable handling

use crate::domains::StampedeConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "STAMPEDE".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<StampedeConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: StampedeConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<StampedeConfig> {
        let mut config = StampedeConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<StampedeConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut StampedeConfig) -> ConfigResult<()> {
        self.apply_agent_overrides(&mut config.agent)?;
        self.apply_dispatch_overrides(&mut config.dispatch)?;
        self.apply_lifecycle_overrides(&mut config.lifecycle)?;
        self.apply_report_overrides(&mut config.report)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply agent config overrides
    fn apply_agent_overrides(
        &self,
        config: &mut crate::domains::agent::AgentConfig,
    ) -> ConfigResult<()> {
        if let Ok(bind) = self.get_env_var("AGENT_BIND_ADDRESS") {
            config.bind_address = bind;
        }

        if let Ok(port) = self.get_env_var("AGENT_PORT") {
            config.port = port
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid AGENT_PORT: {}", e)))?;
        }

        Ok(())
    }

    /// Apply dispatch config overrides
    fn apply_dispatch_overrides(
        &self,
        config: &mut crate::domains::dispatch::DispatchConfig,
    ) -> ConfigResult<()> {
        if let Ok(deadline) = self.get_env_var("ACK_DEADLINE_SECONDS") {
            let seconds: u64 = deadline.parse().map_err(|e| {
                ConfigError::EnvError(format!("Invalid ACK_DEADLINE_SECONDS: {}", e))
            })?;
            config.ack_deadline = std::time::Duration::from_secs(seconds);
        }

        Ok(())
    }

    /// Apply lifecycle config overrides
    fn apply_lifecycle_overrides(
        &self,
        config: &mut crate::domains::lifecycle::LifecycleConfig,
    ) -> ConfigResult<()> {
        if let Ok(abort) = self.get_env_var("ABORT_ON_FAILURE") {
            config.abort_on_failure = abort
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid ABORT_ON_FAILURE: {}", e)))?;
        }

        Ok(())
    }

    /// Apply report config overrides
    fn apply_report_overrides(
        &self,
        config: &mut crate::domains::report::ReportConfig,
    ) -> ConfigResult<()> {
        if let Ok(dir) = self.get_env_var("ARTIFACTS_DIR") {
            config.artifacts_dir = dir.into();
        }

        if let Ok(cap) = self.get_env_var("EXCEPTION_CAP") {
            config.exception_cap = cap
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid EXCEPTION_CAP: {}", e)))?;
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            use std::str::FromStr;
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            use std::str::FromStr;
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_file_parses_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "agent:\n  port: 7700\nreport:\n  exception_cap: 25\n"
        )
        .unwrap();

        let loader = ConfigLoader::with_prefix("STAMPEDE_TEST_UNSET");
        let config = loader.from_file(file.path()).unwrap();
        assert_eq!(config.agent.port, 7700);
        assert_eq!(config.report.exception_cap, 25);
        // Untouched domains keep their defaults
        assert_eq!(config.coordinator.agent_port, 9500);
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "report:\n  exception_cap: 0\n").unwrap();

        let loader = ConfigLoader::with_prefix("STAMPEDE_TEST_UNSET");
        assert!(loader.from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_override_applies() {
        // Unique prefix so parallel tests cannot observe each other's vars
        std::env::set_var("STAMPEDE_LOADER_A_AGENT_PORT", "7801");
        let loader = ConfigLoader::with_prefix("STAMPEDE_LOADER_A");
        let config = loader.from_env().unwrap();
        std::env::remove_var("STAMPEDE_LOADER_A_AGENT_PORT");
        assert_eq!(config.agent.port, 7801);
    }

    #[test]
    fn test_env_override_invalid_value() {
        std::env::set_var("STAMPEDE_LOADER_B_EXCEPTION_CAP", "lots");
        let loader = ConfigLoader::with_prefix("STAMPEDE_LOADER_B");
        let result = loader.from_env();
        std::env::remove_var("STAMPEDE_LOADER_B_EXCEPTION_CAP");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_without_path_uses_defaults() {
        let loader = ConfigLoader::with_prefix("STAMPEDE_TEST_UNSET");
        let config = loader.load(None::<&str>).unwrap();
        assert_eq!(config.report.exception_cap, 1000);
    }
}
