//! Domain-specific configuration modules

pub mod agent;
pub mod coordinator;
pub mod dispatch;
pub mod lifecycle;
pub mod logging;
pub mod report;
pub mod utils;
pub mod worker;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Stampede configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StampedeConfig {
    /// Coordinator configuration
    #[serde(default)]
    pub coordinator: coordinator::CoordinatorConfig,

    /// Agent configuration
    #[serde(default)]
    pub agent: agent::AgentConfig,

    /// Worker configuration
    #[serde(default)]
    pub worker: worker::WorkerConfig,

    /// Operation dispatch configuration
    #[serde(default)]
    pub dispatch: dispatch::DispatchConfig,

    /// Test lifecycle configuration
    #[serde(default)]
    pub lifecycle: lifecycle::LifecycleConfig,

    /// Result reporting configuration
    #[serde(default)]
    pub report: report::ReportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl StampedeConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.coordinator.validate()?;
        self.agent.validate()?;
        self.worker.validate()?;
        self.dispatch.validate()?;
        self.lifecycle.validate()?;
        self.report.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = StampedeConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
