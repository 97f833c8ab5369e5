//! Coordinator-side error types

use stampede_core::Address;
use stampede_dispatch::DispatchError;
use stampede_registry::RegistryError;
use stampede_report::ReportError;
use stampede_resilience::Retryable;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("inventory has no hosts")]
    EmptyInventory,

    #[error("could not connect to agent {agent} at {endpoint}: {reason}")]
    AgentConnect {
        agent: Address,
        endpoint: String,
        reason: String,
    },

    #[error("agent {agent} refused init: {reason}")]
    InitRejected { agent: Address, reason: String },

    #[error("no live agents to host workers")]
    NoLiveAgents,

    #[error("agent {agent} could not spawn its workers: {reason}")]
    ProvisionFailed { agent: Address, reason: String },

    #[error("no live workers available for suite '{suite}'")]
    NoWorkers { suite: String },

    #[error("no worker accepted test {test_id}")]
    CreateRejected { test_id: u32 },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Connection attempts are worth repeating; everything else fails fast.
impl Retryable for CoordinatorError {
    fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::AgentConnect { .. })
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
