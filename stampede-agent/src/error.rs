//! Agent error types

use stampede_core::Address;
use stampede_dispatch::DispatchError;
use stampede_ipc::IpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to launch worker {worker}: {reason}")]
    LaunchFailed { worker: Address, reason: String },

    #[error("worker {worker} did not come up: {reason}")]
    StartupFailed { worker: Address, reason: String },

    #[error("cannot adopt address {0}: not a concrete agent address")]
    BadInitAddress(Address),

    #[error("session ended before an init operation arrived")]
    NoInit,

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub type AgentResult<T> = Result<T, AgentError>;
