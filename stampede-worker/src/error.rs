//! Worker runtime errors

use stampede_core::{Address, TestPhase};
use stampede_dispatch::DispatchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("unknown test suite '{0}'")]
    UnknownSuite(String),

    #[error("unknown test instance {0}")]
    UnknownTest(u32),

    #[error("test {test_id} is aborted, refusing phase {phase}")]
    PhaseAfterAbort { test_id: u32, phase: TestPhase },

    #[error("{0} cannot host test instances")]
    NotAWorkerAddress(Address),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
