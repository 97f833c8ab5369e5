//! Agent node: worker supervision for one machine
//!
//! The agent is the middle tier of the component tree. It accepts a
//! coordinator session, adopts the address the coordinator assigns, spawns
//! and supervises the worker processes on its machine, and relays
//! operations downward and reports upward through its dispatcher.

pub mod error;
pub mod launcher;
pub mod runtime;
pub mod supervisor;

pub use error::{AgentError, AgentResult};
pub use launcher::{
    describe_exit, LaunchedWorker, ProcessLauncher, WorkerControl, WorkerExit, WorkerLauncher,
};
pub use runtime::{AgentRuntime, AgentRuntimeSettings};
pub use supervisor::{SupervisorSettings, WorkerSupervisor};
