//! Coordinator node: cluster bootstrap and run orchestration
//!
//! The coordinator is the root of the component tree. It connects the
//! agents named in an inventory, provisions worker processes across them,
//! and drives test runs through the lifecycle engine while folding upward
//! reports into the result aggregator. [`LocalCluster`] runs the same
//! stack inside one process for single-machine use.

pub mod coordinator;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod lifecycle;
pub mod local;

pub use coordinator::{
    AgentConnector, Coordinator, CoordinatorSettings, TcpConnector, WorkerLayout,
};
pub use error::{CoordinatorError, CoordinatorResult};
pub use handler::CoordinatorHandler;
pub use heartbeat::{HeartbeatMonitor, HeartbeatSettings};
pub use lifecycle::{LifecycleEngine, RunEvent, RunEventBus, TestRunState};
pub use local::{InProcessLauncher, LocalCluster};
