//! Worker-side test execution for Stampede
//!
//! A worker process hosts test instances: suites registered through
//! [`TestSuiteBuilder`] bind async hooks to lifecycle phases, and each
//! `CreateTest` operation instantiates a [`TestContainer`] that executes
//! those hooks phase by phase inside a structured task group. RUN-phase
//! latency samples flow through [`Probe`]s and ship upward as interval
//! histograms. [`WorkerRuntime`] ties it together over the stdio (or
//! in-process) link toward the supervising agent.

pub mod container;
pub mod context;
pub mod error;
pub mod probe;
pub mod runtime;
pub mod suite;

pub use container::TestContainer;
pub use context::TestContext;
pub use error::{WorkerError, WorkerResult};
pub use probe::{Probe, ProbeSet, ProbeTimer};
pub use runtime::{WorkerRuntime, WorkerRuntimeSettings};
pub use suite::{HookError, HookResult, SuiteCatalog, TestSuite, TestSuiteBuilder};
