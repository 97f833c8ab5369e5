//! Core domain models and types for Stampede
//!
//! This crate contains the fundamental types used throughout the
//! orchestration system: hierarchical component addresses, test lifecycle
//! phases, run plans, worker settings and the latency histogram value type.
//! It has minimal dependencies and defines the domain language of the
//! application.

pub mod address;
pub mod histogram;
pub mod phase;
pub mod plan;
pub mod settings;

// Re-export commonly used types at the crate root
pub use address::{Address, AddressIndex, AddressLevel, AddressParseError};
pub use histogram::{merge_interval_streams, IntervalHistogram, LatencyHistogram};
pub use phase::{PhaseOutcome, RunStatus, TestPhase};
pub use plan::{RunBudget, TestPlan};
pub use settings::{WorkerKind, WorkerProcessSettings};
