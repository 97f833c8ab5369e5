//! Component registry and host inventory for Stampede
//!
//! The coordinator keeps one [`ComponentRegistry`] as the authoritative view
//! of the cluster: which agents exist, which workers run on them, and the
//! liveness of each. Addresses are allocated here and nowhere else, so the
//! hierarchy stays dense and deterministic across a run.

pub mod error;
pub mod inventory;
pub mod registry;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use inventory::{HostEntry, Inventory};
pub use registry::{ComponentRegistry, RegistryCounts};
pub use types::{AgentRecord, LivenessState, WorkerRecord};
