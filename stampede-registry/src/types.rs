//! Registry record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stampede_core::{Address, WorkerProcessSettings};
use std::collections::BTreeMap;
use std::fmt;

/// Liveness of one registered component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    /// Registered but not yet confirmed up
    Pending,
    /// Confirmed running and responsive
    Alive,
    /// Missed enough heartbeats to be considered gone, may still recover
    Unreachable,
    /// Gone for good
    Terminated,
}

impl LivenessState {
    /// Whether the component can be given work
    pub fn is_live(&self) -> bool {
        matches!(self, LivenessState::Alive)
    }

    /// Whether the component is permanently out of the cluster
    pub fn is_terminal(&self) -> bool {
        matches!(self, LivenessState::Terminated)
    }
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LivenessState::Pending => "pending",
            LivenessState::Alive => "alive",
            LivenessState::Unreachable => "unreachable",
            LivenessState::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// One registered agent and the workers it hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent-level address, allocated by the registry
    pub address: Address,
    /// Address the coordinator dials
    pub public_ip: String,
    /// Address workers and peers use within the cluster network
    pub private_ip: String,
    /// Current liveness
    pub state: LivenessState,
    /// Workers hosted on this agent, keyed by worker address
    pub workers: BTreeMap<Address, WorkerRecord>,
    /// Next worker index to hand out on this agent
    pub(crate) next_worker: u32,
    /// When the agent was registered
    pub registered_at: DateTime<Utc>,
    /// Last time the agent was heard from
    pub last_seen: DateTime<Utc>,
}

impl AgentRecord {
    pub(crate) fn new(address: Address, public_ip: String, private_ip: String) -> Self {
        let now = Utc::now();
        Self {
            address,
            public_ip,
            private_ip,
            state: LivenessState::Pending,
            workers: BTreeMap::new(),
            next_worker: 1,
            registered_at: now,
            last_seen: now,
        }
    }

    /// Workers on this agent that can currently be given work
    pub fn live_workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values().filter(|w| w.state.is_live())
    }
}

/// One registered worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Worker-level address, allocated by the registry
    pub address: Address,
    /// Process settings the worker was (or will be) launched with
    pub settings: WorkerProcessSettings,
    /// Current liveness
    pub state: LivenessState,
    /// When the worker was registered
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub(crate) fn new(address: Address, settings: WorkerProcessSettings) -> Self {
        Self {
            address,
            settings,
            state: LivenessState::Pending,
            registered_at: Utc::now(),
        }
    }
}
