//! Wire protocol definitions
//!
//! Every frame on a link is either an operation envelope or an ack. An
//! envelope travels from a concrete source toward a possibly wildcarded
//! destination; the correlation id ties the eventual ack (an AND-aggregate
//! over every reached leaf) back to its request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use stampede_core::{Address, IntervalHistogram, PhaseOutcome, TestPhase, TestPlan, WorkerProcessSettings};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Launch instruction for one worker within a spawn request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPlan {
    pub address: Address,
    pub settings: WorkerProcessSettings,
}

/// Operations exchanged across the component tree, both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    // Coordinator -> agent / worker
    InitAgent,
    SpawnWorkers {
        workers: Vec<WorkerPlan>,
    },
    TerminateWorkers {
        grace_secs: u64,
    },
    /// Graceful stop for a single worker process.
    Terminate,
    Ping,
    CreateTest {
        test_id: u32,
        plan: TestPlan,
    },
    StartPhase {
        test_id: u32,
        phase: TestPhase,
    },
    StopRun {
        test_id: u32,
    },
    AbortRun {
        test_id: u32,
        reason: String,
    },

    // Worker / agent -> coordinator
    WorkerReady,
    PhaseCompleted {
        test_id: u32,
        phase: TestPhase,
        outcome: PhaseOutcome,
    },
    ProbeReport {
        test_id: u32,
        probe: String,
        interval: IntervalHistogram,
    },
    ExceptionReport {
        test_id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<TestPhase>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace: Option<String>,
    },
    ProcessExited {
        worker: Address,
        exit_code: Option<i32>,
        last_output: Vec<String>,
    },
}

impl Operation {
    /// Stable name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::InitAgent => "init_agent",
            Operation::SpawnWorkers { .. } => "spawn_workers",
            Operation::TerminateWorkers { .. } => "terminate_workers",
            Operation::Terminate => "terminate",
            Operation::Ping => "ping",
            Operation::CreateTest { .. } => "create_test",
            Operation::StartPhase { .. } => "start_phase",
            Operation::StopRun { .. } => "stop_run",
            Operation::AbortRun { .. } => "abort_run",
            Operation::WorkerReady => "worker_ready",
            Operation::PhaseCompleted { .. } => "phase_completed",
            Operation::ProbeReport { .. } => "probe_report",
            Operation::ExceptionReport { .. } => "exception_report",
            Operation::ProcessExited { .. } => "process_exited",
        }
    }
}

/// An addressed operation with its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEnvelope {
    pub correlation_id: Uuid,
    pub source: Address,
    pub destination: Address,
    pub reply_expected: bool,
    pub operation: Operation,
}

impl OperationEnvelope {
    /// An envelope whose delivery must be acked.
    pub fn request(source: Address, destination: Address, operation: Operation) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            source,
            destination,
            reply_expected: true,
            operation,
        }
    }

    /// A fire-and-forget envelope (reports, notifications).
    pub fn notification(source: Address, destination: Address, operation: Operation) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            source,
            destination,
            reply_expected: false,
            operation,
        }
    }
}

/// Per-leaf result of delivering an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AckOutcome {
    Success,
    /// The operation ran remotely and failed.
    Error { message: String },
    /// No ack within the retry budget. Distinct from a remote failure.
    TimedOut,
    /// No route to the address, or the link below it is gone.
    Unreachable { message: String },
}

impl AckOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AckOutcome::Success)
    }
}

/// Aggregated ack for one envelope: one outcome per reached leaf, keyed by
/// the leaf (or failing branch) address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationAck {
    pub correlation_id: Uuid,
    pub outcomes: BTreeMap<Address, AckOutcome>,
}

impl OperationAck {
    pub fn new(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn single(correlation_id: Uuid, address: Address, outcome: AckOutcome) -> Self {
        let mut ack = Self::new(correlation_id);
        ack.outcomes.insert(address, outcome);
        ack
    }

    pub fn success(correlation_id: Uuid, address: Address) -> Self {
        Self::single(correlation_id, address, AckOutcome::Success)
    }

    pub fn record(&mut self, address: Address, outcome: AckOutcome) {
        self.outcomes.insert(address, outcome);
    }

    /// Union another ack's outcomes into this one.
    pub fn merge(&mut self, other: OperationAck) {
        self.outcomes.extend(other.outcomes);
    }

    /// AND-aggregate: true only when every leaf succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(AckOutcome::is_success)
    }

    /// The addresses that did not succeed, with their outcomes.
    pub fn failures(&self) -> Vec<(&Address, &AckOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .collect()
    }
}

/// A single unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Operation(OperationEnvelope),
    Ack(OperationAck),
}

/// Message envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub protocol_version: u32,
    pub sent_at: DateTime<Utc>,
    pub frame: Frame,
}

impl WireEnvelope {
    pub fn new(frame: Frame) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            sent_at: Utc::now(),
            frame,
        }
    }

    /// Check if this envelope is compatible with the current protocol version
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }
}
