//! Test lifecycle phases and run state
//!
//! A run walks the phase chain in canonical order; global phases execute on
//! exactly one designated worker while local phases fan out to every
//! participant. The enum declaration order is the execution order, so the
//! derived `Ord` can be used to assert monotonic progression.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// An executable phase of the test lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    LocalWarmup,
    GlobalWarmup,
    Run,
    LocalVerify,
    GlobalVerify,
    LocalTeardown,
    GlobalTeardown,
}

impl TestPhase {
    /// Every phase in canonical execution order.
    pub fn all() -> [TestPhase; 8] {
        [
            TestPhase::Setup,
            TestPhase::LocalWarmup,
            TestPhase::GlobalWarmup,
            TestPhase::Run,
            TestPhase::LocalVerify,
            TestPhase::GlobalVerify,
            TestPhase::LocalTeardown,
            TestPhase::GlobalTeardown,
        ]
    }

    /// Global phases run on the single designated worker only.
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            TestPhase::GlobalWarmup | TestPhase::GlobalVerify | TestPhase::GlobalTeardown
        )
    }

    /// Teardown phases still run (best effort) when a run is aborting.
    pub fn is_teardown(&self) -> bool {
        matches!(self, TestPhase::LocalTeardown | TestPhase::GlobalTeardown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestPhase::Setup => "setup",
            TestPhase::LocalWarmup => "local_warmup",
            TestPhase::GlobalWarmup => "global_warmup",
            TestPhase::Run => "run",
            TestPhase::LocalVerify => "local_verify",
            TestPhase::GlobalVerify => "global_verify",
            TestPhase::LocalTeardown => "local_teardown",
            TestPhase::GlobalTeardown => "global_teardown",
        }
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown test phase '{0}'")]
pub struct ParsePhaseError(String);

impl FromStr for TestPhase {
    type Err = ParsePhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestPhase::all()
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| ParsePhaseError(s.to_string()))
    }
}

/// Result of executing one phase on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Success,
    Failed { error: String },
    TimedOut,
    ProcessExited { error: String },
}

impl PhaseOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PhaseOutcome::Success)
    }
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseOutcome::Success => write!(f, "success"),
            PhaseOutcome::Failed { error } => write!(f, "failed: {error}"),
            PhaseOutcome::TimedOut => write!(f, "timed out"),
            PhaseOutcome::ProcessExited { error } => write!(f, "process exited: {error}"),
        }
    }
}

/// Overall status of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running { phase: TestPhase },
    Done,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Aborted)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Created => write!(f, "created"),
            RunStatus::Running { phase } => write!(f, "running[{phase}]"),
            RunStatus::Done => write!(f, "done"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_canonical() {
        let phases = TestPhase::all();
        for pair in phases.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        assert_eq!(phases[0], TestPhase::Setup);
        assert_eq!(phases[7], TestPhase::GlobalTeardown);
    }

    #[test]
    fn test_phase_string_round_trip() {
        for phase in TestPhase::all() {
            assert_eq!(phase.as_str().parse::<TestPhase>().unwrap(), phase);
        }
        assert!("warmup".parse::<TestPhase>().is_err());
    }

    #[test]
    fn test_global_scope() {
        assert!(TestPhase::GlobalWarmup.is_global());
        assert!(TestPhase::GlobalVerify.is_global());
        assert!(TestPhase::GlobalTeardown.is_global());
        assert!(!TestPhase::Run.is_global());
        assert!(!TestPhase::LocalTeardown.is_global());
    }

    #[test]
    fn test_outcome_serde_tags() {
        let json = serde_json::to_string(&PhaseOutcome::Failed {
            error: "boom".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"result\":\"failed\""));
        let outcome: PhaseOutcome = serde_json::from_str(&json).unwrap();
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Done.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
        assert!(!RunStatus::Running {
            phase: TestPhase::Run
        }
        .is_terminal());
    }
}
