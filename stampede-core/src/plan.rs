//! Test run plans
//!
//! A plan names the registered suite to execute, the opaque parameter map
//! handed to its hooks, the size of the RUN task group and the budget that
//! ends the RUN phase.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Termination budget for the RUN phase.
///
/// Duration budgets are enforced by the coordinator, which broadcasts a stop
/// signal when the wall-clock budget elapses. Iteration budgets are enforced
/// worker-side: the count is the total across the worker's RUN task group,
/// not per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunBudget {
    Duration { secs: u64 },
    Iterations { count: u64 },
}

impl RunBudget {
    pub fn duration(value: Duration) -> RunBudget {
        RunBudget::Duration {
            secs: value.as_secs(),
        }
    }

    pub fn iterations(count: u64) -> RunBudget {
        RunBudget::Iterations { count }
    }

    /// The wall-clock budget, when duration based.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            RunBudget::Duration { secs } => Some(Duration::from_secs(*secs)),
            RunBudget::Iterations { .. } => None,
        }
    }

    /// The iteration budget, when iteration based.
    pub fn iteration_count(&self) -> Option<u64> {
        match self {
            RunBudget::Duration { .. } => None,
            RunBudget::Iterations { count } => Some(*count),
        }
    }
}

fn default_run_threads() -> usize {
    1
}

/// Everything a worker needs to instantiate and drive one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlan {
    /// Name of the suite in the worker's catalog.
    pub suite: String,
    /// Opaque key/value parameters exposed through the test context.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Number of concurrent RUN tasks per worker.
    #[serde(default = "default_run_threads")]
    pub run_threads: usize,
    pub budget: RunBudget,
}

impl TestPlan {
    pub fn new(suite: impl Into<String>, budget: RunBudget) -> TestPlan {
        TestPlan {
            suite: suite.into(),
            params: BTreeMap::new(),
            run_threads: default_run_threads(),
            budget,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> TestPlan {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_run_threads(mut self, threads: usize) -> TestPlan {
        self.run_threads = threads.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_accessors() {
        let budget = RunBudget::duration(Duration::from_secs(30));
        assert_eq!(budget.as_duration(), Some(Duration::from_secs(30)));
        assert_eq!(budget.iteration_count(), None);

        let budget = RunBudget::iterations(500);
        assert_eq!(budget.iteration_count(), Some(500));
        assert_eq!(budget.as_duration(), None);
    }

    #[test]
    fn test_plan_defaults_and_builders() {
        let plan = TestPlan::new("atomic_long", RunBudget::iterations(100))
            .with_param("key_count", "1000")
            .with_run_threads(4);
        assert_eq!(plan.run_threads, 4);
        assert_eq!(plan.params.get("key_count").map(String::as_str), Some("1000"));

        let json = serde_json::to_string(&plan).unwrap();
        let decoded: TestPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, plan);
    }

    #[test]
    fn test_run_threads_never_zero() {
        let plan = TestPlan::new("t", RunBudget::iterations(1)).with_run_threads(0);
        assert_eq!(plan.run_threads, 1);
    }
}
