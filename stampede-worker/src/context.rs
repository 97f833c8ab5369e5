//! Hook-facing view of a running test instance

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use stampede_core::{Address, RunBudget};

use crate::probe::{Probe, ProbeSet};

/// Stop flag and iteration budget for one test instance's RUN phase.
///
/// The budget is shared across the whole RUN task group: each
/// [`TestContext::keep_running`] call claims one iteration, so the group
/// collectively performs exactly the budgeted count.
#[derive(Debug, Default)]
pub(crate) struct RunGate {
    stopped: AtomicBool,
    remaining: Option<AtomicU64>,
}

impl RunGate {
    pub(crate) fn for_budget(budget: &RunBudget) -> RunGate {
        RunGate {
            stopped: AtomicBool::new(false),
            remaining: budget.iteration_count().map(AtomicU64::new),
        }
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn claim_iteration(&self) -> bool {
        match &self.remaining {
            None => true,
            Some(remaining) => remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
        }
    }
}

/// Handed to every hook invocation; cheap to clone.
#[derive(Clone)]
pub struct TestContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    address: Address,
    test_id: u32,
    params: BTreeMap<String, String>,
    gate: Arc<RunGate>,
    probes: Arc<ProbeSet>,
}

impl TestContext {
    pub(crate) fn new(
        address: Address,
        test_id: u32,
        params: BTreeMap<String, String>,
        gate: Arc<RunGate>,
        probes: Arc<ProbeSet>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                address,
                test_id,
                params,
                gate,
                probes,
            }),
        }
    }

    /// Address of this test instance (`C_Ax_Wy_Tz`).
    pub fn address(&self) -> Address {
        self.inner.address
    }

    pub fn test_id(&self) -> u32 {
        self.inner.test_id
    }

    /// A parameter from the test plan.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.inner.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.inner.params
    }

    /// Gate for RUN loops: `while ctx.keep_running() { ... }`.
    ///
    /// Returns `false` once the run was stopped (duration budget elapsed,
    /// stop or abort received) or the shared iteration budget is consumed.
    /// In iteration mode every `true` claims one iteration, so call it once
    /// per unit of work.
    pub fn keep_running(&self) -> bool {
        !self.inner.gate.is_stopped() && self.inner.gate.claim_iteration()
    }

    /// Get-or-create the named latency probe.
    pub fn probe(&self, name: &str) -> Probe {
        self.inner.probes.probe(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn context_with_budget(budget: RunBudget) -> TestContext {
        TestContext::new(
            Address::test(1, 1, 1),
            1,
            BTreeMap::new(),
            Arc::new(RunGate::for_budget(&budget)),
            Arc::new(ProbeSet::new()),
        )
    }

    #[test]
    fn test_iteration_budget_is_claimed_exactly() {
        let ctx = context_with_budget(RunBudget::iterations(3));
        assert!(ctx.keep_running());
        assert!(ctx.keep_running());
        assert!(ctx.keep_running());
        assert!(!ctx.keep_running());
        assert!(!ctx.keep_running());
    }

    #[test]
    fn test_budget_is_shared_across_clones() {
        let ctx = context_with_budget(RunBudget::iterations(2));
        let other = ctx.clone();
        assert!(ctx.keep_running());
        assert!(other.keep_running());
        assert!(!ctx.keep_running());
        assert!(!other.keep_running());
    }

    #[test]
    fn test_duration_mode_runs_until_stopped() {
        let gate = Arc::new(RunGate::for_budget(&RunBudget::duration(
            Duration::from_secs(5),
        )));
        let ctx = TestContext::new(
            Address::test(1, 1, 1),
            1,
            BTreeMap::new(),
            Arc::clone(&gate),
            Arc::new(ProbeSet::new()),
        );
        assert!(ctx.keep_running());
        assert!(ctx.keep_running());
        gate.stop();
        assert!(!ctx.keep_running());
    }

    #[test]
    fn test_stop_wins_over_remaining_budget() {
        let gate = Arc::new(RunGate::for_budget(&RunBudget::iterations(100)));
        let ctx = TestContext::new(
            Address::test(1, 1, 1),
            1,
            BTreeMap::new(),
            Arc::clone(&gate),
            Arc::new(ProbeSet::new()),
        );
        assert!(ctx.keep_running());
        gate.stop();
        assert!(!ctx.keep_running());
    }

    #[test]
    fn test_params_are_visible() {
        let mut params = BTreeMap::new();
        params.insert("payload_bytes".to_string(), "1024".to_string());
        let ctx = TestContext::new(
            Address::test(2, 1, 1),
            1,
            params,
            Arc::new(RunGate::default()),
            Arc::new(ProbeSet::new()),
        );
        assert_eq!(ctx.param("payload_bytes"), Some("1024"));
        assert_eq!(ctx.param("missing"), None);
        assert_eq!(ctx.address(), Address::test(2, 1, 1));
    }
}
