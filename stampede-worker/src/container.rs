//! In-process test instances
//!
//! A container owns one test instance on a worker: the suite, the run gate
//! and the task group of whichever phase is executing. `StartPhase` is acked
//! on acceptance and the phase runs detached; completion goes upward as a
//! `PhaseCompleted` notification. Repeated starts of the same phase (the
//! delivery retry case) are accepted without running the phase again.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stampede_core::{Address, PhaseOutcome, TestPhase, TestPlan};
use stampede_ipc::Operation;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::context::{RunGate, TestContext};
use crate::error::{WorkerError, WorkerResult};
use crate::probe::{lock_unpoisoned, ProbeSet};
use crate::suite::{HookFn, HookResult, TestSuite};

#[derive(Debug, Default)]
struct ContainerState {
    started: BTreeSet<TestPhase>,
    aborted: bool,
}

/// One test instance hosted by a worker.
pub struct TestContainer {
    address: Address,
    test_id: u32,
    plan: TestPlan,
    suite: Arc<TestSuite>,
    gate: Arc<RunGate>,
    probes: Arc<ProbeSet>,
    outbound: mpsc::UnboundedSender<Operation>,
    flush_interval: Duration,
    state: Mutex<ContainerState>,
}

impl TestContainer {
    pub fn new(
        worker: Address,
        test_id: u32,
        plan: TestPlan,
        suite: Arc<TestSuite>,
        outbound: mpsc::UnboundedSender<Operation>,
        flush_interval: Duration,
    ) -> WorkerResult<TestContainer> {
        let address = worker
            .test_on(test_id)
            .ok_or(WorkerError::NotAWorkerAddress(worker))?;
        let gate = Arc::new(RunGate::for_budget(&plan.budget));
        Ok(TestContainer {
            address,
            test_id,
            plan,
            suite,
            gate,
            probes: Arc::new(ProbeSet::new()),
            outbound,
            flush_interval,
            state: Mutex::new(ContainerState::default()),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn test_id(&self) -> u32 {
        self.test_id
    }

    /// Accept a phase start. The phase executes detached; this returns as
    /// soon as the start is admissible so the ack reflects acceptance, not
    /// completion.
    pub fn start_phase(self: &Arc<Self>, phase: TestPhase) -> WorkerResult<()> {
        {
            let mut state = lock_unpoisoned(&self.state);
            if state.aborted && !phase.is_teardown() {
                return Err(WorkerError::PhaseAfterAbort {
                    test_id: self.test_id,
                    phase,
                });
            }
            if !state.started.insert(phase) {
                debug!(test = %self.address, %phase, "duplicate phase start accepted");
                return Ok(());
            }
        }
        let container = Arc::clone(self);
        tokio::spawn(async move { container.drive(phase).await });
        Ok(())
    }

    /// Flip the run gate; RUN loops drain out through `keep_running`.
    pub fn stop_run(&self) {
        debug!(test = %self.address, "run stop requested");
        self.gate.stop();
    }

    /// Stop current work and refuse everything but teardown from here on.
    pub fn abort(&self, reason: &str) {
        info!(test = %self.address, reason, "aborting test instance");
        lock_unpoisoned(&self.state).aborted = true;
        self.gate.stop();
    }

    async fn drive(self: Arc<Self>, phase: TestPhase) {
        debug!(test = %self.address, %phase, "phase starting");
        let outcome = match self.suite.hook(phase) {
            Some(hook) => self.execute(phase, hook).await,
            // unbound phases complete immediately
            None => PhaseOutcome::Success,
        };
        if let PhaseOutcome::Failed { error } = &outcome {
            warn!(test = %self.address, %phase, error, "phase failed");
        }
        self.notify(Operation::PhaseCompleted {
            test_id: self.test_id,
            phase,
            outcome,
        });
    }

    /// Run the phase's task group to completion: RUN spawns one task per
    /// configured thread, every other phase exactly one. Panics surface as
    /// failures; each failed task also ships an exception report.
    async fn execute(self: &Arc<Self>, phase: TestPhase, hook: HookFn) -> PhaseOutcome {
        let task_count = if phase == TestPhase::Run {
            self.plan.run_threads.max(1)
        } else {
            1
        };
        let flusher = (phase == TestPhase::Run).then(|| self.spawn_flusher());

        let ctx = self.context();
        let mut group: JoinSet<HookResult> = JoinSet::new();
        for _ in 0..task_count {
            let hook = Arc::clone(&hook);
            let ctx = ctx.clone();
            group.spawn(async move { hook(ctx).await });
        }

        let mut first_failure: Option<String> = None;
        while let Some(joined) = group.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error.to_string()),
                Err(join_error) => Some(panic_message(join_error)),
            };
            if let Some(message) = failure {
                self.notify(Operation::ExceptionReport {
                    test_id: self.test_id,
                    phase: Some(phase),
                    message: message.clone(),
                    trace: None,
                });
                if first_failure.is_none() {
                    first_failure = Some(message);
                }
            }
        }

        if let Some((handle, stop)) = flusher {
            let _ = stop.send(());
            let _ = handle.await;
        }

        match first_failure {
            None => PhaseOutcome::Success,
            Some(error) => PhaseOutcome::Failed { error },
        }
    }

    /// Rotate the probe set on the flush interval for as long as RUN lasts,
    /// with one final drain when the task group finishes.
    fn spawn_flusher(self: &Arc<Self>) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let container = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(container.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the interval fires immediately once; that tick opens interval 0
            ticker.tick().await;
            let mut opened = Instant::now();
            loop {
                tokio::select! {
                    _ = ticker.tick() => container.flush_probes(&mut opened),
                    _ = &mut stop_rx => {
                        container.flush_probes(&mut opened);
                        break;
                    }
                }
            }
        });
        (handle, stop_tx)
    }

    fn flush_probes(&self, opened: &mut Instant) {
        let elapsed = opened.elapsed();
        *opened = Instant::now();
        for (probe, interval) in self.probes.rotate(elapsed) {
            self.notify(Operation::ProbeReport {
                test_id: self.test_id,
                probe,
                interval,
            });
        }
    }

    fn context(&self) -> TestContext {
        TestContext::new(
            self.address,
            self.test_id,
            self.plan.params.clone(),
            Arc::clone(&self.gate),
            Arc::clone(&self.probes),
        )
    }

    fn notify(&self, operation: Operation) {
        if self.outbound.send(operation).is_err() {
            warn!(test = %self.address, "outbound channel closed, dropping report");
        }
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque payload".to_string());
            format!("hook panicked: {detail}")
        }
        Err(error) => format!("hook task failed: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::HookError;
    use std::sync::atomic::{AtomicU64, Ordering};
    use stampede_core::RunBudget;

    fn spawn_container(
        suite: TestSuite,
        plan: TestPlan,
    ) -> (Arc<TestContainer>, mpsc::UnboundedReceiver<Operation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let container = TestContainer::new(
            Address::worker(1, 1),
            1,
            plan,
            Arc::new(suite),
            tx,
            Duration::from_millis(25),
        )
        .unwrap();
        (Arc::new(container), rx)
    }

    /// Drain outbound operations until the phase completes, returning the
    /// completion and everything that preceded it.
    async fn drain_to_completion(
        rx: &mut mpsc::UnboundedReceiver<Operation>,
    ) -> (Vec<Operation>, TestPhase, PhaseOutcome) {
        let mut preceding = Vec::new();
        loop {
            let operation = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("phase did not complete in time")
                .expect("outbound channel closed");
            match operation {
                Operation::PhaseCompleted { phase, outcome, .. } => {
                    return (preceding, phase, outcome)
                }
                other => preceding.push(other),
            }
        }
    }

    #[tokio::test]
    async fn test_unbound_phase_completes_immediately() {
        let suite = TestSuite::builder("bare").build();
        let (container, mut rx) =
            spawn_container(suite, TestPlan::new("bare", RunBudget::iterations(1)));

        container.start_phase(TestPhase::Setup).unwrap();
        let (before, phase, outcome) = drain_to_completion(&mut rx).await;
        assert!(before.is_empty());
        assert_eq!(phase, TestPhase::Setup);
        assert_eq!(outcome, PhaseOutcome::Success);
    }

    #[tokio::test]
    async fn test_iteration_budget_shared_across_run_tasks() {
        let counter = Arc::new(AtomicU64::new(0));
        let hook_counter = Arc::clone(&counter);
        let suite = TestSuite::builder("iters")
            .run(move |ctx| {
                let counter = Arc::clone(&hook_counter);
                async move {
                    while ctx.keep_running() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            })
            .build();
        let plan = TestPlan::new("iters", RunBudget::iterations(10)).with_run_threads(3);
        let (container, mut rx) = spawn_container(suite, plan);

        container.start_phase(TestPhase::Run).unwrap();
        let (_, phase, outcome) = drain_to_completion(&mut rx).await;
        assert_eq!(phase, TestPhase::Run);
        assert_eq!(outcome, PhaseOutcome::Success);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_failed_hook_reports_exception_then_failure() {
        let suite = TestSuite::builder("broken")
            .local_verify(|_ctx| async { Err(HookError::new("checksum mismatch")) })
            .build();
        let (container, mut rx) =
            spawn_container(suite, TestPlan::new("broken", RunBudget::iterations(1)));

        container.start_phase(TestPhase::LocalVerify).unwrap();
        let (before, phase, outcome) = drain_to_completion(&mut rx).await;

        assert_eq!(phase, TestPhase::LocalVerify);
        assert_eq!(
            outcome,
            PhaseOutcome::Failed {
                error: "checksum mismatch".to_string()
            }
        );
        assert!(matches!(
            &before[..],
            [Operation::ExceptionReport { message, phase: Some(TestPhase::LocalVerify), .. }]
                if message == "checksum mismatch"
        ));
    }

    #[tokio::test]
    async fn test_panicking_hook_is_captured_as_failure() {
        let suite = TestSuite::builder("panicky")
            .setup(|_ctx| async { panic!("setup exploded") })
            .build();
        let (container, mut rx) =
            spawn_container(suite, TestPlan::new("panicky", RunBudget::iterations(1)));

        container.start_phase(TestPhase::Setup).unwrap();
        let (before, _, outcome) = drain_to_completion(&mut rx).await;

        match outcome {
            PhaseOutcome::Failed { error } => {
                assert!(error.contains("panicked"), "got: {error}");
                assert!(error.contains("setup exploded"), "got: {error}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(before.len(), 1, "panic also ships an exception report");
    }

    #[tokio::test]
    async fn test_duplicate_phase_start_runs_once() {
        let executions = Arc::new(AtomicU64::new(0));
        let hook_executions = Arc::clone(&executions);
        let suite = TestSuite::builder("once")
            .setup(move |_ctx| {
                let executions = Arc::clone(&hook_executions);
                async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();
        let (container, mut rx) =
            spawn_container(suite, TestPlan::new("once", RunBudget::iterations(1)));

        container.start_phase(TestPhase::Setup).unwrap();
        container.start_phase(TestPhase::Setup).unwrap();
        let _ = drain_to_completion(&mut rx).await;

        // a second completion must not arrive
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_run_drains_duration_mode() {
        let suite = TestSuite::builder("steady")
            .run(|ctx| async move {
                while ctx.keep_running() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Ok(())
            })
            .build();
        let plan = TestPlan::new("steady", RunBudget::duration(Duration::from_secs(30)));
        let (container, mut rx) = spawn_container(suite, plan);

        container.start_phase(TestPhase::Run).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        container.stop_run();

        let (_, phase, outcome) = drain_to_completion(&mut rx).await;
        assert_eq!(phase, TestPhase::Run);
        assert_eq!(outcome, PhaseOutcome::Success);
    }

    #[tokio::test]
    async fn test_probe_intervals_flow_during_run() {
        let suite = TestSuite::builder("probing")
            .run(|ctx| async move {
                while ctx.keep_running() {
                    ctx.probe("latency").record_micros(42);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(())
            })
            .build();
        let plan = TestPlan::new("probing", RunBudget::iterations(20));
        let (container, mut rx) = spawn_container(suite, plan);

        container.start_phase(TestPhase::Run).unwrap();
        let (before, _, outcome) = drain_to_completion(&mut rx).await;
        assert_eq!(outcome, PhaseOutcome::Success);

        let mut recorded = 0;
        let mut last_index = None;
        for operation in before {
            if let Operation::ProbeReport {
                probe, interval, ..
            } = operation
            {
                assert_eq!(probe, "latency");
                if let Some(last) = last_index {
                    assert!(interval.index > last, "indexes must ascend");
                }
                last_index = Some(interval.index);
                recorded += interval.histogram.count();
            }
        }
        assert_eq!(recorded, 20, "every sample reaches some interval");
        assert!(last_index.is_some());
    }

    #[tokio::test]
    async fn test_abort_refuses_new_phases_except_teardown() {
        let suite = TestSuite::builder("abortable").build();
        let (container, mut rx) =
            spawn_container(suite, TestPlan::new("abortable", RunBudget::iterations(1)));

        container.abort("operator request");

        let err = container.start_phase(TestPhase::LocalVerify).unwrap_err();
        assert!(matches!(err, WorkerError::PhaseAfterAbort { .. }));

        container.start_phase(TestPhase::LocalTeardown).unwrap();
        let (_, phase, outcome) = drain_to_completion(&mut rx).await;
        assert_eq!(phase, TestPhase::LocalTeardown);
        assert_eq!(outcome, PhaseOutcome::Success);
    }
}
