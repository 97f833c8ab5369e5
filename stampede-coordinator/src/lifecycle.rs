//! Test lifecycle engine
//!
//! Drives one run through the phase chain: every phase is started with an
//! acked `StartPhase`, completions come back asynchronously, and the engine
//! advances only once every expected participant has reported or been
//! excluded. Local phases fan out to all participants; global phases run on
//! the single lowest-addressed live worker. The engine is the only writer
//! of phase outcomes into the aggregator, so a completion it has already
//! resolved (timed out, process gone) cannot be overwritten by a late
//! report.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use stampede_config::LifecycleConfig;
use stampede_core::{
    Address, AddressLevel, PhaseOutcome, RunBudget, RunStatus, TestPhase, TestPlan,
};
use stampede_dispatch::{DispatchError, Dispatcher};
use stampede_ipc::{AckOutcome, Operation, OperationAck};
use stampede_registry::ComponentRegistry;
use stampede_report::{ResultAggregator, RunSummary};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::CoordinatorResult;

/// What the event pump feeds into the active run.
#[derive(Debug)]
pub enum RunEvent {
    PhaseCompleted {
        worker: Address,
        phase: TestPhase,
        outcome: PhaseOutcome,
    },
    WorkerLost {
        worker: Address,
        reason: String,
    },
    AgentUnreachable {
        agent: Address,
    },
}

struct ActiveRun {
    test_id: u32,
    sender: mpsc::UnboundedSender<RunEvent>,
}

/// Hands inbound events to whichever run is active.
///
/// The handler and the heartbeat monitor publish here without knowing
/// whether a run is in flight; events arriving between runs are dropped.
pub struct RunEventBus {
    active: Mutex<Option<ActiveRun>>,
}

impl RunEventBus {
    pub fn new() -> RunEventBus {
        RunEventBus {
            active: Mutex::new(None),
        }
    }

    /// Open the event channel for a run, replacing any previous one.
    pub async fn begin(&self, test_id: u32) -> mpsc::UnboundedReceiver<RunEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.active.lock().await = Some(ActiveRun { test_id, sender });
        receiver
    }

    pub async fn end(&self) {
        *self.active.lock().await = None;
    }

    /// Publish an event to the active run. `test_id` scopes run-specific
    /// events to their run; `None` marks cluster-level events that concern
    /// whichever run is active.
    pub async fn emit(&self, test_id: Option<u32>, event: RunEvent) {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) if test_id.is_none() || test_id == Some(run.test_id) => {
                let _ = run.sender.send(event);
            }
            _ => debug!(?test_id, ?event, "run event dropped, no matching active run"),
        }
    }
}

impl Default for RunEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine-owned view of one run, mirrored into the summary at finalize.
#[derive(Debug, Clone)]
pub struct TestRunState {
    pub test_id: u32,
    pub plan: TestPlan,
    pub status: RunStatus,
    /// Outcome of every resolved phase on every worker that entered it
    pub outcomes: BTreeMap<TestPhase, BTreeMap<Address, PhaseOutcome>>,
    /// Workers dropped from all later phases
    pub excluded: BTreeSet<Address>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TestRunState {
    fn new(test_id: u32, plan: TestPlan) -> TestRunState {
        TestRunState {
            test_id,
            plan,
            status: RunStatus::Created,
            outcomes: BTreeMap::new(),
            excluded: BTreeSet::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

enum PhaseVerdict {
    Continue,
    Abort { reason: String },
}

/// Drives one test run from SETUP to DONE (or ABORTED).
pub struct LifecycleEngine {
    dispatcher: Arc<Dispatcher>,
    aggregator: Arc<ResultAggregator>,
    registry: ComponentRegistry,
    config: LifecycleConfig,
    /// Workers whose `CreateTest` was accepted, fixed for the run
    participants: BTreeSet<Address>,
    events: mpsc::UnboundedReceiver<RunEvent>,
    state: TestRunState,
}

impl LifecycleEngine {
    pub fn new(
        test_id: u32,
        plan: TestPlan,
        participants: BTreeSet<Address>,
        config: LifecycleConfig,
        dispatcher: Arc<Dispatcher>,
        aggregator: Arc<ResultAggregator>,
        registry: ComponentRegistry,
        events: mpsc::UnboundedReceiver<RunEvent>,
    ) -> LifecycleEngine {
        let participants = participants
            .into_iter()
            .filter(|worker| worker.level() == AddressLevel::Worker && worker.is_concrete())
            .collect();
        LifecycleEngine {
            dispatcher,
            aggregator,
            registry,
            config,
            participants,
            events,
            state: TestRunState::new(test_id, plan),
        }
    }

    pub fn state(&self) -> &TestRunState {
        &self.state
    }

    /// Walk the phase chain to the end and finalize the summary. Once a
    /// phase fails under `abort_on_failure` (or the cluster degrades past
    /// recovery) no further phases start, but the teardown phases still run
    /// best-effort on the survivors.
    pub async fn drive(mut self) -> CoordinatorResult<RunSummary> {
        info!(
            test_id = self.state.test_id,
            suite = %self.state.plan.suite,
            participants = self.participants.len(),
            budget = ?self.state.plan.budget,
            "run starting"
        );
        let mut abort_reason: Option<String> = None;
        for phase in TestPhase::all() {
            if abort_reason.is_some() && !phase.is_teardown() {
                continue;
            }
            self.state.status = RunStatus::Running { phase };
            match self.run_phase(phase).await {
                PhaseVerdict::Continue => {}
                PhaseVerdict::Abort { reason } => {
                    if abort_reason.is_none() {
                        self.abort_run(&reason).await;
                        abort_reason = Some(reason);
                    }
                }
            }
        }
        self.finish(abort_reason).await
    }

    /// Start one phase on its targets and hold the barrier until every
    /// accepted start has a resolution.
    async fn run_phase(&mut self, phase: TestPhase) -> PhaseVerdict {
        if let Some(reason) = self.drain_idle_events().await {
            return PhaseVerdict::Abort { reason };
        }

        let targets: Vec<Address> = if phase.is_global() {
            match self.designated_worker().await {
                Some(worker) => vec![worker],
                None => {
                    return PhaseVerdict::Abort {
                        reason: format!("no live worker left for global phase {phase}"),
                    }
                }
            }
        } else {
            self.active_workers()
        };
        if targets.is_empty() {
            return PhaseVerdict::Abort {
                reason: format!("no live participants left at phase {phase}"),
            };
        }

        info!(
            test_id = self.state.test_id,
            %phase,
            workers = targets.len(),
            "phase starting"
        );

        let mut pending: BTreeSet<Address> = BTreeSet::new();
        let mut failure: Option<String> = None;

        let test_id = self.state.test_id;
        let dispatcher = Arc::clone(&self.dispatcher);
        let starts = targets.iter().map(|worker| {
            let dispatcher = Arc::clone(&dispatcher);
            let worker = *worker;
            async move {
                let result = match worker.test_on(test_id) {
                    Some(instance) => {
                        dispatcher
                            .send(instance, Operation::StartPhase { test_id, phase })
                            .await
                    }
                    None => Err(DispatchError::Unroutable {
                        local: Address::Coordinator,
                        destination: worker,
                    }),
                };
                (worker, result)
            }
        });
        for (worker, result) in join_all(starts).await {
            match result {
                Ok(ack) if ack.all_succeeded() => {
                    pending.insert(worker);
                }
                Ok(ack) => {
                    let outcome = start_failure_outcome(&ack);
                    warn!(%worker, %phase, %outcome, "phase start not accepted");
                    self.resolve(worker, phase, outcome, &mut failure).await;
                }
                Err(error) => {
                    warn!(%worker, %phase, %error, "phase start undeliverable");
                    let outcome = PhaseOutcome::Failed {
                        error: error.to_string(),
                    };
                    self.resolve(worker, phase, outcome, &mut failure).await;
                }
            }
        }

        // In duration mode the engine owns the end of RUN: sleep the budget,
        // then broadcast the stop. The straggler clock starts after the stop
        // so a long budget is never mistaken for a hung phase.
        let mut stop_at = match (phase, self.state.plan.budget) {
            (TestPhase::Run, RunBudget::Duration { secs }) => {
                Some(Instant::now() + Duration::from_secs(secs))
            }
            _ => None,
        };
        let mut deadline = match (stop_at, self.config.phase_timeout) {
            (None, Some(limit)) => Some(Instant::now() + limit),
            _ => None,
        };

        while !pending.is_empty() {
            tokio::select! {
                _ = sleep_until(stop_at.unwrap_or_else(Instant::now)), if stop_at.is_some() => {
                    stop_at = None;
                    self.broadcast_stop().await;
                    if let Some(limit) = self.config.phase_timeout {
                        deadline = Some(Instant::now() + limit);
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let stragglers: Vec<Address> = pending.iter().copied().collect();
                    for worker in stragglers {
                        warn!(%worker, %phase, "no completion within the phase timeout");
                        self.resolve(worker, phase, PhaseOutcome::TimedOut, &mut failure)
                            .await;
                    }
                    pending.clear();
                }
                event = self.events.recv() => match event {
                    Some(RunEvent::PhaseCompleted { worker, phase: completed, outcome }) => {
                        if completed == phase && pending.remove(&worker) {
                            debug!(%worker, %phase, %outcome, "phase completion");
                            self.resolve(worker, phase, outcome, &mut failure).await;
                        } else {
                            debug!(
                                %worker,
                                reported = %completed,
                                expected = %phase,
                                "stale completion dropped"
                            );
                        }
                    }
                    Some(RunEvent::WorkerLost { worker, reason }) => {
                        if pending.remove(&worker) {
                            let outcome = PhaseOutcome::ProcessExited { error: reason };
                            self.resolve(worker, phase, outcome, &mut failure).await;
                        } else {
                            self.exclude_lost(worker, &reason);
                        }
                    }
                    Some(RunEvent::AgentUnreachable { agent }) => {
                        warn!(%agent, %phase, "agent unreachable during phase");
                        if let Some(reason) = self.majority_unreachable().await {
                            return PhaseVerdict::Abort { reason };
                        }
                    }
                    None => {
                        return PhaseVerdict::Abort {
                            reason: "run event channel closed".to_string(),
                        };
                    }
                }
            }
        }

        match failure {
            Some(reason) if self.config.abort_on_failure => PhaseVerdict::Abort { reason },
            _ => PhaseVerdict::Continue,
        }
    }

    /// Record one worker's resolution for a phase. Anything short of success
    /// drops the worker from all later phases.
    async fn resolve(
        &mut self,
        worker: Address,
        phase: TestPhase,
        outcome: PhaseOutcome,
        failure: &mut Option<String>,
    ) {
        self.aggregator
            .record_phase_outcome(worker, self.state.test_id, phase, outcome.clone())
            .await;
        if !outcome.is_success() {
            if failure.is_none() {
                *failure = Some(format!("worker {worker} {outcome} in {phase}"));
            }
            if self.state.excluded.insert(worker) {
                warn!(%worker, "worker excluded from later phases");
            }
        }
        self.state
            .outcomes
            .entry(phase)
            .or_default()
            .insert(worker, outcome);
    }

    fn exclude_lost(&mut self, worker: Address, reason: &str) {
        if self.participants.contains(&worker) && self.state.excluded.insert(worker) {
            warn!(%worker, reason, "participant lost outside a phase barrier");
        }
    }

    /// Consume events queued up between phases. Completions here are always
    /// stale: the previous barrier did not finish until all of its expected
    /// reports were in.
    async fn drain_idle_events(&mut self) -> Option<String> {
        while let Ok(event) = self.events.try_recv() {
            match event {
                RunEvent::PhaseCompleted { worker, phase, .. } => {
                    debug!(%worker, %phase, "stale completion dropped");
                }
                RunEvent::WorkerLost { worker, reason } => self.exclude_lost(worker, &reason),
                RunEvent::AgentUnreachable { agent } => {
                    warn!(%agent, "agent unreachable between phases");
                    if let Some(reason) = self.majority_unreachable().await {
                        return Some(reason);
                    }
                }
            }
        }
        None
    }

    fn active_workers(&self) -> Vec<Address> {
        self.participants
            .iter()
            .filter(|worker| !self.state.excluded.contains(worker))
            .copied()
            .collect()
    }

    /// Global phases run on the lowest-addressed live participant.
    async fn designated_worker(&self) -> Option<Address> {
        for worker in self.active_workers() {
            if let Some(record) = self.registry.find_worker(worker).await {
                if record.state.is_live() {
                    return Some(worker);
                }
            }
        }
        None
    }

    /// Abort once workers behind unreachable agents outnumber the rest.
    async fn majority_unreachable(&self) -> Option<String> {
        let total = self.participants.len();
        let mut cut_off = 0usize;
        for worker in &self.participants {
            if let Some(agent) = worker.parent() {
                match self.registry.agent(agent).await {
                    Some(record) if record.state.is_live() => {}
                    _ => cut_off += 1,
                }
            }
        }
        if cut_off * 2 > total {
            Some(format!(
                "{cut_off} of {total} workers are behind unreachable agents"
            ))
        } else {
            None
        }
    }

    async fn broadcast_stop(&self) {
        let test_id = self.state.test_id;
        info!(test_id, "run budget elapsed, stopping");
        let stop = Operation::StopRun { test_id };
        match self
            .dispatcher
            .send(Address::test_instances(test_id), stop)
            .await
        {
            Ok(ack) => {
                for (address, outcome) in ack.failures() {
                    debug!(%address, ?outcome, "stop not acknowledged");
                }
            }
            Err(error) => warn!(test_id, %error, "stop broadcast undeliverable"),
        }
    }

    /// Tell every instance to cancel in-flight work before the teardown
    /// phases run.
    async fn abort_run(&mut self, reason: &str) {
        let test_id = self.state.test_id;
        warn!(test_id, reason, "aborting run");
        let abort = Operation::AbortRun {
            test_id,
            reason: reason.to_string(),
        };
        match self
            .dispatcher
            .send(Address::test_instances(test_id), abort)
            .await
        {
            Ok(ack) => {
                for (address, outcome) in ack.failures() {
                    debug!(%address, ?outcome, "abort not acknowledged");
                }
            }
            Err(error) => warn!(test_id, %error, "abort broadcast undeliverable"),
        }
    }

    async fn finish(mut self, abort_reason: Option<String>) -> CoordinatorResult<RunSummary> {
        self.state.status = match abort_reason {
            Some(ref reason) => {
                warn!(test_id = self.state.test_id, %reason, "run aborted");
                RunStatus::Aborted
            }
            None => {
                info!(test_id = self.state.test_id, "run complete");
                RunStatus::Done
            }
        };
        let finished = Utc::now();
        self.state.finished_at = Some(finished);
        let summary = self
            .aggregator
            .finalize(
                self.state.test_id,
                &self.state.plan.suite,
                self.state.status,
                self.state.started_at,
                finished,
            )
            .await?;
        Ok(summary)
    }
}

/// How a refused or undeliverable phase start is recorded for its worker.
fn start_failure_outcome(ack: &OperationAck) -> PhaseOutcome {
    match ack.failures().first() {
        Some((_, AckOutcome::TimedOut)) => PhaseOutcome::TimedOut,
        Some((address, AckOutcome::Error { message })) => PhaseOutcome::Failed {
            error: format!("start refused by {address}: {message}"),
        },
        Some((address, AckOutcome::Unreachable { message })) => PhaseOutcome::Failed {
            error: format!("{address} unreachable: {message}"),
        },
        _ => PhaseOutcome::Failed {
            error: "phase start failed".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_registry::LivenessState;
    use std::sync::atomic::AtomicU64;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn plan() -> TestPlan {
        TestPlan::new("stub", RunBudget::Iterations { count: 1 })
    }

    fn engine_fixture(
        participants: &[Address],
        registry: ComponentRegistry,
        dir: &TempDir,
    ) -> (LifecycleEngine, mpsc::UnboundedSender<RunEvent>) {
        let aggregator = Arc::new(ResultAggregator::new(
            dir.path(),
            16,
            Arc::new(AtomicU64::new(1)),
        ));
        let (sender, receiver) = mpsc::unbounded_channel();
        let engine = LifecycleEngine::new(
            1,
            plan(),
            participants.iter().copied().collect(),
            LifecycleConfig::default(),
            Arc::new(Dispatcher::new(Address::Coordinator)),
            aggregator,
            registry,
            receiver,
        );
        (engine, sender)
    }

    async fn registry_with_live_workers(agents: u32, per_agent: u32) -> ComponentRegistry {
        let registry = ComponentRegistry::new();
        for a in 0..agents {
            let agent = registry
                .register_agent(format!("10.0.0.{a}"), format!("10.0.0.{a}"))
                .await;
            registry
                .set_agent_state(agent.address, LivenessState::Alive)
                .await
                .unwrap();
            let settings = vec![stampede_core::WorkerProcessSettings::member(); per_agent as usize];
            let workers = registry
                .register_workers(agent.address, &settings)
                .await
                .unwrap();
            for worker in workers {
                registry
                    .set_worker_state(worker.address, LivenessState::Alive)
                    .await
                    .unwrap();
            }
        }
        registry
    }

    #[tokio::test]
    async fn test_bus_scopes_events_to_active_run() {
        let bus = RunEventBus::new();
        let mut events = bus.begin(7).await;

        bus.emit(
            Some(7),
            RunEvent::PhaseCompleted {
                worker: Address::worker(1, 1),
                phase: TestPhase::Setup,
                outcome: PhaseOutcome::Success,
            },
        )
        .await;
        bus.emit(
            Some(9),
            RunEvent::PhaseCompleted {
                worker: Address::worker(1, 1),
                phase: TestPhase::Setup,
                outcome: PhaseOutcome::Success,
            },
        )
        .await;
        bus.emit(
            None,
            RunEvent::WorkerLost {
                worker: Address::worker(1, 2),
                reason: "gone".to_string(),
            },
        )
        .await;

        assert!(matches!(
            events.try_recv(),
            Ok(RunEvent::PhaseCompleted { .. })
        ));
        assert!(matches!(events.try_recv(), Ok(RunEvent::WorkerLost { .. })));
        assert!(events.try_recv().is_err(), "run 9 event must not leak in");

        bus.end().await;
        bus.emit(
            None,
            RunEvent::AgentUnreachable {
                agent: Address::agent(1),
            },
        )
        .await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_designated_worker_is_lowest_live() {
        let registry = registry_with_live_workers(2, 2).await;
        let participants = [
            Address::worker(1, 1),
            Address::worker(1, 2),
            Address::worker(2, 1),
            Address::worker(2, 2),
        ];
        let dir = TempDir::new().unwrap();
        let (mut engine, _events) = engine_fixture(&participants, registry.clone(), &dir);

        assert_eq!(engine.designated_worker().await, Some(Address::worker(1, 1)));

        // A dead worker is skipped even before the engine excludes it
        registry
            .set_worker_state(Address::worker(1, 1), LivenessState::Terminated)
            .await
            .unwrap();
        assert_eq!(engine.designated_worker().await, Some(Address::worker(1, 2)));

        // Exclusion moves the designation on as well
        engine.state.excluded.insert(Address::worker(1, 2));
        assert_eq!(engine.designated_worker().await, Some(Address::worker(2, 1)));
    }

    #[tokio::test]
    async fn test_majority_rule_needs_strict_majority() {
        let registry = registry_with_live_workers(2, 2).await;
        let participants = [
            Address::worker(1, 1),
            Address::worker(1, 2),
            Address::worker(2, 1),
            Address::worker(2, 2),
        ];
        let dir = TempDir::new().unwrap();
        let (engine, _events) = engine_fixture(&participants, registry.clone(), &dir);

        assert!(engine.majority_unreachable().await.is_none());

        registry
            .set_agent_state(Address::agent(1), LivenessState::Unreachable)
            .await
            .unwrap();
        assert!(
            engine.majority_unreachable().await.is_none(),
            "half the cluster is not a majority"
        );

        registry
            .set_agent_state(Address::agent(2), LivenessState::Unreachable)
            .await
            .unwrap();
        let reason = engine.majority_unreachable().await.expect("majority gone");
        assert!(reason.contains("4 of 4"));
    }

    #[test]
    fn test_start_failure_outcome_keeps_the_cause() {
        let id = Uuid::new_v4();
        let timed_out = OperationAck::single(id, Address::worker(1, 1), AckOutcome::TimedOut);
        assert_eq!(start_failure_outcome(&timed_out), PhaseOutcome::TimedOut);

        let refused = OperationAck::single(
            id,
            Address::worker(1, 1),
            AckOutcome::Error {
                message: "unknown test 9".to_string(),
            },
        );
        match start_failure_outcome(&refused) {
            PhaseOutcome::Failed { error } => {
                assert!(error.contains("C_A1_W1"));
                assert!(error.contains("unknown test 9"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let unreachable = OperationAck::single(
            id,
            Address::agent(1),
            AckOutcome::Unreachable {
                message: "link closed".to_string(),
            },
        );
        assert!(matches!(
            start_failure_outcome(&unreachable),
            PhaseOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_non_worker_participants_are_dropped() {
        let registry = registry_with_live_workers(1, 1).await;
        let participants = [
            Address::worker(1, 1),
            Address::agent(1),
            Address::all_workers(),
        ];
        let dir = TempDir::new().unwrap();
        let (engine, _events) = engine_fixture(&participants, registry, &dir);
        assert_eq!(engine.participants.len(), 1);
        assert!(engine.participants.contains(&Address::worker(1, 1)));
    }
}
