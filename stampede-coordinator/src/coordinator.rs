//! Cluster bootstrap and run orchestration
//!
//! The coordinator owns the root of the component tree. It dials the
//! agents from an inventory, adopts them into the registry, spreads worker
//! processes across them, and hands each accepted test run to a lifecycle
//! engine. One inbound pump serves the whole tree: every report a worker
//! sends upward arrives here and is folded into the aggregator or the
//! active run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use stampede_config::{CoordinatorConfig, LifecycleConfig, StampedeConfig};
use stampede_core::{Address, TestPlan, WorkerKind, WorkerProcessSettings};
use stampede_dispatch::{
    ConnectionSettings, Dispatcher, InboundEnvelope, OperationHandler, PeerConnection,
};
use stampede_ipc::{tcp_transport, Operation, OperationAck, TransportPair, WorkerPlan};
use stampede_registry::{AgentRecord, ComponentRegistry, Inventory, LivenessState, WorkerRecord};
use stampede_report::{ResultAggregator, RunSummary};
use stampede_resilience::{RetryError, RetryExecutor, ShutdownCoordinator};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::handler::CoordinatorHandler;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatSettings};
use crate::lifecycle::{LifecycleEngine, RunEventBus};

/// How the coordinator reaches an agent. The TCP connector is the
/// production path; the in-process cluster plugs in its own.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, agent: &AgentRecord, port: u16) -> CoordinatorResult<TransportPair>;
}

/// Dials the agent daemon on its bind port.
pub struct TcpConnector;

#[async_trait]
impl AgentConnector for TcpConnector {
    async fn connect(&self, agent: &AgentRecord, port: u16) -> CoordinatorResult<TransportPair> {
        let endpoint = format!("{}:{}", agent.public_ip, port);
        let stream =
            TcpStream::connect(&endpoint)
                .await
                .map_err(|error| CoordinatorError::AgentConnect {
                    agent: agent.address,
                    endpoint: endpoint.clone(),
                    reason: error.to_string(),
                })?;
        Ok(tcp_transport(stream))
    }
}

/// How many worker processes a run wants and what they are told at launch.
#[derive(Debug, Clone, Default)]
pub struct WorkerLayout {
    pub members: u32,
    pub clients: u32,
    /// Launch parameters shared by every worker in the layout
    pub parameters: BTreeMap<String, String>,
}

impl WorkerLayout {
    pub fn total(&self) -> u32 {
        self.members + self.clients
    }

    /// Expand the layout into per-process settings, members first. The
    /// order fixes which worker indices land on which agent.
    pub fn settings(&self) -> Vec<WorkerProcessSettings> {
        let member = WorkerProcessSettings {
            kind: WorkerKind::Member,
            parameters: self.parameters.clone(),
        };
        let client = WorkerProcessSettings {
            kind: WorkerKind::Client,
            parameters: self.parameters.clone(),
        };
        let mut settings = vec![member; self.members as usize];
        settings.extend(vec![client; self.clients as usize]);
        settings
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub coordinator: CoordinatorConfig,
    pub lifecycle: LifecycleConfig,
    /// Link settings for every agent connection
    pub connection: ConnectionSettings,
    /// Grace granted to workers when the cluster is torn down
    pub worker_grace: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        CoordinatorSettings {
            coordinator: CoordinatorConfig::default(),
            lifecycle: LifecycleConfig::default(),
            connection: ConnectionSettings::default(),
            worker_grace: Duration::from_secs(10),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &StampedeConfig) -> CoordinatorSettings {
        CoordinatorSettings {
            coordinator: config.coordinator.clone(),
            lifecycle: config.lifecycle.clone(),
            connection: ConnectionSettings {
                ack_deadline: config.dispatch.ack_deadline,
                retry: config.dispatch.retry.clone(),
            },
            worker_grace: config.agent.worker_grace_timeout,
        }
    }
}

pub struct Coordinator {
    settings: CoordinatorSettings,
    registry: ComponentRegistry,
    dispatcher: Arc<Dispatcher>,
    aggregator: Arc<ResultAggregator>,
    bus: Arc<RunEventBus>,
    connector: Arc<dyn AgentConnector>,
    shutdown: Arc<ShutdownCoordinator>,
    inbound_tx: mpsc::UnboundedSender<InboundEnvelope>,
    pump: JoinHandle<()>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    next_test_id: AtomicU32,
}

impl Coordinator {
    /// Must be called inside a runtime: the inbound pump starts immediately.
    pub fn new(
        settings: CoordinatorSettings,
        aggregator: Arc<ResultAggregator>,
        connector: Arc<dyn AgentConnector>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Coordinator {
        let registry = ComponentRegistry::new();
        let dispatcher = Arc::new(Dispatcher::new(Address::Coordinator));
        let bus = Arc::new(RunEventBus::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn OperationHandler> = Arc::new(CoordinatorHandler::new(
            registry.clone(),
            Arc::clone(&aggregator),
            Arc::clone(&bus),
        ));
        let pump = tokio::spawn(Arc::clone(&dispatcher).run_inbound(inbound_rx, handler));
        Coordinator {
            settings,
            registry,
            dispatcher,
            aggregator,
            bus,
            connector,
            shutdown,
            inbound_tx,
            pump,
            heartbeat: Mutex::new(None),
            next_test_id: AtomicU32::new(1),
        }
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn aggregator(&self) -> &Arc<ResultAggregator> {
        &self.aggregator
    }

    /// Register every inventory host, connect to its agent and hand it its
    /// address. A host that cannot be reached within the retry budget fails
    /// the whole bootstrap. Starts the heartbeat monitor on success.
    pub async fn bootstrap(&self, inventory: &Inventory) -> CoordinatorResult<Vec<AgentRecord>> {
        if inventory.hosts.is_empty() {
            return Err(CoordinatorError::EmptyInventory);
        }
        let records = self.registry.load_inventory(inventory).await;
        let mut connected = Vec::with_capacity(records.len());
        for record in records {
            connected.push(self.connect_agent(record).await?);
        }
        info!(agents = connected.len(), "cluster bootstrapped");

        let monitor = HeartbeatMonitor::new(
            Arc::clone(&self.dispatcher),
            self.registry.clone(),
            Arc::clone(&self.bus),
            HeartbeatSettings {
                interval: self.settings.coordinator.heartbeat_interval,
                miss_threshold: self.settings.coordinator.heartbeat_miss_threshold,
            },
        );
        let handle = monitor.spawn(self.shutdown.subscribe());
        if let Some(old) = self.heartbeat.lock().await.replace(handle) {
            old.abort();
        }
        Ok(connected)
    }

    async fn connect_agent(&self, mut record: AgentRecord) -> CoordinatorResult<AgentRecord> {
        let port = self.settings.coordinator.agent_port;
        let deadline = self.settings.coordinator.connect_timeout;
        let executor = RetryExecutor::new(self.settings.coordinator.connect_retry.clone());
        let transport = executor
            .execute(|| async {
                match timeout(deadline, self.connector.connect(&record, port)).await {
                    Ok(result) => result,
                    Err(_) => Err(CoordinatorError::AgentConnect {
                        agent: record.address,
                        endpoint: format!("{}:{port}", record.public_ip),
                        reason: format!("no connection within {deadline:?}"),
                    }),
                }
            })
            .await
            .map_err(RetryError::into_inner)?;

        let connection = PeerConnection::spawn(
            record.address,
            transport,
            self.inbound_tx.clone(),
            self.settings.connection.clone(),
        );
        self.dispatcher
            .add_route(record.address, Arc::clone(&connection))
            .await;

        // The agent learns its own address from this envelope's destination
        let ack = self
            .dispatcher
            .send(record.address, Operation::InitAgent)
            .await?;
        if !ack.all_succeeded() {
            self.dispatcher.remove_route(&record.address).await;
            connection.close();
            return Err(CoordinatorError::InitRejected {
                agent: record.address,
                reason: describe_failures(&ack),
            });
        }
        self.registry
            .set_agent_state(record.address, LivenessState::Alive)
            .await?;
        record.state = LivenessState::Alive;
        info!(agent = %record.address, ip = %record.public_ip, "agent connected");
        Ok(record)
    }

    /// Spread the layout's worker processes round-robin across the live
    /// agents and spawn them. An agent that cannot spawn its batch fails
    /// the provisioning; workers already running elsewhere stay up.
    pub async fn provision(&self, layout: &WorkerLayout) -> CoordinatorResult<Vec<WorkerRecord>> {
        let agents: Vec<AgentRecord> = self
            .registry
            .agents()
            .await
            .into_iter()
            .filter(|record| record.state.is_live())
            .collect();
        if agents.is_empty() {
            return Err(CoordinatorError::NoLiveAgents);
        }

        let mut buckets: Vec<Vec<WorkerProcessSettings>> = vec![Vec::new(); agents.len()];
        for (index, settings) in layout.settings().into_iter().enumerate() {
            buckets[index % agents.len()].push(settings);
        }

        let mut provisioned = Vec::new();
        for (agent, batch) in agents.iter().zip(buckets) {
            if batch.is_empty() {
                continue;
            }
            let mut workers = self.registry.register_workers(agent.address, &batch).await?;
            let plans: Vec<WorkerPlan> = workers
                .iter()
                .map(|worker| WorkerPlan {
                    address: worker.address,
                    settings: worker.settings.clone(),
                })
                .collect();
            match self
                .dispatcher
                .send(agent.address, Operation::SpawnWorkers { workers: plans })
                .await
            {
                Ok(ack) if ack.all_succeeded() => {}
                Ok(ack) => {
                    self.fail_batch(&workers).await;
                    return Err(CoordinatorError::ProvisionFailed {
                        agent: agent.address,
                        reason: describe_failures(&ack),
                    });
                }
                Err(error) => {
                    self.fail_batch(&workers).await;
                    return Err(CoordinatorError::ProvisionFailed {
                        agent: agent.address,
                        reason: error.to_string(),
                    });
                }
            }
            for worker in &mut workers {
                self.registry
                    .set_worker_state(worker.address, LivenessState::Alive)
                    .await?;
                worker.state = LivenessState::Alive;
            }
            info!(agent = %agent.address, workers = workers.len(), "workers provisioned");
            provisioned.extend(workers);
        }
        Ok(provisioned)
    }

    async fn fail_batch(&self, workers: &[WorkerRecord]) {
        for worker in workers {
            if let Err(error) = self
                .registry
                .set_worker_state(worker.address, LivenessState::Terminated)
                .await
            {
                debug!(worker = %worker.address, %error, "worker vanished from the registry");
            }
        }
    }

    /// Create a test on every live worker and drive it through its phases.
    /// Workers that refuse the creation are left out of the run; the run
    /// proceeds with whoever accepted.
    pub async fn run_suite(&self, plan: TestPlan) -> CoordinatorResult<RunSummary> {
        let test_id = self.next_test_id.fetch_add(1, Ordering::SeqCst);
        let live = self.registry.live_workers().await;
        if live.is_empty() {
            return Err(CoordinatorError::NoWorkers {
                suite: plan.suite.clone(),
            });
        }
        info!(test_id, suite = %plan.suite, workers = live.len(), "creating test instances");

        let ack = self
            .dispatcher
            .send(
                Address::all_workers(),
                Operation::CreateTest {
                    test_id,
                    plan: plan.clone(),
                },
            )
            .await?;
        let mut participants = BTreeSet::new();
        for (address, outcome) in &ack.outcomes {
            if outcome.is_success() {
                participants.insert(*address);
            } else {
                warn!(worker = %address, ?outcome, test_id, "test instance not created");
            }
        }
        if participants.is_empty() {
            return Err(CoordinatorError::CreateRejected { test_id });
        }

        let events = self.bus.begin(test_id).await;
        let engine = LifecycleEngine::new(
            test_id,
            plan,
            participants,
            self.settings.lifecycle.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.aggregator),
            self.registry.clone(),
            events,
        );
        let result = engine.drive().await;
        self.bus.end().await;
        result
    }

    /// Tear the cluster down: stop the heartbeat, terminate every agent's
    /// workers with the configured grace, and close all links. The agent
    /// daemons themselves stay up to serve a later coordinator.
    pub async fn shutdown(&self) {
        info!("coordinator shutting down");
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
        }

        let agents: Vec<AgentRecord> = self
            .registry
            .agents()
            .await
            .into_iter()
            .filter(|record| record.state.is_live())
            .collect();
        let grace_secs = self.settings.worker_grace.as_secs();
        let terminations = agents.iter().map(|record| {
            let dispatcher = Arc::clone(&self.dispatcher);
            let address = record.address;
            async move {
                let result = dispatcher
                    .send(address, Operation::TerminateWorkers { grace_secs })
                    .await;
                (address, result)
            }
        });
        for (address, result) in join_all(terminations).await {
            match result {
                Ok(ack) if ack.all_succeeded() => debug!(agent = %address, "workers terminated"),
                Ok(ack) => warn!(
                    agent = %address,
                    failures = ack.failures().len(),
                    "worker termination incomplete"
                ),
                Err(error) => warn!(agent = %address, %error, "worker termination undeliverable"),
            }
        }
        for record in &agents {
            if let Err(error) = self
                .registry
                .set_agent_state(record.address, LivenessState::Terminated)
                .await
            {
                debug!(agent = %record.address, %error, "agent vanished from the registry");
            }
        }
        self.dispatcher.close_all().await;
        self.pump.abort();
    }
}

fn describe_failures(ack: &OperationAck) -> String {
    let failures = ack.failures();
    if failures.is_empty() {
        return "no acks".to_string();
    }
    failures
        .iter()
        .map(|(address, outcome)| format!("{address}: {outcome:?}"))
        .collect::<Vec<_>>()
        .join("; ")
}
