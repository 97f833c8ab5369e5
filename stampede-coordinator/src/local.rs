//! Single-process cluster
//!
//! Runs the whole component tree inside one runtime: agent sessions ride
//! channel transports instead of TCP and workers run as tasks instead of
//! child processes. The semantics upstream of the transport are identical
//! to a distributed deployment, which is what makes this the backing for
//! single-machine runs and the integration suite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stampede_agent::{
    AgentError, AgentResult, AgentRuntime, AgentRuntimeSettings, LaunchedWorker, WorkerControl,
    WorkerExit, WorkerLauncher,
};
use stampede_core::{Address, TestPlan};
use stampede_ipc::{channel_transport_pair, TransportPair, WorkerPlan};
use stampede_registry::{AgentRecord, HostEntry, Inventory};
use stampede_report::{ResultAggregator, RunSummary};
use stampede_resilience::ShutdownCoordinator;
use stampede_worker::{SuiteCatalog, WorkerRuntime, WorkerRuntimeSettings};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::coordinator::{AgentConnector, Coordinator, CoordinatorSettings, WorkerLayout};
use crate::error::CoordinatorResult;

/// Launches workers as tasks on the current runtime.
pub struct InProcessLauncher {
    catalog: Arc<SuiteCatalog>,
    settings: WorkerRuntimeSettings,
}

impl InProcessLauncher {
    pub fn new(catalog: Arc<SuiteCatalog>, settings: WorkerRuntimeSettings) -> InProcessLauncher {
        InProcessLauncher { catalog, settings }
    }
}

struct TaskControl {
    abort: tokio::task::AbortHandle,
}

impl WorkerControl for TaskControl {
    fn kill(&self) {
        self.abort.abort();
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, plan: &WorkerPlan) -> AgentResult<LaunchedWorker> {
        let (near, far) = channel_transport_pair();
        let runtime = WorkerRuntime::new(plan.address, Arc::clone(&self.catalog), self.settings.clone())
            .map_err(|error| AgentError::LaunchFailed {
                worker: plan.address,
                reason: error.to_string(),
            })?;
        let task = tokio::spawn(runtime.run(far));
        let control: Arc<dyn WorkerControl> = Arc::new(TaskControl {
            abort: task.abort_handle(),
        });

        // Translate task completion into the exit report a process would give
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let exit = match task.await {
                Ok(Ok(())) => WorkerExit {
                    exit_code: Some(0),
                    last_output: Vec::new(),
                },
                Ok(Err(error)) => WorkerExit {
                    exit_code: Some(1),
                    last_output: vec![error.to_string()],
                },
                Err(join) if join.is_cancelled() => WorkerExit {
                    exit_code: None,
                    last_output: vec!["worker task aborted".to_string()],
                },
                Err(join) => WorkerExit {
                    exit_code: Some(101),
                    last_output: vec![format!("worker task panicked: {join}")],
                },
            };
            let _ = exit_tx.send(exit);
        });

        Ok(LaunchedWorker {
            transport: near,
            pid: None,
            exited: exit_rx,
            control,
        })
    }
}

/// Hands the coordinator a channel transport and runs the agent session on
/// the far end.
struct InProcessConnector {
    catalog: Arc<SuiteCatalog>,
    agent_settings: AgentRuntimeSettings,
    worker_settings: WorkerRuntimeSettings,
    shutdown: Arc<ShutdownCoordinator>,
    sessions: Mutex<Vec<JoinHandle<AgentResult<Address>>>>,
}

#[async_trait]
impl AgentConnector for InProcessConnector {
    async fn connect(&self, _agent: &AgentRecord, _port: u16) -> CoordinatorResult<TransportPair> {
        let (near, far) = channel_transport_pair();
        let launcher: Arc<dyn WorkerLauncher> = Arc::new(InProcessLauncher::new(
            Arc::clone(&self.catalog),
            self.worker_settings.clone(),
        ));
        let runtime = AgentRuntime::new(
            launcher,
            self.agent_settings.clone(),
            Arc::clone(&self.shutdown),
        );
        let session = tokio::spawn(async move { runtime.run_session(far).await });
        self.sessions.lock().await.push(session);
        Ok(near)
    }
}

/// A full cluster in one runtime, from bootstrap to teardown.
pub struct LocalCluster {
    coordinator: Coordinator,
    connector: Arc<InProcessConnector>,
}

impl LocalCluster {
    /// Bring up `agents` in-process agent sessions and provision the
    /// layout's workers across them.
    pub async fn start(
        catalog: Arc<SuiteCatalog>,
        agents: u32,
        layout: &WorkerLayout,
        settings: CoordinatorSettings,
        aggregator: Arc<ResultAggregator>,
    ) -> CoordinatorResult<LocalCluster> {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let connector = Arc::new(InProcessConnector {
            catalog,
            agent_settings: AgentRuntimeSettings {
                connection: settings.connection.clone(),
                ..AgentRuntimeSettings::default()
            },
            worker_settings: WorkerRuntimeSettings::default(),
            shutdown: Arc::clone(&shutdown),
            sessions: Mutex::new(Vec::new()),
        });
        let coordinator = Coordinator::new(
            settings,
            aggregator,
            Arc::clone(&connector) as Arc<dyn AgentConnector>,
            shutdown,
        );

        let hosts = (1..=agents)
            .map(|index| HostEntry {
                public_ip: format!("local-{index}"),
                private_ip: None,
            })
            .collect();
        coordinator.bootstrap(&Inventory { hosts }).await?;
        coordinator.provision(layout).await?;
        Ok(LocalCluster {
            coordinator,
            connector,
        })
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub async fn run_suite(&self, plan: TestPlan) -> CoordinatorResult<RunSummary> {
        self.coordinator.run_suite(plan).await
    }

    /// Shut the coordinator down and wait for the agent sessions to drain.
    pub async fn stop(self) {
        self.coordinator.shutdown().await;
        let sessions = {
            let mut guard = self.connector.sessions.lock().await;
            std::mem::take(&mut *guard)
        };
        for session in sessions {
            match timeout(Duration::from_secs(5), session).await {
                Ok(Ok(Ok(agent))) => debug!(%agent, "agent session ended"),
                Ok(Ok(Err(error))) => warn!(%error, "agent session failed"),
                Ok(Err(join)) => warn!(%join, "agent session panicked"),
                Err(_) => warn!("agent session did not drain in time"),
            }
        }
    }
}
