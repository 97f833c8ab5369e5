//! Worker supervision
//!
//! The supervisor owns every worker its agent has launched. It wires each
//! worker's link into the dispatcher, waits for the readiness announcement,
//! watches for exits and reports unexpected ones upward, and terminates
//! workers gracefully with a hard kill after the grace window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use stampede_core::{Address, AddressLevel};
use stampede_dispatch::{ConnectionSettings, Dispatcher, InboundEnvelope, PeerConnection};
use stampede_ipc::{Operation, WorkerPlan};

use crate::error::{AgentError, AgentResult};
use crate::launcher::{WorkerControl, WorkerExit, WorkerLauncher};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long a spawned worker may take to announce readiness
    pub startup_timeout: Duration,
    /// Link settings for worker connections
    pub connection: ConnectionSettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            connection: ConnectionSettings::default(),
        }
    }
}

struct SupervisedWorker {
    pid: Option<u32>,
    control: Arc<dyn WorkerControl>,
    /// Set before a deliberate terminate so the watchdog stays quiet.
    expected_exit: Arc<AtomicBool>,
    /// Flips to true once the watchdog has seen the worker go.
    gone: watch::Receiver<bool>,
}

type WorkerMap = Arc<Mutex<HashMap<Address, SupervisedWorker>>>;
type ReadyWaiters = Arc<Mutex<HashMap<Address, oneshot::Sender<()>>>>;

pub struct WorkerSupervisor {
    agent: Address,
    dispatcher: Arc<Dispatcher>,
    launcher: Arc<dyn WorkerLauncher>,
    worker_inbound: mpsc::UnboundedSender<InboundEnvelope>,
    settings: SupervisorSettings,
    workers: WorkerMap,
    ready_waiters: ReadyWaiters,
}

impl WorkerSupervisor {
    /// `node_inbound` is the agent's own operation queue; worker traffic is
    /// forwarded into it after readiness announcements have been peeled off.
    pub fn new(
        agent: Address,
        dispatcher: Arc<Dispatcher>,
        launcher: Arc<dyn WorkerLauncher>,
        node_inbound: mpsc::UnboundedSender<InboundEnvelope>,
        settings: SupervisorSettings,
    ) -> Self {
        let ready_waiters: ReadyWaiters = Arc::new(Mutex::new(HashMap::new()));
        let (worker_inbound, worker_inbound_rx) = mpsc::unbounded_channel();

        // Worker links feed this pump rather than the node queue directly:
        // a spawn request blocks the node queue while it waits for
        // readiness, so readiness must resolve on a path of its own.
        tokio::spawn(forward_worker_inbound(
            worker_inbound_rx,
            Arc::clone(&ready_waiters),
            node_inbound,
        ));

        Self {
            agent,
            dispatcher,
            launcher,
            worker_inbound,
            settings,
            workers: Arc::new(Mutex::new(HashMap::new())),
            ready_waiters,
        }
    }

    /// Launch every worker in the request and wait until each has announced
    /// readiness. Workers already under supervision are skipped, which makes
    /// a redelivered spawn request harmless.
    pub async fn spawn_workers(&self, plans: &[WorkerPlan]) -> AgentResult<()> {
        let mut pending = Vec::new();
        for plan in plans {
            let worker = plan.address;
            if worker.level() != AddressLevel::Worker
                || !worker.is_concrete()
                || worker.parent() != Some(self.agent)
            {
                return Err(AgentError::LaunchFailed {
                    worker,
                    reason: format!("not a worker address under {}", self.agent),
                });
            }
            if self.workers.lock().await.contains_key(&worker) {
                debug!(%worker, "already supervised, skipping spawn");
                continue;
            }

            let launched = self.launcher.launch(plan).await?;
            info!(%worker, pid = ?launched.pid, kind = %plan.settings.kind, "worker launched");

            // The waiter must exist before the link starts reading, or an
            // eager readiness announcement could slip past it.
            let (ready_tx, ready_rx) = oneshot::channel();
            self.ready_waiters.lock().await.insert(worker, ready_tx);

            let connection = PeerConnection::spawn(
                worker,
                launched.transport,
                self.worker_inbound.clone(),
                self.settings.connection.clone(),
            );
            self.dispatcher.add_route(worker, connection).await;

            let expected = Arc::new(AtomicBool::new(false));
            let (gone_tx, gone_rx) = watch::channel(false);
            self.workers.lock().await.insert(
                worker,
                SupervisedWorker {
                    pid: launched.pid,
                    control: launched.control,
                    expected_exit: Arc::clone(&expected),
                    gone: gone_rx,
                },
            );
            tokio::spawn(watch_worker(
                worker,
                launched.exited,
                expected,
                gone_tx,
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.workers),
                Arc::clone(&self.ready_waiters),
            ));
            pending.push((worker, ready_rx));
        }

        let startup_timeout = self.settings.startup_timeout;
        let waits = pending.into_iter().map(|(worker, ready)| async move {
            match timeout(startup_timeout, ready).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(AgentError::StartupFailed {
                    worker,
                    reason: "exited before announcing readiness".to_string(),
                }),
                Err(_) => Err(AgentError::StartupFailed {
                    worker,
                    reason: format!("no readiness announcement within {startup_timeout:?}"),
                }),
            }
        });
        for result in futures::future::join_all(waits).await {
            result?;
        }
        Ok(())
    }

    /// Ask one worker to stop, escalating to a hard kill once the grace
    /// window expires. Unknown workers are ignored.
    pub async fn terminate_worker(&self, worker: Address, grace: Duration) {
        let handles = {
            let workers = self.workers.lock().await;
            workers.get(&worker).map(|entry| {
                (
                    Arc::clone(&entry.control),
                    Arc::clone(&entry.expected_exit),
                    entry.gone.clone(),
                )
            })
        };
        let Some((control, expected, gone)) = handles else {
            debug!(%worker, "terminate for unsupervised worker");
            return;
        };
        expected.store(true, Ordering::SeqCst);
        info!(%worker, ?grace, "terminating worker");

        let mut graceful_gone = gone.clone();
        let graceful = async {
            if let Err(error) = self.dispatcher.send(worker, Operation::Terminate).await {
                debug!(%worker, %error, "terminate delivery failed");
            }
            let _ = graceful_gone.wait_for(|gone| *gone).await;
        };
        if timeout(grace, graceful).await.is_err() {
            warn!(%worker, "grace window expired, killing worker");
            control.kill();
            let mut killed_gone = gone.clone();
            let _ = killed_gone.wait_for(|gone| *gone).await;
        }
        debug!(%worker, "worker terminated");
    }

    /// Terminate every supervised worker, concurrently.
    pub async fn terminate_all(&self, grace: Duration) {
        let addresses: Vec<Address> = self.workers.lock().await.keys().copied().collect();
        if addresses.is_empty() {
            return;
        }
        info!(count = addresses.len(), "terminating all workers");
        futures::future::join_all(
            addresses
                .into_iter()
                .map(|worker| self.terminate_worker(worker, grace)),
        )
        .await;
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Supervised worker addresses, in address order.
    pub async fn workers(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.workers.lock().await.keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub async fn pid_of(&self, worker: &Address) -> Option<u32> {
        self.workers.lock().await.get(worker).and_then(|entry| entry.pid)
    }
}

/// Drains the worker links: readiness announcements resolve their startup
/// waits right here, everything else joins the node's inbound queue.
async fn forward_worker_inbound(
    mut worker_inbound: mpsc::UnboundedReceiver<InboundEnvelope>,
    ready_waiters: ReadyWaiters,
    node_inbound: mpsc::UnboundedSender<InboundEnvelope>,
) {
    while let Some(inbound) = worker_inbound.recv().await {
        if matches!(inbound.envelope.operation, Operation::WorkerReady) {
            let worker = inbound.envelope.source;
            if let Some(waiter) = ready_waiters.lock().await.remove(&worker) {
                info!(%worker, "worker ready");
                let _ = waiter.send(());
            } else {
                debug!(%worker, "readiness from unknown or already-ready worker");
            }
        } else if node_inbound.send(inbound).is_err() {
            break;
        }
    }
}

/// Runs once per worker: waits for the exit event, tears the link down and
/// reports the exit upward when nobody asked for it.
async fn watch_worker(
    worker: Address,
    exited: oneshot::Receiver<WorkerExit>,
    expected: Arc<AtomicBool>,
    gone: watch::Sender<bool>,
    dispatcher: Arc<Dispatcher>,
    workers: WorkerMap,
    ready_waiters: ReadyWaiters,
) {
    let exit = match exited.await {
        Ok(exit) => exit,
        // The launcher dropped the sender; treat it as an exit without detail.
        Err(_) => WorkerExit {
            exit_code: None,
            last_output: Vec::new(),
        },
    };

    if let Some(connection) = dispatcher.remove_route(&worker).await {
        connection.close();
    }
    workers.lock().await.remove(&worker);
    // A worker that dies before announcing readiness fails its startup wait.
    ready_waiters.lock().await.remove(&worker);
    let _ = gone.send(true);

    if expected.load(Ordering::SeqCst) {
        debug!(%worker, exit_code = ?exit.exit_code, "worker exited after terminate");
    } else {
        warn!(%worker, exit_code = ?exit.exit_code, "worker exited unexpectedly");
        let report = Operation::ProcessExited {
            worker,
            exit_code: exit.exit_code,
            last_output: exit.last_output,
        };
        if let Err(error) = dispatcher.notify_up(report).await {
            debug!(%worker, %error, "could not report worker exit");
        }
    }
}
