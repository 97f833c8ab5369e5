//! Agent runtime
//!
//! Listens for the coordinator, adopts its own address from the first init
//! operation of a session and serves that session until the link drops or
//! shutdown is signalled. Worker links created by the supervisor feed the
//! same dispatcher, so test traffic fans out and reports flow back without
//! the runtime touching them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use stampede_core::{Address, AddressLevel};
use stampede_dispatch::{
    ConnectionSettings, Dispatcher, HandlerError, OperationHandler, PeerConnection,
};
use stampede_ipc::{
    tcp_transport, AckOutcome, Frame, Operation, OperationAck, OperationEnvelope, TransportPair,
};
use stampede_resilience::ShutdownCoordinator;

use crate::error::{AgentError, AgentResult};
use crate::launcher::WorkerLauncher;
use crate::supervisor::{SupervisorSettings, WorkerSupervisor};

#[derive(Debug, Clone)]
pub struct AgentRuntimeSettings {
    /// How long a spawned worker may take to announce readiness
    pub worker_startup_timeout: Duration,
    /// Grace between a terminate request and a hard kill
    pub worker_grace_timeout: Duration,
    /// Link settings shared by the coordinator uplink and the worker links
    pub connection: ConnectionSettings,
}

impl Default for AgentRuntimeSettings {
    fn default() -> Self {
        Self {
            worker_startup_timeout: Duration::from_secs(30),
            worker_grace_timeout: Duration::from_secs(10),
            connection: ConnectionSettings::default(),
        }
    }
}

/// One agent node. An agent has no identity of its own until a coordinator
/// connects and assigns it one.
pub struct AgentRuntime {
    launcher: Arc<dyn WorkerLauncher>,
    settings: AgentRuntimeSettings,
    shutdown: Arc<ShutdownCoordinator>,
}

impl AgentRuntime {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        settings: AgentRuntimeSettings,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            launcher,
            settings,
            shutdown,
        }
    }

    /// Accept coordinator sessions until shutdown. Sessions are served one
    /// at a time; a component tree has exactly one coordinator.
    pub async fn serve(&self, bind_address: &str, port: u16) -> AgentResult<()> {
        let listener =
            TcpListener::bind((bind_address, port))
                .await
                .map_err(|source| AgentError::Bind {
                    address: format!("{bind_address}:{port}"),
                    source,
                })?;
        info!(bind = %bind_address, port, "agent listening for coordinator");

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    info!(%peer, "coordinator connected");
                    match self.run_session(tcp_transport(stream)).await {
                        Ok(agent) => info!(%peer, %agent, "coordinator session ended"),
                        Err(error) => warn!(%peer, %error, "coordinator session failed"),
                    }
                    if self.shutdown.is_shutting_down() {
                        break;
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("agent stopped");
        Ok(())
    }

    /// Serve one coordinator over the given transport. Returns the adopted
    /// address once the session has been torn down.
    pub async fn run_session(&self, transport: TransportPair) -> AgentResult<Address> {
        let (mut sink, mut source) = transport;
        let mut shutdown_rx = self.shutdown.subscribe();

        // The coordinator names this agent in its first init operation;
        // anything arriving earlier is refused as unreachable.
        let local = loop {
            let frame = tokio::select! {
                frame = source.recv() => frame?,
                _ = shutdown_rx.recv() => return Err(AgentError::NoInit),
            };
            match frame {
                Frame::Operation(envelope)
                    if matches!(envelope.operation, Operation::InitAgent) =>
                {
                    let adopted = envelope.destination;
                    if adopted.level() != AddressLevel::Agent || !adopted.is_concrete() {
                        return Err(AgentError::BadInitAddress(adopted));
                    }
                    if envelope.reply_expected {
                        let ack = OperationAck::success(envelope.correlation_id, adopted);
                        sink.send(Frame::Ack(ack)).await?;
                    }
                    break adopted;
                }
                Frame::Operation(envelope) => {
                    warn!(
                        operation = envelope.operation.name(),
                        "refusing operation before init"
                    );
                    if envelope.reply_expected {
                        let ack = OperationAck::single(
                            envelope.correlation_id,
                            envelope.destination,
                            AckOutcome::Unreachable {
                                message: "agent not initialized".to_string(),
                            },
                        );
                        sink.send(Frame::Ack(ack)).await?;
                    }
                }
                Frame::Ack(_) => continue,
            }
        };
        info!(agent = %local, "agent address adopted");

        let dispatcher = Arc::new(Dispatcher::new(local));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let uplink = PeerConnection::spawn(
            Address::Coordinator,
            (sink, source),
            inbound_tx.clone(),
            self.settings.connection.clone(),
        );
        dispatcher.set_uplink(Arc::clone(&uplink)).await;

        let supervisor = Arc::new(WorkerSupervisor::new(
            local,
            Arc::clone(&dispatcher),
            Arc::clone(&self.launcher),
            inbound_tx,
            SupervisorSettings {
                startup_timeout: self.settings.worker_startup_timeout,
                connection: self.settings.connection.clone(),
            },
        ));
        let handler = Arc::new(AgentHandler {
            agent: local,
            supervisor: Arc::clone(&supervisor),
            shutdown: Arc::clone(&self.shutdown),
        });

        let pump = tokio::spawn(Arc::clone(&dispatcher).run_inbound(inbound_rx, handler));
        tokio::select! {
            _ = uplink.closed() => {
                info!(agent = %local, "coordinator link closed");
            }
            _ = shutdown_rx.recv() => {
                debug!(agent = %local, "shutdown signalled");
                // let the terminate ack drain before the link goes down
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        // Whatever ended the session, no worker may outlive it.
        supervisor
            .terminate_all(self.settings.worker_grace_timeout)
            .await;
        pump.abort();
        dispatcher.close_all().await;
        Ok(local)
    }
}

/// Local operation handling at an agent.
struct AgentHandler {
    agent: Address,
    supervisor: Arc<WorkerSupervisor>,
    shutdown: Arc<ShutdownCoordinator>,
}

#[async_trait]
impl OperationHandler for AgentHandler {
    async fn handle(&self, envelope: OperationEnvelope) -> Result<(), HandlerError> {
        match envelope.operation {
            // Re-delivered inits and liveness probes simply succeed.
            Operation::InitAgent | Operation::Ping => Ok(()),
            // Normally peeled off by the supervisor; a stray one is harmless.
            Operation::WorkerReady => Ok(()),
            Operation::SpawnWorkers { workers } => self
                .supervisor
                .spawn_workers(&workers)
                .await
                .map_err(|e| HandlerError::new(e.to_string())),
            Operation::TerminateWorkers { grace_secs } => {
                self.supervisor
                    .terminate_all(Duration::from_secs(grace_secs))
                    .await;
                Ok(())
            }
            Operation::Terminate => {
                info!(agent = %self.agent, "terminate received");
                if let Err(error) = self.shutdown.initiate() {
                    debug!(agent = %self.agent, %error, "shutdown signal had no listeners");
                }
                Ok(())
            }
            other => Err(HandlerError::new(format!(
                "operation '{}' is not served by an agent",
                other.name()
            ))),
        }
    }
}
