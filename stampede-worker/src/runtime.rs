//! Worker process runtime
//!
//! Binds a leaf dispatcher to the transport toward the supervising agent,
//! announces readiness and serves operations until terminated or until the
//! agent side of the link goes away. Inbound operations run serially in
//! arrival order; container reports ride one outbound pump so the per-link
//! order toward the coordinator holds as well.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stampede_core::{Address, AddressLevel, TestPlan};
use stampede_dispatch::{
    ConnectionSettings, Dispatcher, HandlerError, OperationHandler, PeerConnection,
};
use stampede_ipc::{Operation, OperationEnvelope, TransportPair};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::container::TestContainer;
use crate::error::{WorkerError, WorkerResult};
use crate::suite::SuiteCatalog;

/// Knobs the agent-facing runtime needs beyond the address.
#[derive(Debug, Clone)]
pub struct WorkerRuntimeSettings {
    /// Probe rotation cadence during RUN.
    pub probe_flush_interval: Duration,
    /// Uplink request settings.
    pub connection: ConnectionSettings,
}

impl Default for WorkerRuntimeSettings {
    fn default() -> Self {
        Self {
            probe_flush_interval: Duration::from_millis(1000),
            connection: ConnectionSettings::default(),
        }
    }
}

/// One worker process (or in-process worker task).
#[derive(Debug)]
pub struct WorkerRuntime {
    address: Address,
    catalog: Arc<SuiteCatalog>,
    settings: WorkerRuntimeSettings,
}

impl WorkerRuntime {
    pub fn new(
        address: Address,
        catalog: Arc<SuiteCatalog>,
        settings: WorkerRuntimeSettings,
    ) -> WorkerResult<WorkerRuntime> {
        if address.level() != AddressLevel::Worker {
            return Err(WorkerError::NotAWorkerAddress(address));
        }
        Ok(WorkerRuntime {
            address,
            catalog,
            settings,
        })
    }

    /// Serve the worker over the given transport until the agent terminates
    /// it or drops the link.
    pub async fn run(self, transport: TransportPair) -> WorkerResult<()> {
        // new() only admits worker-level addresses, which all have a parent
        let parent = self
            .address
            .parent()
            .ok_or(WorkerError::NotAWorkerAddress(self.address))?;

        let dispatcher = Arc::new(Dispatcher::leaf(self.address));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let uplink = PeerConnection::spawn(
            parent,
            transport,
            inbound_tx,
            self.settings.connection.clone(),
        );
        dispatcher.set_uplink(uplink).await;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Operation>();
        let shutdown = Arc::new(Notify::new());
        let handler = Arc::new(WorkerHandler {
            address: self.address,
            catalog: Arc::clone(&self.catalog),
            containers: RwLock::new(HashMap::new()),
            outbound: outbound_tx,
            flush_interval: self.settings.probe_flush_interval,
            shutdown: Arc::clone(&shutdown),
        });

        // container reports -> coordinator
        let report_dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            while let Some(operation) = outbound_rx.recv().await {
                if let Err(error) = report_dispatcher.notify_up(operation).await {
                    warn!(%error, "dropping report, uplink gone");
                }
            }
        });

        let ready = OperationEnvelope::notification(self.address, parent, Operation::WorkerReady);
        dispatcher.forward_up(ready).await?;
        info!(worker = %self.address, "worker ready");

        let mut pump = tokio::spawn(Arc::clone(&dispatcher).run_inbound(inbound_rx, handler));

        tokio::select! {
            _ = shutdown.notified() => {
                // give the terminate ack a moment to drain
                tokio::time::sleep(Duration::from_millis(50)).await;
                pump.abort();
            }
            _ = &mut pump => {
                debug!(worker = %self.address, "agent link closed");
            }
        }
        dispatcher.close_all().await;
        info!(worker = %self.address, "worker stopped");
        Ok(())
    }
}

/// Local operation handling at the worker leaf. Test-level destinations
/// terminate here and resolve to in-process containers.
struct WorkerHandler {
    address: Address,
    catalog: Arc<SuiteCatalog>,
    containers: RwLock<HashMap<u32, Arc<TestContainer>>>,
    outbound: mpsc::UnboundedSender<Operation>,
    flush_interval: Duration,
    shutdown: Arc<Notify>,
}

impl WorkerHandler {
    async fn create_test(&self, test_id: u32, plan: TestPlan) -> WorkerResult<()> {
        let mut containers = self.containers.write().await;
        if containers.contains_key(&test_id) {
            debug!(worker = %self.address, test_id, "duplicate create accepted");
            return Ok(());
        }
        let suite = self
            .catalog
            .get(&plan.suite)
            .ok_or_else(|| WorkerError::UnknownSuite(plan.suite.clone()))?;
        info!(worker = %self.address, test_id, suite = %plan.suite, "test instance created");
        let container = TestContainer::new(
            self.address,
            test_id,
            plan,
            suite,
            self.outbound.clone(),
            self.flush_interval,
        )?;
        containers.insert(test_id, Arc::new(container));
        Ok(())
    }

    async fn container(&self, test_id: u32) -> WorkerResult<Arc<TestContainer>> {
        self.containers
            .read()
            .await
            .get(&test_id)
            .cloned()
            .ok_or(WorkerError::UnknownTest(test_id))
    }
}

#[async_trait]
impl OperationHandler for WorkerHandler {
    async fn handle(&self, envelope: OperationEnvelope) -> Result<(), HandlerError> {
        match envelope.operation {
            Operation::Ping => Ok(()),
            Operation::Terminate => {
                info!(worker = %self.address, "terminate received");
                self.shutdown.notify_one();
                Ok(())
            }
            Operation::CreateTest { test_id, plan } => self
                .create_test(test_id, plan)
                .await
                .map_err(|e| HandlerError::new(e.to_string())),
            Operation::StartPhase { test_id, phase } => {
                let container = self
                    .container(test_id)
                    .await
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                container
                    .start_phase(phase)
                    .map_err(|e| HandlerError::new(e.to_string()))
            }
            Operation::StopRun { test_id } => {
                let container = self
                    .container(test_id)
                    .await
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                container.stop_run();
                Ok(())
            }
            Operation::AbortRun { test_id, reason } => {
                let container = self
                    .container(test_id)
                    .await
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                container.abort(&reason);
                Ok(())
            }
            other => Err(HandlerError::new(format!(
                "operation '{}' is not served by a worker",
                other.name()
            ))),
        }
    }
}
