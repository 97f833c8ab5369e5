//! Coordinator-side handling of upward operations
//!
//! Reports from workers land in the aggregator, lifecycle signals are
//! republished onto the run event bus, and anything addressed at the
//! coordinator that only a lower tier serves is refused. Phase completions
//! deliberately do not touch the aggregator here: the lifecycle engine is
//! the sole writer of phase outcomes, so a completion arriving after the
//! engine already resolved its worker is dropped instead of clobbering the
//! resolution.

use std::sync::Arc;

use async_trait::async_trait;
use stampede_agent::{describe_exit, WorkerExit};
use stampede_dispatch::{HandlerError, OperationHandler};
use stampede_ipc::{Operation, OperationEnvelope};
use stampede_registry::{ComponentRegistry, LivenessState};
use stampede_report::ResultAggregator;
use tracing::{debug, warn};

use crate::lifecycle::{RunEvent, RunEventBus};

pub struct CoordinatorHandler {
    registry: ComponentRegistry,
    aggregator: Arc<ResultAggregator>,
    bus: Arc<RunEventBus>,
}

impl CoordinatorHandler {
    pub fn new(
        registry: ComponentRegistry,
        aggregator: Arc<ResultAggregator>,
        bus: Arc<RunEventBus>,
    ) -> CoordinatorHandler {
        CoordinatorHandler {
            registry,
            aggregator,
            bus,
        }
    }
}

#[async_trait]
impl OperationHandler for CoordinatorHandler {
    async fn handle(&self, envelope: OperationEnvelope) -> Result<(), HandlerError> {
        let source = envelope.source;
        match envelope.operation {
            Operation::ProbeReport {
                test_id,
                probe,
                interval,
            } => {
                self.aggregator
                    .record_probe(source, test_id, &probe, interval)
                    .await;
                Ok(())
            }
            Operation::ExceptionReport {
                test_id,
                phase,
                message,
                trace,
            } => {
                match self
                    .aggregator
                    .record_exception(source, test_id, phase, &message, trace.as_deref())
                    .await
                {
                    Ok(Some(id)) => debug!(%source, test_id, id, "exception stored"),
                    Ok(None) => debug!(%source, test_id, "exception dropped, store at capacity"),
                    Err(error) => warn!(%source, test_id, %error, "exception not persisted"),
                }
                Ok(())
            }
            Operation::PhaseCompleted {
                test_id,
                phase,
                outcome,
            } => {
                self.bus
                    .emit(
                        Some(test_id),
                        RunEvent::PhaseCompleted {
                            worker: source,
                            phase,
                            outcome,
                        },
                    )
                    .await;
                Ok(())
            }
            Operation::ProcessExited {
                worker,
                exit_code,
                last_output,
            } => {
                let exit = WorkerExit {
                    exit_code,
                    last_output,
                };
                let reason = describe_exit(&worker, &exit);
                warn!(%worker, %reason, "worker process gone");
                if let Err(error) = self
                    .registry
                    .set_worker_state(worker, LivenessState::Terminated)
                    .await
                {
                    debug!(%worker, %error, "exit report for unregistered worker");
                }
                self.bus
                    .emit(None, RunEvent::WorkerLost { worker, reason })
                    .await;
                Ok(())
            }
            Operation::WorkerReady => {
                debug!(%source, "worker ready");
                Ok(())
            }
            Operation::Ping => Ok(()),
            other => Err(HandlerError::new(format!(
                "operation '{}' is not served by the coordinator",
                other.name()
            ))),
        }
    }
}
