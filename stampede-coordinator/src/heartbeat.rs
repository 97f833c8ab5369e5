//! Agent liveness monitoring
//!
//! Pings every registered agent on a fixed cadence. An agent that misses
//! the threshold is declared unreachable in the registry and announced on
//! the run event bus so an in-flight run can weigh the loss; an agent that
//! answers again is quietly restored. Worker liveness is not probed from
//! here: the agent supervising a worker reports its death directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use stampede_core::Address;
use stampede_dispatch::Dispatcher;
use stampede_ipc::Operation;
use stampede_registry::{ComponentRegistry, LivenessState};
use stampede_resilience::ShutdownSignal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::lifecycle::{RunEvent, RunEventBus};

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSettings {
    /// Sweep cadence; one ping attempt also waits at most this long
    pub interval: Duration,
    /// Consecutive missed sweeps before an agent is declared unreachable
    pub miss_threshold: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        HeartbeatSettings {
            interval: Duration::from_secs(5),
            miss_threshold: 3,
        }
    }
}

pub struct HeartbeatMonitor {
    dispatcher: Arc<Dispatcher>,
    registry: ComponentRegistry,
    bus: Arc<RunEventBus>,
    settings: HeartbeatSettings,
}

impl HeartbeatMonitor {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        registry: ComponentRegistry,
        bus: Arc<RunEventBus>,
        settings: HeartbeatSettings,
    ) -> HeartbeatMonitor {
        HeartbeatMonitor {
            dispatcher,
            registry,
            bus,
            settings,
        }
    }

    /// Run the sweep loop until shutdown. Consumes the monitor.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<ShutdownSignal>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut misses: HashMap<Address, u32> = HashMap::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep(&mut misses).await,
                    _ = shutdown.recv() => break,
                }
            }
            debug!("heartbeat monitor stopped");
        })
    }

    async fn sweep(&self, misses: &mut HashMap<Address, u32>) {
        let agents: Vec<_> = self
            .registry
            .agents()
            .await
            .into_iter()
            .filter(|record| !record.state.is_terminal())
            .collect();
        let pings = agents.iter().map(|record| {
            let dispatcher = Arc::clone(&self.dispatcher);
            let address = record.address;
            let deadline = self.settings.interval;
            async move {
                let answer = timeout(deadline, dispatcher.send(address, Operation::Ping)).await;
                (address, answer)
            }
        });

        for (address, answer) in join_all(pings).await {
            let was = agents
                .iter()
                .find(|record| record.address == address)
                .map(|record| record.state);
            if matches!(&answer, Ok(Ok(ack)) if ack.all_succeeded()) {
                misses.remove(&address);
                if was == Some(LivenessState::Unreachable) {
                    info!(agent = %address, "agent reachable again");
                }
                if let Err(error) = self
                    .registry
                    .set_agent_state(address, LivenessState::Alive)
                    .await
                {
                    debug!(agent = %address, %error, "agent vanished from the registry");
                }
            } else {
                let count = misses.entry(address).or_insert(0);
                *count += 1;
                debug!(agent = %address, misses = *count, "heartbeat missed");
                if *count >= self.settings.miss_threshold
                    && was != Some(LivenessState::Unreachable)
                {
                    warn!(agent = %address, misses = *count, "agent declared unreachable");
                    match self
                        .registry
                        .set_agent_state(address, LivenessState::Unreachable)
                        .await
                    {
                        Ok(()) => {
                            self.bus
                                .emit(None, RunEvent::AgentUnreachable { agent: address })
                                .await;
                        }
                        Err(error) => {
                            debug!(agent = %address, %error, "agent vanished from the registry");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_dispatch::{ConnectionSettings, PeerConnection};
    use stampede_ipc::{channel_transport_pair, Frame, OperationAck, TransportPair};
    use stampede_resilience::{RetryPolicy, ShutdownCoordinator};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Far end of an agent link: acks requests only while `answering` holds.
    fn responder(transport: TransportPair, answering: Arc<AtomicBool>) {
        let (mut sink, mut source) = transport;
        tokio::spawn(async move {
            while let Ok(frame) = source.recv().await {
                if let Frame::Operation(envelope) = frame {
                    if envelope.reply_expected && answering.load(Ordering::SeqCst) {
                        let ack =
                            OperationAck::success(envelope.correlation_id, envelope.destination);
                        if sink.send(Frame::Ack(ack)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn wait_for_state(
        registry: &ComponentRegistry,
        agent: Address,
        wanted: LivenessState,
    ) -> bool {
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if registry.agent(agent).await.unwrap().state == wanted {
                return true;
            }
        }
        false
    }

    #[tokio::test]
    async fn test_missed_heartbeats_declare_and_recovery_restores() {
        let registry = ComponentRegistry::new();
        let agent = registry
            .register_agent("10.0.0.1".to_string(), "10.0.0.1".to_string())
            .await;
        registry
            .set_agent_state(agent.address, LivenessState::Alive)
            .await
            .unwrap();

        let dispatcher = Arc::new(Dispatcher::new(Address::Coordinator));
        let (inbound_tx, _inbound_rx) = tokio::sync::mpsc::unbounded_channel();
        let (near, far) = channel_transport_pair();
        let answering = Arc::new(AtomicBool::new(true));
        responder(far, Arc::clone(&answering));
        let connection = PeerConnection::spawn(
            agent.address,
            near,
            inbound_tx,
            ConnectionSettings {
                ack_deadline: Duration::from_millis(40),
                retry: RetryPolicy::none(),
            },
        );
        dispatcher.add_route(agent.address, connection).await;

        let bus = Arc::new(RunEventBus::new());
        let mut events = bus.begin(1).await;
        let shutdown = ShutdownCoordinator::new();
        let monitor = HeartbeatMonitor::new(
            Arc::clone(&dispatcher),
            registry.clone(),
            Arc::clone(&bus),
            HeartbeatSettings {
                interval: Duration::from_millis(50),
                miss_threshold: 2,
            },
        );
        let handle = monitor.spawn(shutdown.subscribe());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            registry.agent(agent.address).await.unwrap().state,
            LivenessState::Alive,
            "an answering agent stays alive"
        );

        answering.store(false, Ordering::SeqCst);
        assert!(
            wait_for_state(&registry, agent.address, LivenessState::Unreachable).await,
            "missing the threshold declares the agent unreachable"
        );
        let mut announced = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RunEvent::AgentUnreachable { agent: a } if a == agent.address) {
                announced = true;
            }
        }
        assert!(announced, "the loss is announced on the event bus");

        answering.store(true, Ordering::SeqCst);
        assert!(
            wait_for_state(&registry, agent.address, LivenessState::Alive).await,
            "an agent that answers again is restored"
        );

        shutdown.initiate().unwrap();
        handle.await.unwrap();
    }
}
