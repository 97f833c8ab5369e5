//! Address allocation and cross-tier fan-out
//!
//! Builds the real coordinator and agent dispatchers over in-memory
//! transports, with scripted workers at the leaves, and checks that a
//! wildcard destination reaches every provisioned worker while a failure
//! stays pinned to the one address that caused it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stampede_core::{Address, WorkerProcessSettings};
use stampede_dispatch::{
    ConnectionSettings, Dispatcher, HandlerError, InboundEnvelope, OperationHandler,
    PeerConnection,
};
use stampede_ipc::{
    channel_transport_pair, AckOutcome, Frame, Operation, OperationAck, OperationEnvelope,
    TransportPair,
};
use stampede_registry::{ComponentRegistry, HostEntry, Inventory};
use stampede_resilience::{BackoffStrategy, RetryPolicy};
use tokio::sync::mpsc;

fn link_settings(ack_deadline: Duration, max_attempts: u32) -> ConnectionSettings {
    ConnectionSettings {
        ack_deadline,
        retry: RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_strategy: BackoffStrategy::Fixed,
            jitter: false,
        },
    }
}

/// Leaf stub that acks every request as the given worker
fn spawn_worker_stub(transport: TransportPair, me: Address) {
    let (mut sink, mut source) = transport;
    tokio::spawn(async move {
        while let Ok(frame) = source.recv().await {
            if let Frame::Operation(envelope) = frame {
                if envelope.reply_expected {
                    let ack = OperationAck::success(envelope.correlation_id, me);
                    if sink.send(Frame::Ack(ack)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Leaf stub that reads everything and never answers
fn spawn_silent_worker(transport: TransportPair) {
    let (_sink, mut source) = transport;
    tokio::spawn(async move { while source.recv().await.is_ok() {} });
}

struct NoLocalOps;

#[async_trait]
impl OperationHandler for NoLocalOps {
    async fn handle(&self, envelope: OperationEnvelope) -> Result<(), HandlerError> {
        Err(HandlerError::new(format!(
            "agent does not serve {}",
            envelope.operation.name()
        )))
    }
}

/// Attach one agent tier under the coordinator dispatcher: the uplink pair,
/// `workers` leaf links and the agent's inbound pump. Worker ids listed in
/// `silent` never ack anything.
async fn attach_agent(
    coordinator: &Dispatcher,
    coordinator_inbound: mpsc::UnboundedSender<InboundEnvelope>,
    agent_id: u32,
    workers: u32,
    silent: &[u32],
) -> Arc<Dispatcher> {
    let agent_address = Address::agent(agent_id);
    let agent = Arc::new(Dispatcher::new(agent_address));
    let (agent_inbound_tx, agent_inbound_rx) = mpsc::unbounded_channel();

    // The coordinator-side deadline outlasts a full leaf retry cycle, so a
    // worker timeout surfaces as that worker's outcome, not the agent's.
    let (coordinator_end, agent_end) = channel_transport_pair();
    let downlink = PeerConnection::spawn(
        agent_address,
        coordinator_end,
        coordinator_inbound,
        link_settings(Duration::from_secs(2), 1),
    );
    coordinator.add_route(agent_address, downlink).await;

    let uplink = PeerConnection::spawn(
        Address::Coordinator,
        agent_end,
        agent_inbound_tx.clone(),
        link_settings(Duration::from_millis(50), 2),
    );
    agent.set_uplink(uplink).await;

    for worker_id in 1..=workers {
        let worker_address = Address::worker(agent_id, worker_id);
        let (near, far) = channel_transport_pair();
        if silent.contains(&worker_id) {
            spawn_silent_worker(far);
        } else {
            spawn_worker_stub(far, worker_address);
        }
        let link = PeerConnection::spawn(
            worker_address,
            near,
            agent_inbound_tx.clone(),
            link_settings(Duration::from_millis(50), 2),
        );
        agent.add_route(worker_address, link).await;
    }

    tokio::spawn(Arc::clone(&agent).run_inbound(agent_inbound_rx, Arc::new(NoLocalOps)));
    agent
}

/// Register the inventory's agents plus `workers_per_agent` members each and
/// return every allocated address in registration order.
async fn provision(inventory: &Inventory, workers_per_agent: usize) -> Vec<String> {
    let registry = ComponentRegistry::new();
    let mut addresses = Vec::new();
    for agent in registry.load_inventory(inventory).await {
        addresses.push(agent.address.to_string());
        let settings = vec![WorkerProcessSettings::member(); workers_per_agent];
        let workers = registry
            .register_workers(agent.address, &settings)
            .await
            .unwrap();
        for worker in workers {
            addresses.push(worker.address.to_string());
        }
    }
    addresses
}

#[tokio::test]
async fn test_same_inventory_provisions_identical_addresses() {
    let inventory = Inventory {
        hosts: vec![
            HostEntry {
                public_ip: "10.0.0.5".to_string(),
                private_ip: Some("192.168.0.5".to_string()),
            },
            HostEntry {
                public_ip: "10.0.0.6".to_string(),
                private_ip: None,
            },
        ],
    };

    let first = provision(&inventory, 2).await;
    let second = provision(&inventory, 2).await;

    assert_eq!(
        first,
        vec!["C_A1", "C_A1_W1", "C_A1_W2", "C_A2", "C_A2_W1", "C_A2_W2"]
    );
    assert_eq!(first, second, "replaying the inventory must not reassign");

    // Every allocated address round-trips through its canonical form
    for text in &first {
        let address: Address = text.parse().unwrap();
        assert_eq!(address.to_string(), *text);
    }
}

#[tokio::test]
async fn test_wildcard_reaches_every_worker_across_agents() {
    let coordinator = Dispatcher::new(Address::Coordinator);
    let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();

    let _a1 = attach_agent(&coordinator, inbound_tx.clone(), 1, 3, &[]).await;
    let _a2 = attach_agent(&coordinator, inbound_tx, 2, 2, &[]).await;

    let ack = coordinator
        .send(Address::all_workers(), Operation::Ping)
        .await
        .unwrap();

    assert!(ack.all_succeeded());
    assert_eq!(ack.outcomes.len(), 5);
    for (agent_id, worker_id) in [(1, 1), (1, 2), (1, 3), (2, 1), (2, 2)] {
        let worker = Address::worker(agent_id, worker_id);
        assert_eq!(
            ack.outcomes.get(&worker),
            Some(&AckOutcome::Success),
            "missing outcome for {worker}"
        );
    }
}

#[tokio::test]
async fn test_unresponsive_worker_is_named_in_the_aggregate() {
    let coordinator = Dispatcher::new(Address::Coordinator);
    let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();

    // Worker 3 of agent 1 swallows every delivery
    let _a1 = attach_agent(&coordinator, inbound_tx.clone(), 1, 3, &[3]).await;
    let _a2 = attach_agent(&coordinator, inbound_tx, 2, 2, &[]).await;

    let ack = coordinator
        .send(Address::all_workers(), Operation::Ping)
        .await
        .unwrap();

    assert!(!ack.all_succeeded());
    assert_eq!(ack.outcomes.len(), 5, "dead branch still has an outcome");

    let failures = ack.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(*failures[0].0, Address::worker(1, 3));
    assert_eq!(*failures[0].1, AckOutcome::TimedOut);

    // The healthy siblings on the same agent are unaffected
    assert_eq!(
        ack.outcomes.get(&Address::worker(1, 1)),
        Some(&AckOutcome::Success)
    );
    assert_eq!(
        ack.outcomes.get(&Address::worker(1, 2)),
        Some(&AckOutcome::Success)
    );
}

#[tokio::test]
async fn test_scoped_wildcard_stays_on_its_branch() {
    let coordinator = Dispatcher::new(Address::Coordinator);
    let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();

    let _a1 = attach_agent(&coordinator, inbound_tx.clone(), 1, 2, &[]).await;
    let _a2 = attach_agent(&coordinator, inbound_tx, 2, 2, &[]).await;

    let ack = coordinator
        .send(Address::workers_of(2), Operation::Ping)
        .await
        .unwrap();

    assert!(ack.all_succeeded());
    assert_eq!(ack.outcomes.len(), 2);
    assert!(ack.outcomes.contains_key(&Address::worker(2, 1)));
    assert!(ack.outcomes.contains_key(&Address::worker(2, 2)));
    assert!(!ack.outcomes.contains_key(&Address::worker(1, 1)));
}

#[tokio::test]
async fn test_concrete_destination_reaches_exactly_one_worker() {
    let coordinator = Dispatcher::new(Address::Coordinator);
    let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();

    let _a1 = attach_agent(&coordinator, inbound_tx.clone(), 1, 2, &[]).await;
    let _a2 = attach_agent(&coordinator, inbound_tx, 2, 2, &[]).await;

    let ack = coordinator
        .send(Address::worker(2, 1), Operation::Ping)
        .await
        .unwrap();

    assert!(ack.all_succeeded());
    assert_eq!(ack.outcomes.len(), 1);
    assert_eq!(
        ack.outcomes.get(&Address::worker(2, 1)),
        Some(&AckOutcome::Success)
    );
}
