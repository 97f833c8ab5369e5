//! The component registry
//!
//! Address allocation is dense and one-based: the first agent is `C_A1`, its
//! first worker `C_A1_W1`. Indices are never reused within a run, which keeps
//! every address unambiguous in logs and result files.

use crate::error::{RegistryError, RegistryResult};
use crate::inventory::Inventory;
use crate::types::{AgentRecord, LivenessState, WorkerRecord};
use chrono::Utc;
use stampede_core::{Address, AddressLevel, WorkerProcessSettings};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cluster-wide component counts, used for reachability decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryCounts {
    pub agents: usize,
    pub live_agents: usize,
    pub workers: usize,
    pub live_workers: usize,
}

#[derive(Debug, Default)]
struct RegistryInner {
    agents: BTreeMap<Address, AgentRecord>,
    next_agent: u32,
}

/// Shared, authoritative view of the cluster
///
/// Cheap to clone; all clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one agent for every inventory host, in file order
    pub async fn load_inventory(&self, inventory: &Inventory) -> Vec<AgentRecord> {
        let mut records = Vec::with_capacity(inventory.hosts.len());
        for host in &inventory.hosts {
            let record = self
                .register_agent(host.public_ip.clone(), host.private_ip().to_string())
                .await;
            records.push(record);
        }
        records
    }

    /// Register a single agent, allocating the next agent address
    pub async fn register_agent(&self, public_ip: String, private_ip: String) -> AgentRecord {
        let mut inner = self.inner.write().await;
        inner.next_agent += 1;
        let address = Address::agent(inner.next_agent);
        let record = AgentRecord::new(address, public_ip, private_ip);
        inner.agents.insert(address, record.clone());
        record
    }

    /// Register workers on an agent, allocating the next worker addresses
    pub async fn register_workers(
        &self,
        agent: Address,
        settings: &[WorkerProcessSettings],
    ) -> RegistryResult<Vec<WorkerRecord>> {
        if agent.level() != AddressLevel::Agent {
            return Err(RegistryError::NotAnAgent { address: agent });
        }
        let agent_index = agent
            .agent_index()
            .and_then(|i| i.id())
            .ok_or(RegistryError::NotAnAgent { address: agent })?;
        let mut inner = self.inner.write().await;
        let record = inner
            .agents
            .get_mut(&agent)
            .ok_or(RegistryError::UnknownAgent { address: agent })?;

        let mut workers = Vec::with_capacity(settings.len());
        for s in settings {
            let address = Address::worker(agent_index, record.next_worker);
            record.next_worker += 1;
            let worker = WorkerRecord::new(address, s.clone());
            record.workers.insert(address, worker.clone());
            workers.push(worker);
        }
        Ok(workers)
    }

    /// Look up one agent record
    pub async fn agent(&self, address: Address) -> Option<AgentRecord> {
        self.inner.read().await.agents.get(&address).cloned()
    }

    /// All agent records, in address order
    pub async fn agents(&self) -> Vec<AgentRecord> {
        self.inner.read().await.agents.values().cloned().collect()
    }

    /// Look up one worker record anywhere in the cluster
    pub async fn find_worker(&self, address: Address) -> Option<WorkerRecord> {
        let parent = address.parent()?;
        let inner = self.inner.read().await;
        inner.agents.get(&parent)?.workers.get(&address).cloned()
    }

    /// Worker records on one agent, in address order
    pub async fn workers_of(&self, agent: Address) -> RegistryResult<Vec<WorkerRecord>> {
        let inner = self.inner.read().await;
        let record = inner
            .agents
            .get(&agent)
            .ok_or(RegistryError::UnknownAgent { address: agent })?;
        Ok(record.workers.values().cloned().collect())
    }

    /// Every worker record in the cluster, in address order
    pub async fn all_workers(&self) -> Vec<WorkerRecord> {
        let inner = self.inner.read().await;
        inner
            .agents
            .values()
            .flat_map(|a| a.workers.values().cloned())
            .collect()
    }

    /// Addresses of every worker currently able to take work, in address order
    pub async fn live_workers(&self) -> Vec<Address> {
        let inner = self.inner.read().await;
        inner
            .agents
            .values()
            .flat_map(|a| a.live_workers().map(|w| w.address))
            .collect()
    }

    /// Update an agent's liveness
    ///
    /// Terminating an agent terminates every worker it hosts: the processes
    /// cannot outlive their supervisor.
    pub async fn set_agent_state(
        &self,
        address: Address,
        state: LivenessState,
    ) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .agents
            .get_mut(&address)
            .ok_or(RegistryError::UnknownAgent { address })?;
        record.state = state;
        if state == LivenessState::Alive {
            record.last_seen = Utc::now();
        }
        if state == LivenessState::Terminated {
            for worker in record.workers.values_mut() {
                worker.state = LivenessState::Terminated;
            }
        }
        Ok(())
    }

    /// Update a worker's liveness
    pub async fn set_worker_state(
        &self,
        address: Address,
        state: LivenessState,
    ) -> RegistryResult<()> {
        if address.level() != AddressLevel::Worker {
            return Err(RegistryError::NotAWorker { address });
        }
        let parent = address
            .parent()
            .ok_or(RegistryError::NotAWorker { address })?;
        let mut inner = self.inner.write().await;
        let agent = inner
            .agents
            .get_mut(&parent)
            .ok_or(RegistryError::UnknownWorker { address })?;
        let worker = agent
            .workers
            .get_mut(&address)
            .ok_or(RegistryError::UnknownWorker { address })?;
        worker.state = state;
        Ok(())
    }

    /// Drop an agent and its workers from the registry
    ///
    /// For explicit teardown only; the agent's index is retired, never
    /// reallocated, so addresses in older logs stay unambiguous.
    pub async fn remove_agent(&self, address: Address) -> RegistryResult<AgentRecord> {
        let mut inner = self.inner.write().await;
        inner
            .agents
            .remove(&address)
            .ok_or(RegistryError::UnknownAgent { address })
    }

    /// Record that an agent was just heard from
    pub async fn touch_agent(&self, address: Address) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .agents
            .get_mut(&address)
            .ok_or(RegistryError::UnknownAgent { address })?;
        record.last_seen = Utc::now();
        Ok(())
    }

    /// Current component counts
    pub async fn counts(&self) -> RegistryCounts {
        let inner = self.inner.read().await;
        let mut counts = RegistryCounts {
            agents: 0,
            live_agents: 0,
            workers: 0,
            live_workers: 0,
        };
        for agent in inner.agents.values() {
            counts.agents += 1;
            if agent.state.is_live() {
                counts.live_agents += 1;
            }
            for worker in agent.workers.values() {
                counts.workers += 1;
                if worker.state.is_live() {
                    counts.live_workers += 1;
                }
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> WorkerProcessSettings {
        WorkerProcessSettings::member()
    }

    #[tokio::test]
    async fn test_agent_addresses_are_dense() {
        let registry = ComponentRegistry::new();
        let a1 = registry.register_agent("h1".into(), "h1".into()).await;
        let a2 = registry.register_agent("h2".into(), "h2".into()).await;
        assert_eq!(a1.address.to_string(), "C_A1");
        assert_eq!(a2.address.to_string(), "C_A2");
    }

    #[tokio::test]
    async fn test_worker_addresses_are_per_agent() {
        let registry = ComponentRegistry::new();
        let a1 = registry.register_agent("h1".into(), "h1".into()).await;
        let a2 = registry.register_agent("h2".into(), "h2".into()).await;

        let w1 = registry
            .register_workers(a1.address, &[member(), member()])
            .await
            .unwrap();
        let w2 = registry
            .register_workers(a2.address, &[member()])
            .await
            .unwrap();

        assert_eq!(w1[0].address.to_string(), "C_A1_W1");
        assert_eq!(w1[1].address.to_string(), "C_A1_W2");
        assert_eq!(w2[0].address.to_string(), "C_A2_W1");

        // A later batch keeps counting where the first left off
        let more = registry
            .register_workers(a1.address, &[member()])
            .await
            .unwrap();
        assert_eq!(more[0].address.to_string(), "C_A1_W3");
    }

    #[tokio::test]
    async fn test_register_workers_rejects_bad_targets() {
        let registry = ComponentRegistry::new();
        let unknown = registry
            .register_workers(Address::agent(9), &[member()])
            .await;
        assert!(matches!(unknown, Err(RegistryError::UnknownAgent { .. })));

        let not_agent = registry
            .register_workers(Address::worker(1, 1), &[member()])
            .await;
        assert!(matches!(not_agent, Err(RegistryError::NotAnAgent { .. })));
    }

    #[tokio::test]
    async fn test_terminating_agent_terminates_workers() {
        let registry = ComponentRegistry::new();
        let agent = registry.register_agent("h1".into(), "h1".into()).await;
        let workers = registry
            .register_workers(agent.address, &[member(), member()])
            .await
            .unwrap();
        for w in &workers {
            registry
                .set_worker_state(w.address, LivenessState::Alive)
                .await
                .unwrap();
        }

        registry
            .set_agent_state(agent.address, LivenessState::Terminated)
            .await
            .unwrap();

        for w in registry.workers_of(agent.address).await.unwrap() {
            assert_eq!(w.state, LivenessState::Terminated);
        }
    }

    #[tokio::test]
    async fn test_live_workers_sorted_across_agents() {
        let registry = ComponentRegistry::new();
        let a1 = registry.register_agent("h1".into(), "h1".into()).await;
        let a2 = registry.register_agent("h2".into(), "h2".into()).await;
        let mut all = registry
            .register_workers(a2.address, &[member(), member()])
            .await
            .unwrap();
        all.extend(
            registry
                .register_workers(a1.address, &[member()])
                .await
                .unwrap(),
        );
        for w in &all {
            registry
                .set_worker_state(w.address, LivenessState::Alive)
                .await
                .unwrap();
        }
        // One worker goes unreachable and drops out of the live view
        registry
            .set_worker_state(Address::worker(2, 2), LivenessState::Unreachable)
            .await
            .unwrap();

        let live: Vec<String> = registry
            .live_workers()
            .await
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(live, vec!["C_A1_W1", "C_A2_W1"]);
    }

    #[tokio::test]
    async fn test_removed_agent_index_is_not_reused() {
        let registry = ComponentRegistry::new();
        let a1 = registry.register_agent("h1".into(), "h1".into()).await;
        registry
            .register_workers(a1.address, &[member()])
            .await
            .unwrap();

        let removed = registry.remove_agent(a1.address).await.unwrap();
        assert_eq!(removed.address, a1.address);
        assert!(registry.agent(a1.address).await.is_none());
        assert!(registry.find_worker(Address::worker(1, 1)).await.is_none());

        let a2 = registry.register_agent("h2".into(), "h2".into()).await;
        assert_eq!(a2.address.to_string(), "C_A2");

        let missing = registry.remove_agent(a1.address).await;
        assert!(matches!(missing, Err(RegistryError::UnknownAgent { .. })));
    }

    #[tokio::test]
    async fn test_counts() {
        let registry = ComponentRegistry::new();
        let agent = registry.register_agent("h1".into(), "h1".into()).await;
        registry
            .register_workers(agent.address, &[member(), member()])
            .await
            .unwrap();
        registry
            .set_agent_state(agent.address, LivenessState::Alive)
            .await
            .unwrap();
        registry
            .set_worker_state(Address::worker(1, 1), LivenessState::Alive)
            .await
            .unwrap();

        let counts = registry.counts().await;
        assert_eq!(counts.agents, 1);
        assert_eq!(counts.live_agents, 1);
        assert_eq!(counts.workers, 2);
        assert_eq!(counts.live_workers, 1);
    }

    #[tokio::test]
    async fn test_find_worker() {
        let registry = ComponentRegistry::new();
        let agent = registry.register_agent("h1".into(), "h1".into()).await;
        registry
            .register_workers(agent.address, &[member()])
            .await
            .unwrap();

        assert!(registry.find_worker(Address::worker(1, 1)).await.is_some());
        assert!(registry.find_worker(Address::worker(1, 9)).await.is_none());
        assert!(registry.find_worker(Address::Coordinator).await.is_none());
    }
}
