//! Per-node routing over a set of peer connections

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stampede_core::{Address, AddressIndex, AddressLevel};
use stampede_ipc::{AckOutcome, Operation, OperationAck, OperationEnvelope};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::connection::{InboundEnvelope, PeerConnection, PendingFanout};
use crate::error::DispatchError;

/// What a node does with an envelope, given its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// The destination selects this node; deliver to the local handler
    Local,
    /// The destination lies below; fan out to the matching children
    Children,
    /// The destination lies above; forward on the uplink
    Up,
    /// The destination cannot be reached through this node
    Misroute,
}

/// A local operation failure, reported back to the sender in the ack
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Local delivery seam: each tier plugs its own operation handling in here
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, envelope: OperationEnvelope) -> Result<(), HandlerError>;
}

/// Routes envelopes at one node of the component tree
pub struct Dispatcher {
    local: Address,
    /// Terminal nodes own everything below their level in-process, so
    /// deeper destinations are still local deliveries
    terminal: bool,
    routes: RwLock<HashMap<Address, Arc<PeerConnection>>>,
    uplink: RwLock<Option<Arc<PeerConnection>>>,
}

impl Dispatcher {
    /// Dispatcher for a node with child links (coordinator, agent)
    pub fn new(local: Address) -> Self {
        Self {
            local,
            terminal: false,
            routes: RwLock::new(HashMap::new()),
            uplink: RwLock::new(None),
        }
    }

    /// Dispatcher for a leaf node (worker): destinations at or below the
    /// node resolve locally
    pub fn leaf(local: Address) -> Self {
        Self {
            local,
            terminal: true,
            routes: RwLock::new(HashMap::new()),
            uplink: RwLock::new(None),
        }
    }

    pub fn local(&self) -> Address {
        self.local
    }

    /// Register the link to one direct child
    pub async fn add_route(&self, address: Address, connection: Arc<PeerConnection>) {
        self.routes.write().await.insert(address, connection);
    }

    /// Drop the link to one direct child
    pub async fn remove_route(&self, address: &Address) -> Option<Arc<PeerConnection>> {
        self.routes.write().await.remove(address)
    }

    /// Install the link toward the parent
    pub async fn set_uplink(&self, connection: Arc<PeerConnection>) {
        *self.uplink.write().await = Some(connection);
    }

    /// Close the uplink and every child link
    pub async fn close_all(&self) {
        if let Some(uplink) = self.uplink.read().await.as_ref() {
            uplink.close();
        }
        for connection in self.routes.read().await.values() {
            connection.close();
        }
    }

    /// Classify a destination relative to this node
    pub fn decide(&self, destination: &Address) -> RouteDecision {
        match destination.level().cmp(&self.local.level()) {
            Ordering::Less => {
                let mut ancestor = self.local.parent();
                while let Some(node) = ancestor {
                    if node.level() == destination.level() {
                        return if destination.matches(&node) {
                            RouteDecision::Up
                        } else {
                            RouteDecision::Misroute
                        };
                    }
                    ancestor = node.parent();
                }
                RouteDecision::Misroute
            }
            Ordering::Equal => {
                if destination.matches(&self.local) {
                    RouteDecision::Local
                } else {
                    RouteDecision::Misroute
                }
            }
            Ordering::Greater => {
                if !destination.routes_through(&self.local) {
                    RouteDecision::Misroute
                } else if self.terminal {
                    RouteDecision::Local
                } else {
                    RouteDecision::Children
                }
            }
        }
    }

    fn child_level(&self) -> Option<AddressLevel> {
        match self.local.level() {
            AddressLevel::Coordinator => Some(AddressLevel::Agent),
            AddressLevel::Agent => Some(AddressLevel::Worker),
            AddressLevel::Worker => Some(AddressLevel::Test),
            AddressLevel::Test => None,
        }
    }

    /// The concrete address of this node's child with the given id
    fn child_address(&self, id: u32) -> Option<Address> {
        match self.local {
            Address::Coordinator => Some(Address::agent(id)),
            Address::Agent { agent } => agent.id().map(|a| Address::worker(a, id)),
            Address::Worker { .. } => self.local.test_on(id),
            Address::Test { .. } => None,
        }
    }

    /// Enqueue an envelope on every child link its destination selects.
    ///
    /// Enqueueing completes before this returns, so two submissions in
    /// sequence reach each shared link in that sequence; the acks are
    /// collected through the returned handle. A concrete destination with no
    /// matching child is an error, a wildcard matching nothing is an empty
    /// fanout.
    pub async fn submit_children(
        &self,
        envelope: OperationEnvelope,
    ) -> Result<PendingFanout, DispatchError> {
        let destination = envelope.destination;
        let unroutable = DispatchError::Unroutable {
            local: self.local,
            destination,
        };
        let child_level = self.child_level().ok_or_else(|| unroutable.clone())?;
        let selector = destination.index_at(child_level).ok_or(unroutable)?;

        let routes = self.routes.read().await;
        let mut matched: Vec<(Address, Arc<PeerConnection>)> = routes
            .iter()
            .filter(|(address, _)| match address.index_at(child_level) {
                Some(AddressIndex::Id(id)) => selector.matches(id),
                _ => false,
            })
            .map(|(address, connection)| (*address, Arc::clone(connection)))
            .collect();
        drop(routes);
        matched.sort_by_key(|(address, _)| *address);

        if matched.is_empty() {
            if let AddressIndex::Id(id) = selector {
                let missing = self.child_address(id).unwrap_or(destination);
                return Err(DispatchError::UnknownAddress {
                    local: self.local,
                    destination: missing,
                });
            }
            debug!(local = %self.local, %destination, "fan-out matched no children");
            return Ok(PendingFanout::new(envelope.correlation_id, Vec::new()));
        }

        if !envelope.reply_expected {
            for (address, connection) in &matched {
                if let Err(error) = connection.forward(envelope.clone()) {
                    warn!(peer = %address, %error, "dropping forward on closed link");
                }
            }
            return Ok(PendingFanout::new(envelope.correlation_id, Vec::new()));
        }

        let branches = matched
            .iter()
            .map(|(_, connection)| connection.request(envelope.clone()))
            .collect();
        Ok(PendingFanout::new(envelope.correlation_id, branches))
    }

    /// Send an operation from this node and wait for the aggregated ack
    pub async fn send(
        &self,
        destination: Address,
        operation: Operation,
    ) -> Result<OperationAck, DispatchError> {
        let envelope = OperationEnvelope::request(self.local, destination, operation);
        match self.decide(&destination) {
            RouteDecision::Children => {
                let fanout = self.submit_children(envelope).await?;
                Ok(fanout.join().await)
            }
            _ => Err(DispatchError::Unroutable {
                local: self.local,
                destination,
            }),
        }
    }

    /// Forward an envelope toward the coordinator
    pub async fn forward_up(&self, envelope: OperationEnvelope) -> Result<(), DispatchError> {
        let uplink = self.uplink.read().await;
        let connection = uplink.as_ref().ok_or(DispatchError::MissingUplink {
            local: self.local,
        })?;
        connection.forward(envelope)
    }

    /// Send a notification from this node to the coordinator
    pub async fn notify_up(&self, operation: Operation) -> Result<(), DispatchError> {
        let envelope =
            OperationEnvelope::notification(self.local, Address::Coordinator, operation);
        self.forward_up(envelope).await
    }

    /// Send an ack toward the coordinator
    pub async fn send_ack_up(&self, ack: OperationAck) -> Result<(), DispatchError> {
        let uplink = self.uplink.read().await;
        let connection = uplink.as_ref().ok_or(DispatchError::MissingUplink {
            local: self.local,
        })?;
        connection.send_ack(ack)
    }

    /// Drain the node's inbound queue, routing each envelope: local
    /// deliveries run in arrival order before the next envelope is taken,
    /// child-bound envelopes are enqueued in arrival order with their ack
    /// joins running concurrently. Returns when the queue closes.
    pub async fn run_inbound(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<InboundEnvelope>,
        handler: Arc<dyn OperationHandler>,
    ) {
        while let Some(InboundEnvelope { from, envelope }) = inbound.recv().await {
            debug!(
                local = %self.local,
                %from,
                destination = %envelope.destination,
                operation = envelope.operation.name(),
                "inbound operation"
            );
            match self.decide(&envelope.destination) {
                RouteDecision::Local => {
                    let correlation_id = envelope.correlation_id;
                    let reply_expected = envelope.reply_expected;
                    let outcome = match handler.handle(envelope).await {
                        Ok(()) => AckOutcome::Success,
                        Err(error) => AckOutcome::Error {
                            message: error.to_string(),
                        },
                    };
                    if reply_expected {
                        let ack = OperationAck::single(correlation_id, self.local, outcome);
                        if let Err(error) = self.send_ack_up(ack).await {
                            warn!(local = %self.local, %error, "could not ack upward");
                        }
                    }
                }
                RouteDecision::Children => match self.submit_children(envelope.clone()).await {
                    Ok(fanout) => {
                        if envelope.reply_expected {
                            let node = Arc::clone(&self);
                            tokio::spawn(async move {
                                let ack = fanout.join().await;
                                if let Err(error) = node.send_ack_up(ack).await {
                                    warn!(local = %node.local, %error, "could not ack upward");
                                }
                            });
                        }
                    }
                    Err(error) => {
                        warn!(local = %self.local, %error, "fan-out failed");
                        if envelope.reply_expected {
                            let ack = OperationAck::single(
                                envelope.correlation_id,
                                self.local,
                                AckOutcome::Error {
                                    message: error.to_string(),
                                },
                            );
                            let _ = self.send_ack_up(ack).await;
                        }
                    }
                },
                RouteDecision::Up => {
                    if let Err(error) = self.forward_up(envelope).await {
                        warn!(local = %self.local, %error, "could not forward upward");
                    }
                }
                RouteDecision::Misroute => {
                    warn!(
                        local = %self.local,
                        destination = %envelope.destination,
                        "dropping misrouted operation"
                    );
                    if envelope.reply_expected {
                        let ack = OperationAck::single(
                            envelope.correlation_id,
                            self.local,
                            AckOutcome::Unreachable {
                                message: format!("not routable from {}", self.local),
                            },
                        );
                        let _ = self.send_ack_up(ack).await;
                    }
                }
            }
        }
        debug!(local = %self.local, "inbound queue closed");
    }
}
