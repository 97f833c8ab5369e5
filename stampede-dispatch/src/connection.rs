//! One peer link: a writer task, a reader task and a pending-ack table
//!
//! The writer drains an outbound queue and keeps at most one request in
//! flight; a request is retried on its own link until acked or the retry
//! budget is spent, and only then does the next queued item go out. That
//! single-flight rule is what preserves submission order on a link. The
//! reader demultiplexes incoming acks to their waiting requests by
//! correlation id and hands incoming operations to the node's inbound queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use stampede_core::Address;
use stampede_ipc::{
    AckOutcome, Frame, FrameSink, FrameSource, IpcError, OperationAck, OperationEnvelope,
    TransportPair,
};
use stampede_resilience::RetryPolicy;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DispatchError;

/// Per-link delivery settings
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// How long one attempt waits for an ack
    pub ack_deadline: Duration,
    /// Resend schedule after a missed ack
    pub retry: RetryPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ack_deadline: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// An operation that arrived on a peer link
#[derive(Debug)]
pub struct InboundEnvelope {
    /// The peer the frame came in on, not necessarily the envelope's source
    pub from: Address,
    pub envelope: OperationEnvelope,
}

enum Outbound {
    Request {
        envelope: OperationEnvelope,
        reply: oneshot::Sender<OperationAck>,
    },
    Forward {
        envelope: OperationEnvelope,
    },
    Ack {
        ack: OperationAck,
    },
    Close,
}

type PendingMap = HashMap<Uuid, oneshot::Sender<OperationAck>>;

/// Handle to one live peer link
pub struct PeerConnection {
    peer: Address,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: watch::Receiver<bool>,
}

impl PeerConnection {
    /// Take ownership of a transport and start the writer and reader tasks.
    pub fn spawn(
        peer: Address,
        transport: TransportPair,
        inbound: mpsc::UnboundedSender<InboundEnvelope>,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        let (sink, source) = transport;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(writer_task(
            peer,
            sink,
            outbound_rx,
            Arc::clone(&pending),
            settings,
        ));
        tokio::spawn(async move {
            reader_task(peer, source, pending, inbound).await;
            let _ = closed_tx.send(true);
        });

        Arc::new(Self {
            peer,
            outbound: outbound_tx,
            closed: closed_rx,
        })
    }

    /// The address at the far end of this link
    pub fn peer(&self) -> Address {
        self.peer
    }

    /// Resolves once the peer has closed the link (or it failed). Used by
    /// node runtimes to tear a session down when the far end goes away.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Queue a request. Returns immediately; the returned handle resolves
    /// once the peer acks or the retry budget is spent.
    pub fn request(&self, envelope: OperationEnvelope) -> PendingAck {
        let correlation_id = envelope.correlation_id;
        let (reply_tx, reply_rx) = oneshot::channel();
        // A failed enqueue drops reply_tx, which the handle reports as
        // unreachable when awaited.
        let _ = self.outbound.send(Outbound::Request {
            envelope,
            reply: reply_tx,
        });
        PendingAck {
            peer: self.peer,
            correlation_id,
            reply: reply_rx,
        }
    }

    /// Queue an envelope without tracking an ack for it on this link
    pub fn forward(&self, envelope: OperationEnvelope) -> Result<(), DispatchError> {
        self.outbound
            .send(Outbound::Forward { envelope })
            .map_err(|_| DispatchError::ConnectionClosed { peer: self.peer })
    }

    /// Queue an ack toward the peer
    pub fn send_ack(&self, ack: OperationAck) -> Result<(), DispatchError> {
        self.outbound
            .send(Outbound::Ack { ack })
            .map_err(|_| DispatchError::ConnectionClosed { peer: self.peer })
    }

    /// Flush queued items, then close the transport
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// A request waiting for its ack
pub struct PendingAck {
    peer: Address,
    correlation_id: Uuid,
    reply: oneshot::Receiver<OperationAck>,
}

impl PendingAck {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Resolve to the peer's ack, or a synthesized unreachable outcome keyed
    /// by the peer when the link died first.
    pub async fn wait(self) -> OperationAck {
        match self.reply.await {
            Ok(ack) => ack,
            Err(_) => OperationAck::single(
                self.correlation_id,
                self.peer,
                AckOutcome::Unreachable {
                    message: "connection closed".to_string(),
                },
            ),
        }
    }
}

/// The in-flight ack handles for one fanned-out envelope
pub struct PendingFanout {
    correlation_id: Uuid,
    branches: Vec<PendingAck>,
}

impl PendingFanout {
    pub fn new(correlation_id: Uuid, branches: Vec<PendingAck>) -> Self {
        Self {
            correlation_id,
            branches,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Number of links the envelope went out on
    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Await every branch and union the outcomes. An envelope that matched
    /// zero branches yields an empty, vacuously successful ack.
    pub async fn join(self) -> OperationAck {
        let mut merged = OperationAck::new(self.correlation_id);
        let acks = futures::future::join_all(self.branches.into_iter().map(PendingAck::wait)).await;
        for ack in acks {
            merged.merge(ack);
        }
        merged
    }
}

async fn writer_task(
    peer: Address,
    mut sink: Box<dyn FrameSink>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    pending: Arc<Mutex<PendingMap>>,
    settings: ConnectionSettings,
) {
    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Request { envelope, reply } => {
                let ack = send_request(peer, &mut sink, &pending, envelope, &settings).await;
                let _ = reply.send(ack);
            }
            Outbound::Forward { envelope } => {
                if let Err(error) = sink.send(Frame::Operation(envelope)).await {
                    warn!(%peer, %error, "dropping outbound operation");
                }
            }
            Outbound::Ack { ack } => {
                if let Err(error) = sink.send(Frame::Ack(ack)).await {
                    warn!(%peer, %error, "dropping outbound ack");
                }
            }
            Outbound::Close => break,
        }
    }
    if let Err(error) = sink.close().await {
        debug!(%peer, %error, "transport close failed");
    }
}

/// Send one request and wait for its ack, resending per the retry policy.
/// Always resolves; delivery failures become synthesized outcomes keyed by
/// the peer address.
async fn send_request(
    peer: Address,
    sink: &mut Box<dyn FrameSink>,
    pending: &Mutex<PendingMap>,
    envelope: OperationEnvelope,
    settings: &ConnectionSettings,
) -> OperationAck {
    let correlation_id = envelope.correlation_id;
    let max_attempts = settings.retry.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let (ack_tx, ack_rx) = oneshot::channel();
        pending.lock().await.insert(correlation_id, ack_tx);

        match sink.send(Frame::Operation(envelope.clone())).await {
            Err(error) => {
                pending.lock().await.remove(&correlation_id);
                if !error.is_retryable() || attempt >= max_attempts {
                    warn!(%peer, attempt, %error, operation = envelope.operation.name(), "send failed");
                    return OperationAck::single(
                        correlation_id,
                        peer,
                        AckOutcome::Unreachable {
                            message: error.to_string(),
                        },
                    );
                }
                warn!(%peer, attempt, %error, "send failed, will resend");
            }
            Ok(()) => match timeout(settings.ack_deadline, ack_rx).await {
                Ok(Ok(ack)) => {
                    if attempt > 1 {
                        debug!(%peer, attempt, correlation = %correlation_id, "acked after resend");
                    }
                    return ack;
                }
                Ok(Err(_)) => {
                    // Reader is gone, no ack can arrive anymore
                    pending.lock().await.remove(&correlation_id);
                    return OperationAck::single(
                        correlation_id,
                        peer,
                        AckOutcome::Unreachable {
                            message: "connection closed".to_string(),
                        },
                    );
                }
                Err(_) => {
                    pending.lock().await.remove(&correlation_id);
                    if attempt >= max_attempts {
                        warn!(
                            %peer,
                            attempt,
                            correlation = %correlation_id,
                            operation = envelope.operation.name(),
                            "no ack within deadline, giving up"
                        );
                        return OperationAck::single(correlation_id, peer, AckOutcome::TimedOut);
                    }
                    debug!(%peer, attempt, correlation = %correlation_id, "no ack within deadline, resending");
                }
            },
        }

        tokio::time::sleep(settings.retry.delay_for_attempt(attempt)).await;
        attempt += 1;
    }
}

async fn reader_task(
    peer: Address,
    mut source: Box<dyn FrameSource>,
    pending: Arc<Mutex<PendingMap>>,
    inbound: mpsc::UnboundedSender<InboundEnvelope>,
) {
    loop {
        match source.recv().await {
            Ok(Frame::Ack(ack)) => {
                let waiter = pending.lock().await.remove(&ack.correlation_id);
                match waiter {
                    Some(reply) => {
                        let _ = reply.send(ack);
                    }
                    None => {
                        debug!(%peer, correlation = %ack.correlation_id, "ack for no pending request")
                    }
                }
            }
            Ok(Frame::Operation(envelope)) => {
                if inbound
                    .send(InboundEnvelope {
                        from: peer,
                        envelope,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(IpcError::ConnectionClosed) => {
                debug!(%peer, "peer closed the link");
                break;
            }
            // A single bad line does not take the link down
            Err(error @ IpcError::DeserializationError(_))
            | Err(error @ IpcError::InvalidFrame(_)) => {
                warn!(%peer, %error, "skipping malformed frame");
            }
            Err(error) => {
                warn!(%peer, %error, "link failed");
                break;
            }
        }
    }
    // Wake every in-flight request so callers see unreachable instead of
    // waiting out their deadlines
    pending.lock().await.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_core::{Address, TestPhase};
    use stampede_ipc::{channel_transport_pair, Operation};

    fn fast_settings(max_attempts: u32) -> ConnectionSettings {
        ConnectionSettings {
            ack_deadline: Duration::from_millis(50),
            retry: RetryPolicy {
                max_attempts,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                backoff_strategy: stampede_resilience::BackoffStrategy::Fixed,
                jitter: false,
            },
        }
    }

    fn ping(destination: Address) -> OperationEnvelope {
        OperationEnvelope::request(Address::Coordinator, destination, Operation::Ping)
    }

    /// Far end of a link that acks success for itself, optionally ignoring
    /// the first `ignore` operations it sees.
    fn spawn_responder(transport: TransportPair, me: Address, ignore: u32) {
        let (mut sink, mut source) = transport;
        tokio::spawn(async move {
            let mut seen = 0u32;
            while let Ok(frame) = source.recv().await {
                if let Frame::Operation(envelope) = frame {
                    seen += 1;
                    if seen <= ignore {
                        continue;
                    }
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

    #[tokio::test]
    async fn test_request_is_acked() {
        let (near, far) = channel_transport_pair();
        let peer = Address::agent(1);
        spawn_responder(far, peer, 0);

        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::spawn(peer, near, inbound_tx, fast_settings(3));

        let ack = conn.request(ping(peer)).wait().await;
        assert!(ack.all_succeeded());
        assert_eq!(ack.outcomes.len(), 1);
        assert!(ack.outcomes.contains_key(&peer));
    }

    #[tokio::test]
    async fn test_missed_ack_is_resent() {
        let (near, far) = channel_transport_pair();
        let peer = Address::agent(1);
        // First delivery is swallowed; the resend gets through
        spawn_responder(far, peer, 1);

        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::spawn(peer, near, inbound_tx, fast_settings(3));

        let ack = conn.request(ping(peer)).wait().await;
        assert!(ack.all_succeeded());
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_times_out() {
        let (near, far) = channel_transport_pair();
        let peer = Address::agent(1);
        // Swallow everything
        spawn_responder(far, peer, u32::MAX);

        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::spawn(peer, near, inbound_tx, fast_settings(2));

        let ack = conn.request(ping(peer)).wait().await;
        assert_eq!(ack.outcomes.get(&peer), Some(&AckOutcome::TimedOut));
    }

    #[tokio::test]
    async fn test_dead_link_resolves_unreachable() {
        let (near, far) = channel_transport_pair();
        let peer = Address::agent(1);
        drop(far);

        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::spawn(peer, near, inbound_tx, fast_settings(1));

        let ack = conn.request(ping(peer)).wait().await;
        assert!(matches!(
            ack.outcomes.get(&peer),
            Some(AckOutcome::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_requests_keep_submission_order() {
        let (near, far) = channel_transport_pair();
        let peer = Address::worker(1, 1);
        let received = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&received);
        let (mut far_sink, mut far_source) = far;
        tokio::spawn(async move {
            while let Ok(frame) = far_source.recv().await {
                if let Frame::Operation(envelope) = frame {
                    if let Operation::StartPhase { phase, .. } = &envelope.operation {
                        seen.lock().await.push(*phase);
                    }
                    let ack = OperationAck::success(envelope.correlation_id, peer);
                    if far_sink.send(Frame::Ack(ack)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::spawn(peer, near, inbound_tx, fast_settings(3));

        let phases = [TestPhase::Setup, TestPhase::LocalWarmup, TestPhase::Run];
        let pending: Vec<PendingAck> = phases
            .iter()
            .map(|phase| {
                conn.request(OperationEnvelope::request(
                    Address::Coordinator,
                    peer,
                    Operation::StartPhase {
                        test_id: 1,
                        phase: *phase,
                    },
                ))
            })
            .collect();
        for p in pending {
            assert!(p.wait().await.all_succeeded());
        }

        assert_eq!(received.lock().await.as_slice(), &phases);
    }

    #[tokio::test]
    async fn test_closed_resolves_when_peer_goes_away() {
        let (near, far) = channel_transport_pair();
        let peer = Address::agent(1);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::spawn(peer, near, inbound_tx, fast_settings(1));
        assert!(!conn.is_closed());

        drop(far);
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_inbound_operations_are_delivered() {
        let (near, far) = channel_transport_pair();
        let peer = Address::worker(1, 1);
        let (mut far_sink, _far_source) = far;

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let _conn = PeerConnection::spawn(peer, near, inbound_tx, fast_settings(1));

        let notification = OperationEnvelope::notification(
            peer,
            Address::Coordinator,
            Operation::WorkerReady,
        );
        far_sink
            .send(Frame::Operation(notification.clone()))
            .await
            .unwrap();

        let inbound = inbound_rx.recv().await.unwrap();
        assert_eq!(inbound.from, peer);
        assert_eq!(inbound.envelope, notification);
    }
}
