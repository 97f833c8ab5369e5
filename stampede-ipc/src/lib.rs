//! Wire protocol and transports for Stampede
//!
//! Defines the operation envelope exchanged between coordinator, agents and
//! workers, the ack frames that answer them, and the transports the tree is
//! wired with: stdio (worker side), child-process pipes (agent side), TCP
//! (coordinator to agent) and an in-process channel pair for tests and local
//! mode.

pub mod error;
pub mod protocol;
pub mod transport;

pub use error::IpcError;
pub use protocol::{
    AckOutcome, Frame, Operation, OperationAck, OperationEnvelope, WireEnvelope, WorkerPlan,
    PROTOCOL_VERSION,
};
pub use transport::{
    channel_transport_pair, child_transport, stdio_transport, tcp_transport, FrameSink,
    FrameSource, TransportPair,
};
