//! Operation dispatch for the Stampede component tree
//!
//! Every node runs one [`Dispatcher`] over a set of [`PeerConnection`]s: one
//! per direct child, plus an uplink toward the coordinator. Envelopes travel
//! hop by hop; at each hop the dispatcher either delivers locally, fans out
//! to the children the destination selects, or forwards up. Acks flow the
//! reverse path and are AND-aggregated at every hop, so the original sender
//! ends up with one outcome per reached leaf.
//!
//! Each connection sends strictly one request at a time, which gives
//! per-link FIFO delivery even across retries.

pub mod connection;
pub mod dispatcher;
pub mod error;

pub use connection::{
    ConnectionSettings, InboundEnvelope, PeerConnection, PendingAck, PendingFanout,
};
pub use dispatcher::{Dispatcher, HandlerError, OperationHandler, RouteDecision};
pub use error::DispatchError;
