//! Dispatch error types

use stampede_core::Address;
use thiserror::Error;

/// Errors raised while routing operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The destination names a concrete component this node has no route to
    #[error("no route to {destination} from {local}")]
    UnknownAddress { local: Address, destination: Address },

    /// The destination cannot be reached through this node at all
    #[error("{destination} is not routable from {local}")]
    Unroutable { local: Address, destination: Address },

    /// Upward traffic was requested but no uplink is connected
    #[error("no uplink connection from {local}")]
    MissingUplink { local: Address },

    /// The peer link's writer has shut down
    #[error("connection to {peer} is closed")]
    ConnectionClosed { peer: Address },
}
