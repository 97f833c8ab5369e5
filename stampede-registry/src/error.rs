//! Registry error types

use stampede_core::Address;
use thiserror::Error;

/// Errors raised by registry and inventory operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent {address} is already registered")]
    DuplicateAgent { address: Address },

    #[error("unknown agent {address}")]
    UnknownAgent { address: Address },

    #[error("unknown worker {address}")]
    UnknownWorker { address: Address },

    #[error("address {address} does not name an agent")]
    NotAnAgent { address: Address },

    #[error("address {address} does not name a worker")]
    NotAWorker { address: Address },

    #[error("inventory has no hosts")]
    EmptyInventory,

    #[error("failed to read inventory: {0}")]
    InventoryIo(#[from] std::io::Error),

    #[error("failed to parse inventory: {0}")]
    InventoryParse(#[from] serde_yaml::Error),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
