//! Host inventory parsing
//!
//! An inventory file lists the machines agents run on, one entry per host.
//! Registration order follows file order, so agent indices are stable for a
//! given inventory.

use crate::error::{RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One host an agent runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    /// Address the coordinator dials
    pub public_ip: String,
    /// Cluster-internal address; falls back to `public_ip` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
}

impl HostEntry {
    /// Cluster-internal address for this host
    pub fn private_ip(&self) -> &str {
        self.private_ip.as_deref().unwrap_or(&self.public_ip)
    }
}

/// The full set of hosts for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub hosts: Vec<HostEntry>,
}

impl Inventory {
    /// Parse an inventory from YAML text
    pub fn from_yaml(text: &str) -> RegistryResult<Self> {
        let inventory: Inventory = serde_yaml::from_str(text)?;
        if inventory.hosts.is_empty() {
            return Err(RegistryError::EmptyInventory);
        }
        Ok(inventory)
    }

    /// Load an inventory from a YAML file
    pub fn load(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Build a single-host inventory, used for local runs
    pub fn single_host(ip: impl Into<String>) -> Self {
        Self {
            hosts: vec![HostEntry {
                public_ip: ip.into(),
                private_ip: None,
            }],
        }
    }
}
