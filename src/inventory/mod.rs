//! Claimable hosts and their connection parameters.
//!
//! The inventory is loaded once at startup and never changes afterwards.
//! Host names are unique and double as the key of each host's claim.

pub mod ansible;
pub mod host;

use std::collections::HashSet;
use std::path::Path;

pub use host::{Credentials, HostEntry, TransportKind};

use crate::error::{HostwardenError, Result};

#[derive(Debug, Clone)]
pub struct Inventory {
    hosts: Vec<HostEntry>,
}

impl Inventory {
    /// Build an inventory, rejecting empty and duplicate host names.
    pub fn new(hosts: Vec<HostEntry>) -> Result<Self> {
        let mut names = HashSet::new();
        for host in &hosts {
            if host.name.trim().is_empty() {
                return Err(HostwardenError::Inventory("host with empty name".into()));
            }
            if host.name.contains('/') {
                return Err(HostwardenError::Inventory(format!(
                    "host name '{}' must not contain '/'",
                    host.name
                )));
            }
            if !names.insert(host.name.as_str()) {
                return Err(HostwardenError::Inventory(format!(
                    "duplicate host '{}'",
                    host.name
                )));
            }
        }
        Ok(Self { hosts })
    }

    pub fn parse_ansible(text: &str, group: &str) -> Result<Self> {
        Self::new(ansible::parse(text, group)?)
    }

    pub async fn load(path: impl AsRef<Path>, group: &str) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            HostwardenError::Inventory(format!("failed to read {}: {}", path.display(), e))
        })?;
        let inventory = Self::parse_ansible(&text, group)?;
        tracing::info!(
            path = %path.display(),
            group,
            hosts = inventory.len(),
            "Loaded inventory"
        );
        Ok(inventory)
    }

    pub fn get(&self, name: &str) -> Option<&HostEntry> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn hosts(&self) -> &[HostEntry] {
        &self.hosts
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(|h| h.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
