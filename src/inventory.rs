//! Device and identity inventory, as seen by the scan scheduler.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::types::{HostId, TriState};

/// A scannable host and the policy scopes it belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    pub id: HostId,
    /// Network (interface) the host lives on.
    #[serde(default)]
    pub network: Option<String>,
    /// Groups the host is a member of.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub policy: TriState,
    /// VPN peer identity rather than a local device.
    #[serde(default)]
    pub identity: bool,
    /// Current addresses. A device normally has one host address; an
    /// identity may also carry whole ranges.
    #[serde(default)]
    pub addresses: Vec<IpNet>,
}

#[async_trait]
pub trait Inventory: Send + Sync {
    async fn hosts(&self) -> Vec<HostRecord>;

    async fn network_policies(&self) -> BTreeMap<String, TriState>;

    async fn group_policies(&self) -> BTreeMap<String, TriState>;

    /// Addresses the host currently answers on.
    async fn resolve_addresses(&self, host: &HostId) -> Vec<IpNet>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InventoryData {
    #[serde(default)]
    pub hosts: Vec<HostRecord>,
    #[serde(default)]
    pub networks: BTreeMap<String, TriState>,
    #[serde(default)]
    pub groups: BTreeMap<String, TriState>,
}

/// Inventory backed by a static snapshot, typically loaded from JSON.
#[derive(Debug, Clone, Default)]
pub struct JsonInventory {
    data: InventoryData,
}

impl JsonInventory {
    pub fn new(data: InventoryData) -> Self {
        Self { data }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read inventory {}", path.display()))?;
        let data = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse inventory {}", path.display()))?;
        Ok(Self { data })
    }
}

#[async_trait]
impl Inventory for JsonInventory {
    async fn hosts(&self) -> Vec<HostRecord> {
        self.data.hosts.clone()
    }

    async fn network_policies(&self) -> BTreeMap<String, TriState> {
        self.data.networks.clone()
    }

    async fn group_policies(&self) -> BTreeMap<String, TriState> {
        self.data.groups.clone()
    }

    async fn resolve_addresses(&self, host: &HostId) -> Vec<IpNet> {
        self.data
            .hosts
            .iter()
            .find(|h| &h.id == host)
            .map(|h| h.addresses.clone())
            .unwrap_or_default()
    }
}
