//! Node reconciler — keeps the peer directory populated with fresh
//! hardware addresses for every other cluster node.
//!
//! One `reconcile` call per delivered node event. Redelivery and backoff
//! on failure belong to whoever drives the event stream; this module only
//! reports success or failure.

use std::net::AddrParseError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::metrics::RelayMetrics;
use crate::peers::PeerDirectory;

/// A cluster node changed. Carries only the identifier; addresses are
/// fetched from the inventory at reconcile time, when they are needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub node: String,
}

impl NodeEvent {
    pub fn new(node: impl Into<String>) -> Self {
        Self { node: node.into() }
    }
}

/// The cluster control plane's node inventory.
#[async_trait]
pub trait NodeInventory: Send + Sync {
    /// Addresses the node reports, in the order the control plane lists
    /// them. `Ok(None)` when the node does not exist — it may have been
    /// deleted since the event fired, which is not an error.
    async fn node_addresses(&self, node: &str) -> anyhow::Result<Option<Vec<String>>>;
}

/// Resolves an IPv4 address to a hardware address on the replication
/// segment. Implemented by the daemon's ARP resolver.
#[async_trait]
pub trait HwResolver: Send + Sync {
    /// On success, the hardware address in canonical textual form.
    async fn resolve(&self, addr: &str) -> Result<String, ResolveError>;
}

/// Resolution failures, scoped to a single exchange.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("replication interface {0:?} not found")]
    Interface(String),

    #[error("failed to open resolution socket: {0}")]
    Socket(std::io::Error),

    #[error("malformed address {0:?}: {1}")]
    AddressParse(String, AddrParseError),

    #[error("resolution exchange failed: {0}")]
    Exchange(std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("node {0:?} reports no addresses")]
    NoAddress(String),

    #[error("could not resolve hardware address for {node:?}: {source}")]
    Resolve {
        node: String,
        #[source]
        source: ResolveError,
    },

    #[error("node inventory lookup failed: {0}")]
    Inventory(#[source] anyhow::Error),
}

/// Consumes node events and refreshes directory entries via the resolver.
pub struct Reconciler {
    node_name: String,
    staleness: Duration,
    directory: PeerDirectory,
    inventory: Arc<dyn NodeInventory>,
    resolver: Arc<dyn HwResolver>,
    metrics: Arc<RelayMetrics>,
}

impl Reconciler {
    pub fn new(
        node_name: impl Into<String>,
        staleness: Duration,
        directory: PeerDirectory,
        inventory: Arc<dyn NodeInventory>,
        resolver: Arc<dyn HwResolver>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            staleness,
            directory,
            inventory,
            resolver,
            metrics,
        }
    }

    /// Refresh the directory entry for `node` if it is stale.
    ///
    /// An existing entry is only ever replaced by a successful
    /// resolution; on failure the last known-good address stays.
    pub async fn reconcile(&self, node: &str) -> Result<(), ReconcileError> {
        // Our own node never relays to itself.
        if node == self.node_name {
            return Ok(());
        }

        // Node events fire for every unrelated status update; do not put
        // an ARP exchange on the wire while the entry is still fresh.
        if let Some(entry) = self.directory.lookup(node) {
            if Instant::now() < entry.last_refreshed + self.staleness {
                return Ok(());
            }
        }

        let addresses = self
            .inventory
            .node_addresses(node)
            .await
            .map_err(ReconcileError::Inventory)?;
        let Some(addresses) = addresses else {
            tracing::info!(node, "node not found, skipping");
            return Ok(());
        };
        let Some(address) = addresses.first() else {
            return Err(ReconcileError::NoAddress(node.to_string()));
        };

        match self.resolver.resolve(address).await {
            Ok(mac) => {
                tracing::info!(node, address = %address, mac = %mac, "peer refreshed");
                self.directory.upsert(node, mac, Instant::now());
                Ok(())
            }
            Err(source) => {
                self.metrics.inc_resolve_error(node);
                Err(ReconcileError::Resolve {
                    node: node.to_string(),
                    source,
                })
            }
        }
    }
}

/// A fixed node inventory, for running without a control-plane watch.
/// The daemon replays these names into the event stream periodically.
pub struct StaticInventory {
    nodes: Vec<(String, String)>,
}

impl StaticInventory {
    pub fn new(nodes: Vec<(String, String)>) -> Self {
        Self { nodes }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|(name, _)| name.as_str())
    }
}

#[async_trait]
impl NodeInventory for StaticInventory {
    async fn node_addresses(&self, node: &str) -> anyhow::Result<Option<Vec<String>>> {
        Ok(self
            .nodes
            .iter()
            .find(|(name, _)| name == node)
            .map(|(_, addr)| vec![addr.clone()]))
    }
}
