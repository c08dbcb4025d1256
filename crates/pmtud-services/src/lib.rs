//! pmtud-services — shared daemon state and the node reconciler.
//!
//! The peer directory is written by the reconciler and read by the relay
//! engine; the metrics sink is updated by both. The traits in `reconcile`
//! are the seams to the external collaborators (cluster node inventory,
//! hardware-address resolver).

pub mod metrics;
pub mod peers;
pub mod reconcile;

pub use metrics::RelayMetrics;
pub use peers::{PeerDirectory, PeerEntry};
pub use reconcile::{
    HwResolver, NodeEvent, NodeInventory, ReconcileError, Reconciler, ResolveError,
    StaticInventory,
};
