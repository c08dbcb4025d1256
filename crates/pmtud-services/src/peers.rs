//! Peer directory — node name → hardware address, shared between the
//! reconciler (writer) and the relay engine (reader).
//!
//! One coarse lock guards the whole map: a read takes a full snapshot, a
//! write replaces exactly one entry. The lock never leaves this module,
//! so it cannot be ordered against the resolver's serialization lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Tracked state for one peer node.
///
/// Created or replaced only by a successful hardware-address resolution;
/// a failed resolution leaves the previous entry untouched so relaying
/// continues to the last known-good address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    /// Canonical textual hardware address (`aa:bb:cc:dd:ee:ff`).
    pub mac: String,
    /// When the address was last confirmed by a resolution.
    pub last_refreshed: Instant,
    /// Operator-configured entries are pinned: no node event ever
    /// refreshes them, so the eviction sweep must not touch them either.
    pub pinned: bool,
}

/// The shared directory. Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    inner: Arc<Mutex<HashMap<String, PeerEntry>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every peer's hardware address. The lock is
    /// held only for the duration of the copy.
    pub fn snapshot(&self) -> Vec<String> {
        let map = self.lock();
        map.values().map(|e| e.mac.clone()).collect()
    }

    /// Insert or replace the entry for `node`.
    pub fn upsert(&self, node: &str, mac: String, now: Instant) {
        let mut map = self.lock();
        map.insert(
            node.to_string(),
            PeerEntry {
                mac,
                last_refreshed: now,
                pinned: false,
            },
        );
    }

    /// Insert a pinned entry for a statically configured peer. Pinned
    /// entries survive every eviction sweep.
    pub fn pin(&self, node: &str, mac: String) {
        let mut map = self.lock();
        map.insert(
            node.to_string(),
            PeerEntry {
                mac,
                last_refreshed: Instant::now(),
                pinned: true,
            },
        );
    }

    pub fn lookup(&self, node: &str) -> Option<PeerEntry> {
        self.lock().get(node).cloned()
    }

    /// Drop unpinned entries not refreshed since `cutoff`. Returns how
    /// many were removed. Nodes that left the cluster stop producing
    /// events, so a periodic sweep is the only thing that bounds the
    /// map; pinned entries have no events to begin with and stay.
    pub fn evict_older_than(&self, cutoff: Instant) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, entry| entry.pinned || entry.last_refreshed >= cutoff);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerEntry>> {
        // A poisoned map is still a map; the panic already happened elsewhere.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn snapshot_reflects_upserts() {
        let dir = PeerDirectory::new();
        assert!(dir.is_empty());

        let now = Instant::now();
        dir.upsert("node-1", "aa:aa:aa:aa:aa:aa".into(), now);
        dir.upsert("node-2", "bb:bb:bb:bb:bb:bb".into(), now);

        let mut macs = dir.snapshot();
        macs.sort();
        assert_eq!(macs, vec!["aa:aa:aa:aa:aa:aa", "bb:bb:bb:bb:bb:bb"]);
    }

    #[test]
    fn upsert_replaces_single_entry() {
        let dir = PeerDirectory::new();
        let t0 = Instant::now();
        dir.upsert("node-1", "aa:aa:aa:aa:aa:aa".into(), t0);

        let t1 = t0 + Duration::from_secs(60);
        dir.upsert("node-1", "cc:cc:cc:cc:cc:cc".into(), t1);

        assert_eq!(dir.len(), 1);
        let entry = dir.lookup("node-1").unwrap();
        assert_eq!(entry.mac, "cc:cc:cc:cc:cc:cc");
        assert_eq!(entry.last_refreshed, t1);
    }

    #[test]
    fn lookup_absent_is_none() {
        let dir = PeerDirectory::new();
        assert_eq!(dir.lookup("nope"), None);
    }

    #[test]
    fn pinned_static_peer_survives_every_sweep() {
        let dir = PeerDirectory::new();
        dir.pin("aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:01".into());
        dir.upsert("node-1", "bb:bb:bb:bb:bb:bb".into(), Instant::now());

        // A cutoff in the far future would evict everything unpinned,
        // no matter how recently it was refreshed.
        let removed = dir.evict_older_than(Instant::now() + Duration::from_secs(3600));
        assert_eq!(removed, 1);
        assert!(dir.lookup("node-1").is_none());

        let entry = dir.lookup("aa:bb:cc:dd:ee:01").unwrap();
        assert!(entry.pinned);
        assert_eq!(dir.snapshot(), vec!["aa:bb:cc:dd:ee:01"]);
    }

    #[test]
    fn evict_removes_only_stale_entries() {
        let dir = PeerDirectory::new();
        let old = Instant::now();
        let fresh = old + Duration::from_secs(3600);

        dir.upsert("stale", "aa:aa:aa:aa:aa:aa".into(), old);
        dir.upsert("fresh", "bb:bb:bb:bb:bb:bb".into(), fresh);

        let removed = dir.evict_older_than(old + Duration::from_secs(1));
        assert_eq!(removed, 1);
        assert!(dir.lookup("stale").is_none());
        assert!(dir.lookup("fresh").is_some());
    }
}
