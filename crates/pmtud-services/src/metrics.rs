//! Relay metrics — the counters and the callback-duration histogram the
//! daemon emits. Rendered in Prometheus text format on demand; actually
//! serving the text is the operator's concern, not ours.
//!
//! Metric names mirror the pmtud family operators already scrape:
//! `pmtud_recv_packets_total`, `pmtud_error_total`,
//! `pmtud_sent_error_peer_total`, `pmtud_sent_packets_total`,
//! `pmtud_sent_packets_peer`, `pmtud_peer_arp_resolve_error`,
//! `pmtud_callback_duration_seconds`.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

/// Histogram bucket upper bounds, in seconds.
pub const DURATION_BUCKETS: [f64; 9] = [0.01, 0.02, 0.03, 0.04, 0.05, 0.06, 0.07, 0.08, 0.09];

/// All counters the relay and reconciler update. Shared via `Arc`.
pub struct RelayMetrics {
    node: String,

    /// Received captures, labeled by the inner packet's source IP
    /// (empty label when extraction failed).
    recv_packets: DashMap<String, AtomicU64>,
    /// General errors, any subsystem.
    errors: AtomicU64,
    /// Frames/datagrams sent, aggregate.
    sent_packets: AtomicU64,
    /// Frames sent, per peer hardware address.
    sent_packets_peer: DashMap<String, AtomicU64>,
    /// Send failures, per peer hardware address.
    sent_errors_peer: DashMap<String, AtomicU64>,
    /// Resolution failures, per node name.
    arp_resolve_errors: DashMap<String, AtomicU64>,

    /// Cumulative bucket counts for the per-packet processing duration.
    duration_buckets: [AtomicU64; 9],
    duration_count: AtomicU64,
    duration_sum_micros: AtomicU64,
}

impl RelayMetrics {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            recv_packets: DashMap::new(),
            errors: AtomicU64::new(0),
            sent_packets: AtomicU64::new(0),
            sent_packets_peer: DashMap::new(),
            sent_errors_peer: DashMap::new(),
            arp_resolve_errors: DashMap::new(),
            duration_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            duration_count: AtomicU64::new(0),
            duration_sum_micros: AtomicU64::new(0),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn inc_recv(&self, source_ip: &str) {
        bump(&self.recv_packets, source_ip);
    }

    pub fn inc_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sent(&self) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sent_peer(&self, peer: &str) {
        bump(&self.sent_packets_peer, peer);
    }

    pub fn inc_sent_error(&self, peer: &str) {
        bump(&self.sent_errors_peer, peer);
    }

    pub fn inc_resolve_error(&self, node: &str) {
        bump(&self.arp_resolve_errors, node);
    }

    /// Make labeled series exist at zero before the first event, so a
    /// scrape right after startup already reports them.
    pub fn touch_peer(&self, peer: &str) {
        touch(&self.sent_packets_peer, peer);
        touch(&self.sent_errors_peer, peer);
    }

    pub fn touch_recv(&self, source_ip: &str) {
        touch(&self.recv_packets, source_ip);
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if secs <= *bound {
                self.duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.duration_count.fetch_add(1, Ordering::Relaxed);
        self.duration_sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn sent_count(&self) -> u64 {
        self.sent_packets.load(Ordering::Relaxed)
    }

    pub fn sent_peer_count(&self, peer: &str) -> u64 {
        load(&self.sent_packets_peer, peer)
    }

    pub fn sent_error_peer_count(&self, peer: &str) -> u64 {
        load(&self.sent_errors_peer, peer)
    }

    pub fn resolve_error_count(&self, node: &str) -> u64 {
        load(&self.arp_resolve_errors, node)
    }

    pub fn recv_count(&self, source_ip: &str) -> u64 {
        load(&self.recv_packets, source_ip)
    }

    /// Render every series in Prometheus text format.
    pub fn render(&self) -> String {
        let node = &self.node;
        let mut out = String::with_capacity(2048);

        out.push_str("# HELP pmtud_recv_packets_total Number of received ICMP packets\n");
        out.push_str("# TYPE pmtud_recv_packets_total counter\n");
        for entry in self.recv_packets.iter() {
            let _ = writeln!(
                out,
                "pmtud_recv_packets_total{{node=\"{node}\",source_ip=\"{}\"}} {}",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            );
        }

        out.push_str("# HELP pmtud_error_total Number of general errors\n");
        out.push_str("# TYPE pmtud_error_total counter\n");
        let _ = writeln!(
            out,
            "pmtud_error_total{{node=\"{node}\"}} {}",
            self.errors.load(Ordering::Relaxed)
        );

        out.push_str("# HELP pmtud_sent_packets_total Number of sent ICMP packets\n");
        out.push_str("# TYPE pmtud_sent_packets_total counter\n");
        let _ = writeln!(
            out,
            "pmtud_sent_packets_total{{node=\"{node}\"}} {}",
            self.sent_packets.load(Ordering::Relaxed)
        );

        out.push_str("# HELP pmtud_sent_packets_peer Number of sent ICMP packets per peer\n");
        out.push_str("# TYPE pmtud_sent_packets_peer counter\n");
        for entry in self.sent_packets_peer.iter() {
            let _ = writeln!(
                out,
                "pmtud_sent_packets_peer{{node=\"{node}\",peer=\"{}\"}} {}",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            );
        }

        out.push_str("# HELP pmtud_sent_error_peer_total Number of send errors per peer\n");
        out.push_str("# TYPE pmtud_sent_error_peer_total counter\n");
        for entry in self.sent_errors_peer.iter() {
            let _ = writeln!(
                out,
                "pmtud_sent_error_peer_total{{node=\"{node}\",peer=\"{}\"}} {}",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            );
        }

        out.push_str("# HELP pmtud_peer_arp_resolve_error Number of ARP resolution errors per peer\n");
        out.push_str("# TYPE pmtud_peer_arp_resolve_error counter\n");
        for entry in self.arp_resolve_errors.iter() {
            let _ = writeln!(
                out,
                "pmtud_peer_arp_resolve_error{{node=\"{node}\",peer=\"{}\"}} {}",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            );
        }

        out.push_str(
            "# HELP pmtud_callback_duration_seconds Duration of the capture callback in seconds\n",
        );
        out.push_str("# TYPE pmtud_callback_duration_seconds histogram\n");
        let count = self.duration_count.load(Ordering::Relaxed);
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            let _ = writeln!(
                out,
                "pmtud_callback_duration_seconds_bucket{{node=\"{node}\",le=\"{bound}\"}} {}",
                self.duration_buckets[i].load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(
            out,
            "pmtud_callback_duration_seconds_bucket{{node=\"{node}\",le=\"+Inf\"}} {count}"
        );
        let _ = writeln!(
            out,
            "pmtud_callback_duration_seconds_sum{{node=\"{node}\"}} {}",
            self.duration_sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        );
        let _ = writeln!(
            out,
            "pmtud_callback_duration_seconds_count{{node=\"{node}\"}} {count}"
        );

        out
    }
}

fn bump(map: &DashMap<String, AtomicU64>, key: &str) {
    map.entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn touch(map: &DashMap<String, AtomicU64>, key: &str) {
    map.entry(key.to_string()).or_insert_with(|| AtomicU64::new(0));
}

fn load(map: &DashMap<String, AtomicU64>, key: &str) -> u64 {
    map.get(key)
        .map(|v| v.load(Ordering::Relaxed))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_with_labels() {
        let metrics = RelayMetrics::new("node-a");
        metrics.inc_recv("10.0.0.1");
        metrics.inc_recv("10.0.0.1");
        metrics.inc_error();
        metrics.inc_sent();
        metrics.inc_sent_peer("aa:aa:aa:aa:aa:aa");
        metrics.inc_resolve_error("node-b");

        let text = metrics.render();
        assert!(text.contains("pmtud_recv_packets_total{node=\"node-a\",source_ip=\"10.0.0.1\"} 2"));
        assert!(text.contains("pmtud_error_total{node=\"node-a\"} 1"));
        assert!(text.contains("pmtud_sent_packets_total{node=\"node-a\"} 1"));
        assert!(
            text.contains("pmtud_sent_packets_peer{node=\"node-a\",peer=\"aa:aa:aa:aa:aa:aa\"} 1")
        );
        assert!(text.contains("pmtud_peer_arp_resolve_error{node=\"node-a\",peer=\"node-b\"} 1"));
    }

    #[test]
    fn touched_series_report_zero() {
        let metrics = RelayMetrics::new("node-a");
        metrics.touch_peer("bb:bb:bb:bb:bb:bb");
        let text = metrics.render();
        assert!(
            text.contains("pmtud_sent_packets_peer{node=\"node-a\",peer=\"bb:bb:bb:bb:bb:bb\"} 0")
        );
        assert!(text
            .contains("pmtud_sent_error_peer_total{node=\"node-a\",peer=\"bb:bb:bb:bb:bb:bb\"} 0"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = RelayMetrics::new("node-a");
        metrics.observe_duration(Duration::from_millis(15)); // lands in 0.02..0.09
        metrics.observe_duration(Duration::from_millis(85)); // lands in 0.09 only
        metrics.observe_duration(Duration::from_millis(500)); // beyond every bound

        let text = metrics.render();
        assert!(text.contains("le=\"0.01\"} 0"));
        assert!(text.contains("le=\"0.02\"} 1"));
        assert!(text.contains("le=\"0.09\"} 2"));
        assert!(text.contains("le=\"+Inf\"} 3"));
        assert!(text.contains("pmtud_callback_duration_seconds_count{node=\"node-a\"} 3"));
    }
}
