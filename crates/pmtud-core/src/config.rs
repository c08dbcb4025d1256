//! Configuration for the PMTU relay daemon.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PMTUD_CONFIG (explicit override)
//!   2. /etc/pmtud/config.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PmtudConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub relay: RelayConfig,
    pub resolver: ResolverConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's cluster identifier. Empty = hostname.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Candidate replication interface names, in preference order.
    pub interface_names: Vec<String>,
    /// MTU the replication interface must have to be selected.
    pub interface_mtu: u32,
    /// NFLOG group the firewall rule logs ICMP frag-needed packets to.
    pub nflog_group: u16,
    /// Port on which the operator exposes Prometheus metrics.
    pub metrics_port: u16,
    /// Port on which the operator exposes health probes.
    pub health_port: u16,
}

/// How captured packets reach the peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// One link-layer frame per peer hardware address.
    #[default]
    Unicast,
    /// One UDP datagram to a shared group, regardless of peer count.
    Multicast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub mode: RelayMode,
    /// Multicast group address (multicast mode only).
    pub multicast_group: String,
    /// Multicast destination port (multicast mode only).
    pub multicast_port: u16,
    /// TTL for resent packets. The link-layer path ignores it; multicast
    /// and re-injected packets carry it. An IPv4 TTL is one octet, so
    /// out-of-range values fail at parse time.
    pub ttl: u8,
    /// Static peer hardware addresses to seed the directory with when no
    /// cluster control plane feeds node events. Own MAC is skipped.
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Deadline for a single ARP exchange.
    pub arp_timeout_secs: u64,
    /// Directory entries younger than this are not re-resolved.
    pub staleness_minutes: u64,
    /// Jitter bounds for the per-process resolution delay, drawn once at
    /// startup so concurrent daemons spread their bursts apart.
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

/// Known cluster nodes, for operation without a control-plane watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: Vec<ClusterNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub name: String,
    /// First reported address; what the control plane would report.
    pub address: String,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for PmtudConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            network: NetworkConfig::default(),
            relay: RelayConfig::default(),
            resolver: ResolverConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface_names: Vec::new(),
            interface_mtu: 1500,
            nflog_group: 33,
            metrics_port: 30040,
            health_port: 30041,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::Unicast,
            multicast_group: "239.41.41.80".to_string(),
            multicast_port: 41080,
            ttl: 1,
            peers: Vec::new(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            arp_timeout_secs: 1,
            staleness_minutes: 5,
            jitter_min_ms: 1000,
            jitter_max_ms: 2000,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl ResolverConfig {
    /// Draw the process-wide resolution jitter. Called once at startup;
    /// the resulting duration is passed into the resolver explicitly so
    /// tests can pin it.
    pub fn draw_jitter(&self) -> Duration {
        use rand::Rng;
        let (lo, hi) = (
            self.jitter_min_ms.min(self.jitter_max_ms),
            self.jitter_min_ms.max(self.jitter_max_ms),
        );
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_minutes * 60)
    }

    pub fn arp_timeout(&self) -> Duration {
        Duration::from_secs(self.arp_timeout_secs)
    }
}

impl NodeConfig {
    /// Configured name, or the hostname as the control plane would know it.
    pub fn effective_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl PmtudConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PmtudConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PMTUD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/pmtud/config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PmtudConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PMTUD_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PMTUD_NODE__NAME") {
            self.node.name = v;
        }
        if let Ok(v) = std::env::var("PMTUD_NETWORK__INTERFACE_NAMES") {
            self.network.interface_names =
                v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("PMTUD_NETWORK__INTERFACE_MTU") {
            if let Ok(n) = v.parse() {
                self.network.interface_mtu = n;
            }
        }
        if let Ok(v) = std::env::var("PMTUD_NETWORK__NFLOG_GROUP") {
            if let Ok(n) = v.parse() {
                self.network.nflog_group = n;
            }
        }
        if let Ok(v) = std::env::var("PMTUD_RELAY__MODE") {
            match v.as_str() {
                "unicast" => self.relay.mode = RelayMode::Unicast,
                "multicast" => self.relay.mode = RelayMode::Multicast,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("PMTUD_RELAY__MULTICAST_GROUP") {
            self.relay.multicast_group = v;
        }
        if let Ok(v) = std::env::var("PMTUD_RELAY__MULTICAST_PORT") {
            if let Ok(n) = v.parse() {
                self.relay.multicast_port = n;
            }
        }
        if let Ok(v) = std::env::var("PMTUD_RELAY__PEERS") {
            self.relay.peers = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("PMTUD_RESOLVER__ARP_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.resolver.arp_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("PMTUD_RESOLVER__STALENESS_MINUTES") {
            if let Ok(n) = v.parse() {
                self.resolver.staleness_minutes = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_deployment_defaults() {
        let config = PmtudConfig::default();
        assert_eq!(config.network.nflog_group, 33);
        assert_eq!(config.network.interface_mtu, 1500);
        assert_eq!(config.relay.mode, RelayMode::Unicast);
        assert_eq!(config.resolver.arp_timeout_secs, 1);
        assert_eq!(config.resolver.staleness_minutes, 5);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let resolver = ResolverConfig {
            jitter_min_ms: 100,
            jitter_max_ms: 200,
            ..ResolverConfig::default()
        };
        for _ in 0..32 {
            let jitter = resolver.draw_jitter();
            assert!(jitter >= Duration::from_millis(100));
            assert!(jitter <= Duration::from_millis(200));
        }
    }

    #[test]
    fn ttl_beyond_one_octet_is_rejected() {
        let result = toml::from_str::<PmtudConfig>(
            r#"
            [relay]
            ttl = 300
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn relay_mode_parses_from_toml() {
        let config: PmtudConfig = toml::from_str(
            r#"
            [relay]
            mode = "multicast"
            multicast_group = "239.1.2.3"
            multicast_port = 4444
            "#,
        )
        .unwrap();
        assert_eq!(config.relay.mode, RelayMode::Multicast);
        assert_eq!(config.relay.multicast_group, "239.1.2.3");
        assert_eq!(config.relay.multicast_port, 4444);
    }

    #[test]
    fn cluster_nodes_parse_from_toml() {
        let config: PmtudConfig = toml::from_str(
            r#"
            [[cluster.nodes]]
            name = "node-1"
            address = "10.0.0.1"

            [[cluster.nodes]]
            name = "node-2"
            address = "10.0.0.2"
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster.nodes.len(), 2);
        assert_eq!(config.cluster.nodes[1].name, "node-2");
        assert_eq!(config.cluster.nodes[1].address, "10.0.0.2");
    }
}
