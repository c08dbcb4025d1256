//! pmtudd — path MTU relay daemon.
//!
//! A firewall rule copies ICMP fragmentation-needed packets into an
//! NFLOG group. pmtudd drains that group and re-emits every capture to
//! all cluster peers, so path MTU discovery converges on every node and
//! not just the one whose traffic triggered the ICMP. Peers are tracked
//! in a directory fed by node events and refreshed through ARP.

mod arp;
mod mcast;
mod netif;
mod nflog;
mod rawsock;
mod relay;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use pmtud_core::config::{PmtudConfig, RelayMode};
use pmtud_core::wire::MacAddr;
use pmtud_services::{
    HwResolver, NodeEvent, PeerDirectory, Reconciler, RelayMetrics, StaticInventory,
};

use crate::relay::RelayEngine;

// A node that misses this many refresh rounds has left the cluster.
const EVICTION_ROUNDS: u32 = 6;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(error) = PmtudConfig::write_default_if_missing() {
        tracing::warn!(%error, "could not write default config");
    }
    let config = match PmtudConfig::load() {
        Ok(config) => config,
        Err(error) => {
            tracing::warn!(%error, "could not load config, using defaults");
            PmtudConfig::default()
        }
    };

    let node_name = config.node.effective_name();
    tracing::info!(node = %node_name, "pmtudd starting");

    // No replication interface, nothing to relay on.
    let iface = netif::find_replication_interface(
        &config.network.interface_names,
        config.network.interface_mtu,
    )
    .context("no replication interface available")?;
    tracing::info!(
        iface = %iface.name,
        mtu = iface.mtu,
        mac = %iface.mac,
        "replication interface selected"
    );

    // The operator-side scrape and probe targets sit on the
    // default-route interface; log the address so they are predictable.
    match netif::default_route_interface().and_then(|name| netif::interface_ipv4(&name)) {
        Ok(addr) => tracing::info!(
            %addr,
            metrics_port = config.network.metrics_port,
            health_port = config.network.health_port,
            "operator endpoints"
        ),
        Err(error) => tracing::warn!(%error, "could not determine default-route address"),
    }

    let metrics = Arc::new(RelayMetrics::new(node_name.clone()));
    // Zero-valued series from the first scrape onward.
    metrics.touch_recv("");

    let directory = PeerDirectory::new();
    seed_static_peers(&config, &directory, &metrics, iface.mac);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received");
                let _ = shutdown_tx.send(());
            }
        });
    }

    let staleness = config.resolver.staleness_window();

    let resolver: Arc<dyn HwResolver> = Arc::new(arp::ArpResolver::new(
        iface.name.clone(),
        config.resolver.draw_jitter(),
        config.resolver.arp_timeout(),
        arp::LinkExchange,
    ));
    let inventory = Arc::new(StaticInventory::new(
        config
            .cluster
            .nodes
            .iter()
            .map(|n| (n.name.clone(), n.address.clone()))
            .collect(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        node_name.clone(),
        staleness,
        directory.clone(),
        inventory.clone(),
        resolver,
        metrics.clone(),
    ));

    // Node events flow through one channel; today the announce task
    // below is the only producer, a control-plane watch would be
    // another.
    let (event_tx, mut event_rx) = mpsc::channel::<NodeEvent>(64);

    let reconcile_task = {
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        if let Err(error) = reconciler.reconcile(&event.node).await {
                            tracing::warn!(node = %event.node, %error, "reconcile failed");
                        }
                    }
                }
            }
            anyhow::Ok(())
        })
    };

    // Replays the configured node list at half the staleness window, so
    // every entry refreshes before it goes stale.
    let announce_task = {
        let names: Vec<String> = inventory.names().map(str::to_string).collect();
        let event_tx = event_tx.clone();
        let mut shutdown = shutdown_tx.subscribe();
        let period = (staleness / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        for name in &names {
                            if event_tx.send(NodeEvent::new(name.clone())).await.is_err() {
                                return anyhow::Ok(());
                            }
                        }
                    }
                }
            }
            anyhow::Ok(())
        })
    };

    let evict_task = {
        let directory = directory.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(staleness.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let Some(cutoff) = Instant::now().checked_sub(staleness * EVICTION_ROUNDS) else {
                            continue;
                        };
                        let removed = directory.evict_older_than(cutoff);
                        if removed > 0 {
                            tracing::info!(removed, "evicted stale peer entries");
                        }
                    }
                }
            }
            anyhow::Ok(())
        })
    };

    let mcast_task = match config.relay.mode {
        RelayMode::Multicast => {
            let group: Ipv4Addr = config
                .relay
                .multicast_group
                .parse()
                .context("malformed multicast group address")?;
            tokio::spawn(mcast::listener_loop(
                group,
                config.relay.multicast_port,
                config.relay.ttl,
                metrics.clone(),
                shutdown_tx.subscribe(),
            ))
        }
        // Unicast mode has no listener; park the select slot.
        RelayMode::Unicast => tokio::spawn(std::future::pending()),
    };

    let capture = nflog::NflogSocket::open(config.network.nflog_group)
        .context("could not open NFLOG capture")?;
    tracing::info!(group = config.network.nflog_group, "NFLOG capture bound");

    let relay_task = match config.relay.mode {
        RelayMode::Unicast => {
            let sink = relay::LinkSink::open(&iface).context("could not open relay socket")?;
            let engine = RelayEngine::new(
                RelayMode::Unicast,
                iface.mac,
                directory.clone(),
                metrics.clone(),
                sink,
            );
            tokio::spawn(engine.run(capture, shutdown_tx.clone(), shutdown_tx.subscribe()))
        }
        RelayMode::Multicast => {
            let group: Ipv4Addr = config
                .relay
                .multicast_group
                .parse()
                .context("malformed multicast group address")?;
            let sink =
                relay::McastSink::open(group, config.relay.multicast_port, config.relay.ttl)
                    .context("could not open multicast relay socket")?;
            let engine = RelayEngine::new(
                RelayMode::Multicast,
                iface.mac,
                directory.clone(),
                metrics.clone(),
                sink,
            );
            tokio::spawn(engine.run(capture, shutdown_tx.clone(), shutdown_tx.subscribe()))
        }
    };

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("shutting down");
        }
        r = relay_task => {
            tracing::error!("relay engine exited: {r:?}");
            anyhow::bail!("capture session ended");
        }
        r = reconcile_task => {
            tracing::error!("reconcile loop exited: {r:?}");
            anyhow::bail!("reconcile loop ended");
        }
        r = announce_task => {
            tracing::error!("announce task exited: {r:?}");
            anyhow::bail!("announce task ended");
        }
        r = evict_task => {
            tracing::error!("eviction sweep exited: {r:?}");
            anyhow::bail!("eviction sweep ended");
        }
        r = mcast_task => {
            tracing::error!("relay listener exited: {r:?}");
            anyhow::bail!("relay listener ended");
        }
    }
    Ok(())
}

/// Pins operator-configured peer hardware addresses into the directory.
/// Pinned entries have no node events behind them, so they are exempt
/// from the eviction sweep. The node's own address never relays to
/// itself.
fn seed_static_peers(
    config: &PmtudConfig,
    directory: &PeerDirectory,
    metrics: &RelayMetrics,
    own_mac: MacAddr,
) {
    for peer in &config.relay.peers {
        match peer.parse::<MacAddr>() {
            Ok(mac) if mac == own_mac => {
                tracing::info!(peer = %peer, "skipping own hardware address in peer list");
            }
            Ok(mac) => {
                let text = mac.to_string();
                metrics.touch_peer(&text);
                directory.pin(&text, text.clone());
            }
            Err(error) => {
                metrics.inc_error();
                tracing::warn!(peer = %peer, %error, "ignoring malformed peer address");
            }
        }
    }
}
