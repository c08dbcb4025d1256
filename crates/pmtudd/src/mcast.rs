//! Multicast relay listener.
//!
//! In multicast mode every node sends its captures, minus the outer
//! IPv4 header, to a shared group. This listener joins the group and
//! re-injects each received body toward loopback as a fresh
//! ICMP-carrying packet, so the local stack learns the path MTU without
//! per-peer frames ever crossing the wire.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use zerocopy::AsBytes;

use pmtud_core::wire::{Ipv4Header, OUTER_IPV4_HEADER_LEN};
use pmtud_services::RelayMetrics;

use crate::rawsock::RawIpSocket;

const MAX_DATAGRAM: usize = 0xffff;

// ICMP header is 8 bytes and the inner source address sits 12 bytes
// into the inner header.
const INNER_SRC_IN_BODY: usize = 20;

pub async fn listener_loop(
    group: Ipv4Addr,
    port: u16,
    ttl: u8,
    metrics: Arc<RelayMetrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let socket = join_group(group, port).context("failed to join relay group")?;
    let socket = UdpSocket::from_std(socket).context("failed to register relay socket")?;
    let inject = RawIpSocket::open().context("failed to open re-injection socket")?;
    tracing::info!(group = %group, port, "relay listener joined group");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("relay listener stopping");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(r) => r,
                    Err(error) => {
                        metrics.inc_error();
                        tracing::warn!(%error, "relay group receive failed");
                        continue;
                    }
                };
                let Some((service_ip, packet)) = reinject_packet(&buf[..n], ttl) else {
                    metrics.inc_error();
                    tracing::warn!(bytes = n, from = %from, "short relay datagram, ignoring");
                    continue;
                };
                tracing::debug!(bytes = n, from = %from, service = %service_ip, "re-injecting relayed ICMP");
                if let Err(error) = inject.send_to(&packet, Ipv4Addr::LOCALHOST) {
                    metrics.inc_error();
                    tracing::warn!(%error, "re-injection failed");
                }
            }
        }
    }
}

/// Turns one relay datagram into the packet to inject toward loopback:
/// a fresh outer header followed by the body verbatim. Returns the
/// inner source address it carries for logging, or `None` when the
/// body is too short to hold one.
fn reinject_packet(body: &[u8], ttl: u8) -> Option<(Ipv4Addr, Vec<u8>)> {
    let octets: [u8; 4] = body
        .get(INNER_SRC_IN_BODY..INNER_SRC_IN_BODY + 4)?
        .try_into()
        .ok()?;
    let mut packet = Vec::with_capacity(OUTER_IPV4_HEADER_LEN + body.len());
    packet.extend_from_slice(Ipv4Header::icmp_reinject(Ipv4Addr::LOCALHOST, ttl).as_bytes());
    packet.extend_from_slice(body);
    Some((Ipv4Addr::from(octets), packet))
}

fn join_group(group: Ipv4Addr, port: u16) -> anyhow::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ICMP header plus the leading 20 bytes of the original packet,
    /// with the inner source address at bytes 20..24.
    fn sample_body() -> Vec<u8> {
        let mut body = vec![0u8; 48];
        body[0] = 3; // destination unreachable
        body[1] = 4; // fragmentation needed
        body[INNER_SRC_IN_BODY..INNER_SRC_IN_BODY + 4].copy_from_slice(&[10, 40, 0, 9]);
        body
    }

    #[test]
    fn reinjected_packet_prepends_fresh_header() {
        let body = sample_body();
        let (service_ip, packet) = reinject_packet(&body, 1).unwrap();

        assert_eq!(service_ip, Ipv4Addr::new(10, 40, 0, 9));
        assert_eq!(packet.len(), OUTER_IPV4_HEADER_LEN + body.len());
        assert_eq!(packet[0], 0x45);
        assert_eq!(packet[8], 1); // ttl
        assert_eq!(packet[9], pmtud_core::wire::IPPROTO_ICMP);
        assert_eq!(&packet[16..20], &[127, 0, 0, 1]);
        assert_eq!(&packet[OUTER_IPV4_HEADER_LEN..], body.as_slice());
    }

    #[test]
    fn short_datagram_is_rejected() {
        let body = sample_body();
        assert!(reinject_packet(&body[..INNER_SRC_IN_BODY + 3], 1).is_none());
        assert!(reinject_packet(&[], 1).is_none());
    }
}
