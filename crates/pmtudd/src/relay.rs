//! Capture-to-relay engine.
//!
//! Every payload pulled off the NFLOG channel is re-emitted once per
//! peer as a link-layer frame (unicast mode), or once for the whole
//! cluster as a multicast datagram. The payload itself is never
//! modified; unicast peers receive the captured packet byte for byte
//! behind a fresh Ethernet header.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::broadcast;

use pmtud_core::config::RelayMode;
use pmtud_core::wire::{self, MacAddr, OUTER_IPV4_HEADER_LEN};
use pmtud_services::{PeerDirectory, RelayMetrics};

use crate::netif::ReplicationInterface;
use crate::nflog::NflogSocket;
use crate::rawsock::PacketSocket;

/// Transmit side of the engine. Split out so the fan-out logic can be
/// tested against a recording sink.
pub trait RelaySink: Send {
    /// One link-layer frame toward one peer.
    fn send_frame(&mut self, dest: MacAddr, frame: &[u8]) -> io::Result<usize>;

    /// One datagram toward the multicast group.
    fn send_datagram(&mut self, body: &[u8]) -> io::Result<usize>;
}

/// Sends frames on the replication interface through a raw packet
/// socket.
pub struct LinkSink {
    sock: PacketSocket,
}

impl LinkSink {
    /// Protocol 0: this socket only transmits, and a nonzero protocol
    /// would make the kernel queue every matching frame on the
    /// interface into a receive buffer nothing drains.
    pub fn open(iface: &ReplicationInterface) -> io::Result<Self> {
        Ok(Self {
            sock: PacketSocket::open(iface.index, 0)?,
        })
    }
}

impl RelaySink for LinkSink {
    fn send_frame(&mut self, _dest: MacAddr, frame: &[u8]) -> io::Result<usize> {
        self.sock.send(frame)
    }

    fn send_datagram(&mut self, _body: &[u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// Sends datagrams to the relay group over a connected UDP socket.
pub struct McastSink {
    sock: Socket,
}

impl McastSink {
    pub fn open(group: Ipv4Addr, port: u16, ttl: u8) -> io::Result<Self> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_multicast_ttl_v4(u32::from(ttl))?;
        sock.connect(&SocketAddrV4::new(group, port).into())?;
        Ok(Self { sock })
    }
}

impl RelaySink for McastSink {
    fn send_frame(&mut self, _dest: MacAddr, _frame: &[u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn send_datagram(&mut self, body: &[u8]) -> io::Result<usize> {
        self.sock.send(body)
    }
}

/// Session-fatal relay failures. Anything recoverable is counted,
/// logged, and swallowed before it gets here.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("directory holds malformed hardware address {peer:?}: {source}")]
    BadPeerAddress {
        peer: String,
        #[source]
        source: wire::WireError,
    },

    #[error("send to peer {peer} failed: {source}")]
    Send {
        peer: String,
        #[source]
        source: io::Error,
    },

    #[error("multicast send failed: {0}")]
    Multicast(#[source] io::Error),
}

pub struct RelayEngine<S: RelaySink> {
    mode: RelayMode,
    local_mac: MacAddr,
    directory: PeerDirectory,
    metrics: Arc<RelayMetrics>,
    sink: S,
}

impl<S: RelaySink> RelayEngine<S> {
    pub fn new(
        mode: RelayMode,
        local_mac: MacAddr,
        directory: PeerDirectory,
        metrics: Arc<RelayMetrics>,
        sink: S,
    ) -> Self {
        Self {
            mode,
            local_mac,
            directory,
            metrics,
            sink,
        }
    }

    /// Relays one captured payload. A malformed capture is dropped and
    /// reported through the counters; `Err` means the session cannot
    /// continue.
    pub fn handle_packet(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        let start = Instant::now();

        let icmp_source = match wire::outer_source(payload) {
            Ok(addr) => addr,
            Err(error) => {
                self.metrics.inc_error();
                tracing::warn!(%error, "unreadable capture, dropping");
                return Ok(());
            }
        };

        // Inner addresses are diagnostic; an ICMP too short to carry
        // them still gets relayed.
        let source_label = match wire::inner_addrs(payload) {
            Ok((src, dst)) => {
                tracing::info!(
                    icmp_source = %icmp_source,
                    source = %src,
                    destination = %dst,
                    "fragmentation-needed received, relaying"
                );
                src.to_string()
            }
            Err(error) => {
                tracing::warn!(%error, icmp_source = %icmp_source, "cannot extract inner addresses");
                String::new()
            }
        };
        self.metrics.inc_recv(&source_label);

        match self.mode {
            RelayMode::Unicast => self.fan_out(payload)?,
            RelayMode::Multicast => {
                // One datagram for the whole cluster, minus the outer
                // header; each receiver prepends its own on re-injection.
                // outer_source already guaranteed 20 header bytes.
                if let Err(e) = self.sink.send_datagram(&payload[OUTER_IPV4_HEADER_LEN..]) {
                    self.metrics.inc_error();
                    return Err(RelayError::Multicast(e));
                }
                self.metrics.inc_sent();
            }
        }

        self.metrics.observe_duration(start.elapsed());
        Ok(())
    }

    /// One frame per directory peer, inside a single consistent
    /// snapshot. The first send failure aborts the pass.
    fn fan_out(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        let peers = self.directory.snapshot();
        for peer in peers {
            let dest: MacAddr = match peer.parse() {
                Ok(mac) => mac,
                Err(source) => {
                    self.metrics.inc_error();
                    return Err(RelayError::BadPeerAddress { peer, source });
                }
            };
            let frame = wire::build_frame(dest, self.local_mac, payload);
            self.metrics.touch_peer(&peer);
            if let Err(source) = self.sink.send_frame(dest, &frame) {
                self.metrics.inc_error();
                self.metrics.inc_sent_error(&peer);
                return Err(RelayError::Send { peer, source });
            }
            self.metrics.inc_sent();
            self.metrics.inc_sent_peer(&peer);
        }
        Ok(())
    }

    /// Drains the capture socket until shutdown or a fatal error. A
    /// fatal error fires the shutdown channel itself so sibling tasks
    /// stop with the session.
    pub async fn run(
        mut self,
        mut capture: NflogSocket,
        shutdown_tx: broadcast::Sender<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("capture session stopping");
                    return Ok(());
                }
                packet = capture.next_packet() => {
                    let payload = match packet {
                        Ok(p) => p,
                        Err(e) => {
                            self.metrics.inc_error();
                            let _ = shutdown_tx.send(());
                            return Err(e.into());
                        }
                    };
                    if let Err(e) = self.handle_packet(&payload) {
                        let _ = shutdown_tx.send(());
                        return Err(e.into());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<(MacAddr, Vec<u8>)>,
        datagrams: Vec<Vec<u8>>,
        fail_sends: bool,
    }

    impl RelaySink for &mut RecordingSink {
        fn send_frame(&mut self, dest: MacAddr, frame: &[u8]) -> io::Result<usize> {
            if self.fail_sends {
                return Err(io::Error::from(io::ErrorKind::NetworkUnreachable));
            }
            self.frames.push((dest, frame.to_vec()));
            Ok(frame.len())
        }

        fn send_datagram(&mut self, body: &[u8]) -> io::Result<usize> {
            self.datagrams.push(body.to_vec());
            Ok(body.len())
        }
    }

    fn sample_payload() -> Vec<u8> {
        let mut p = vec![0u8; 68];
        p[0] = 0x45;
        p[8] = 64;
        p[9] = wire::IPPROTO_ICMP;
        p[12..16].copy_from_slice(&[10, 0, 0, 1]);
        p[16..20].copy_from_slice(&[10, 0, 0, 2]);
        p[40..44].copy_from_slice(&[192, 168, 7, 1]);
        p[44..48].copy_from_slice(&[192, 168, 7, 2]);
        p
    }

    fn engine<'a>(
        mode: RelayMode,
        directory: PeerDirectory,
        metrics: Arc<RelayMetrics>,
        sink: &'a mut RecordingSink,
    ) -> RelayEngine<&'a mut RecordingSink> {
        let local = "02:00:00:00:00:01".parse().unwrap();
        RelayEngine::new(mode, local, directory, metrics, sink)
    }

    #[test]
    fn unicast_fans_out_to_every_peer() {
        let directory = PeerDirectory::new();
        let now = Instant::now();
        directory.upsert("node-a", "02:aa:aa:aa:aa:01".to_string(), now);
        directory.upsert("node-b", "02:aa:aa:aa:aa:02".to_string(), now);
        directory.upsert("node-c", "02:aa:aa:aa:aa:03".to_string(), now);
        let metrics = Arc::new(RelayMetrics::new("n1"));
        let mut sink = RecordingSink::default();

        let payload = sample_payload();
        engine(RelayMode::Unicast, directory, metrics.clone(), &mut sink)
            .handle_packet(&payload)
            .unwrap();

        assert_eq!(sink.frames.len(), 3);
        let mut dests: Vec<String> = sink.frames.iter().map(|(d, _)| d.to_string()).collect();
        dests.sort();
        assert_eq!(
            dests,
            vec!["02:aa:aa:aa:aa:01", "02:aa:aa:aa:aa:02", "02:aa:aa:aa:aa:03"]
        );
        for (_, frame) in &sink.frames {
            assert_eq!(frame.len(), 14 + payload.len());
            assert_eq!(&frame[12..14], &[0x08, 0x00]);
            assert_eq!(&frame[14..], payload.as_slice());
        }
        assert_eq!(metrics.sent_count(), 3);
        assert_eq!(metrics.sent_peer_count("02:aa:aa:aa:aa:02"), 1);
        assert_eq!(metrics.recv_count("192.168.7.1"), 1);
        assert_eq!(metrics.error_count(), 0);
    }

    #[test]
    fn multicast_sends_one_datagram_without_outer_header() {
        let directory = PeerDirectory::new();
        directory.upsert("node-a", "02:aa:aa:aa:aa:01".to_string(), Instant::now());
        let metrics = Arc::new(RelayMetrics::new("n1"));
        let mut sink = RecordingSink::default();

        let payload = sample_payload();
        engine(RelayMode::Multicast, directory, metrics.clone(), &mut sink)
            .handle_packet(&payload)
            .unwrap();

        assert!(sink.frames.is_empty());
        assert_eq!(sink.datagrams.len(), 1);
        assert_eq!(sink.datagrams[0], payload[20..].to_vec());
        assert_eq!(metrics.sent_count(), 1);
    }

    #[test]
    fn unreadable_capture_is_dropped_not_fatal() {
        let directory = PeerDirectory::new();
        directory.upsert("node-a", "02:aa:aa:aa:aa:01".to_string(), Instant::now());
        let metrics = Arc::new(RelayMetrics::new("n1"));
        let mut sink = RecordingSink::default();

        let mut payload = sample_payload();
        payload[0] = 0x60; // not IPv4
        engine(RelayMode::Unicast, directory, metrics.clone(), &mut sink)
            .handle_packet(&payload)
            .unwrap();

        assert!(sink.frames.is_empty());
        assert_eq!(metrics.error_count(), 1);
        assert_eq!(metrics.sent_count(), 0);
    }

    #[test]
    fn short_inner_packet_still_relays() {
        let directory = PeerDirectory::new();
        directory.upsert("node-a", "02:aa:aa:aa:aa:01".to_string(), Instant::now());
        let metrics = Arc::new(RelayMetrics::new("n1"));
        let mut sink = RecordingSink::default();

        // Outer header plus ICMP header only; inner addresses cut off.
        let payload = sample_payload()[..28].to_vec();
        engine(RelayMode::Unicast, directory, metrics.clone(), &mut sink)
            .handle_packet(&payload)
            .unwrap();

        assert_eq!(sink.frames.len(), 1);
        assert_eq!(metrics.recv_count(""), 1);
    }

    #[test]
    fn send_failure_is_session_fatal() {
        let directory = PeerDirectory::new();
        directory.upsert("node-a", "02:aa:aa:aa:aa:01".to_string(), Instant::now());
        let metrics = Arc::new(RelayMetrics::new("n1"));
        let mut sink = RecordingSink {
            fail_sends: true,
            ..Default::default()
        };

        let payload = sample_payload();
        let err = engine(RelayMode::Unicast, directory, metrics.clone(), &mut sink)
            .handle_packet(&payload)
            .unwrap_err();

        assert!(matches!(err, RelayError::Send { .. }));
        assert_eq!(metrics.error_count(), 1);
        assert_eq!(metrics.sent_error_peer_count("02:aa:aa:aa:aa:01"), 1);
        assert_eq!(metrics.sent_count(), 0);
    }

    #[test]
    fn empty_directory_relays_to_nobody() {
        let metrics = Arc::new(RelayMetrics::new("n1"));
        let mut sink = RecordingSink::default();

        let payload = sample_payload();
        engine(RelayMode::Unicast, PeerDirectory::new(), metrics.clone(), &mut sink)
            .handle_packet(&payload)
            .unwrap();

        assert!(sink.frames.is_empty());
        assert_eq!(metrics.sent_count(), 0);
        assert_eq!(metrics.recv_count("192.168.7.1"), 1);
    }
}
