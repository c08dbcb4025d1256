//! ARP-based hardware address resolution.
//!
//! Node events tend to arrive in clusters (a rollout touches every
//! node), so each resolution first sleeps a per-process jitter drawn at
//! startup, then takes a process-wide lock. At most one ARP exchange is
//! on the wire at any time.

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use zerocopy::{AsBytes, FromBytes};

use pmtud_core::wire::{ArpPacket, EthernetHeader, MacAddr, ETHERNET_HEADER_LEN, ETHERTYPE_ARP};
use pmtud_services::{HwResolver, ResolveError};

use crate::netif::{self, ReplicationInterface};
use crate::rawsock::PacketSocket;

const ARP_PACKET_LEN: usize = 28;

/// One blocking request/reply exchange. Runs on the blocking pool with
/// the serialization lock held.
pub trait ArpExchange: Send + Sync + 'static {
    fn exchange(
        &self,
        iface: &ReplicationInterface,
        target: Ipv4Addr,
        deadline: Duration,
    ) -> Result<MacAddr, ResolveError>;
}

pub struct ArpResolver<X: ArpExchange> {
    iface_name: String,
    jitter: Duration,
    deadline: Duration,
    serialize: Mutex<()>,
    exchange: Arc<X>,
}

impl<X: ArpExchange> ArpResolver<X> {
    pub fn new(iface_name: String, jitter: Duration, deadline: Duration, exchange: X) -> Self {
        Self {
            iface_name,
            jitter,
            deadline,
            serialize: Mutex::new(()),
            exchange: Arc::new(exchange),
        }
    }
}

#[async_trait]
impl<X: ArpExchange> HwResolver for ArpResolver<X> {
    async fn resolve(&self, addr: &str) -> Result<String, ResolveError> {
        // Jitter first, lock second: a burst spreads out before anyone
        // queues on the wire.
        tokio::time::sleep(self.jitter).await;

        let iface = netif::lookup(&self.iface_name)
            .map_err(|_| ResolveError::Interface(self.iface_name.clone()))?;

        let target: Ipv4Addr = addr
            .parse()
            .map_err(|e| ResolveError::AddressParse(addr.to_string(), e))?;

        let _wire = self.serialize.lock().await;
        let exchange = Arc::clone(&self.exchange);
        let deadline = self.deadline;
        tokio::task::spawn_blocking(move || exchange.exchange(&iface, target, deadline))
            .await
            .map_err(|e| ResolveError::Exchange(io::Error::other(e)))?
            .map(|mac| mac.to_string())
    }
}

/// The production exchange: broadcast a who-has request on the
/// replication interface and wait for the matching reply. The socket
/// lives only for the exchange and closes on every exit path.
pub struct LinkExchange;

impl ArpExchange for LinkExchange {
    fn exchange(
        &self,
        iface: &ReplicationInterface,
        target: Ipv4Addr,
        deadline: Duration,
    ) -> Result<MacAddr, ResolveError> {
        let sender_ip = netif::interface_ipv4(&iface.name)
            .map_err(|_| ResolveError::Interface(iface.name.clone()))?;

        let sock = PacketSocket::open(iface.index, ETHERTYPE_ARP).map_err(ResolveError::Socket)?;
        sock.set_read_timeout(deadline).map_err(ResolveError::Socket)?;

        let request = ArpPacket::request(iface.mac, sender_ip, target);
        let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + ARP_PACKET_LEN);
        frame.extend_from_slice(
            EthernetHeader::new(MacAddr::BROADCAST, iface.mac, ETHERTYPE_ARP).as_bytes(),
        );
        frame.extend_from_slice(request.as_bytes());
        sock.send(&frame).map_err(ResolveError::Exchange)?;

        // Unrelated ARP traffic lands on the same socket; keep reading
        // until our reply or the deadline.
        let started = Instant::now();
        let mut buf = [0u8; 1500];
        while started.elapsed() < deadline {
            let n = match sock.recv(&mut buf) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    break
                }
                Err(e) => return Err(ResolveError::Exchange(e)),
            };
            if n < ETHERNET_HEADER_LEN + ARP_PACKET_LEN {
                continue;
            }
            if let Some(packet) = ArpPacket::read_from_prefix(&buf[ETHERNET_HEADER_LEN..n]) {
                if packet.answers(target) {
                    return Ok(packet.sender_mac);
                }
            }
        }
        Err(ResolveError::Exchange(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no ARP reply for {target}"),
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Records concurrency; resolves everything to a fixed address.
    #[derive(Default)]
    struct InstrumentedExchange {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ArpExchange for InstrumentedExchange {
        fn exchange(
            &self,
            _iface: &ReplicationInterface,
            _target: Ipv4Addr,
            _deadline: Duration,
        ) -> Result<MacAddr, ResolveError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(25));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MacAddr([0x02, 0, 0, 0, 0, 0x42]))
        }
    }

    fn resolver(iface: &str) -> Arc<ArpResolver<InstrumentedExchange>> {
        Arc::new(ArpResolver::new(
            iface.to_string(),
            Duration::ZERO,
            Duration::from_secs(1),
            InstrumentedExchange::default(),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolutions_are_serialized() {
        let resolver = resolver("lo");
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let r = Arc::clone(&resolver);
            tasks.push(tokio::spawn(async move { r.resolve("10.1.2.3").await }));
        }
        for task in tasks {
            let mac = task.await.unwrap().unwrap();
            assert_eq!(mac, "02:00:00:00:00:42");
        }
        assert_eq!(resolver.exchange.calls.load(Ordering::SeqCst), 4);
        assert_eq!(resolver.exchange.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_address_never_reaches_the_wire() {
        let resolver = resolver("lo");
        let err = resolver.resolve("not-an-address").await.unwrap_err();
        assert!(matches!(err, ResolveError::AddressParse(_, _)));
        assert_eq!(resolver.exchange.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_interface_fails_before_parsing() {
        let resolver = resolver("definitely-not-here0");
        let err = resolver.resolve("10.1.2.3").await.unwrap_err();
        assert!(matches!(err, ResolveError::Interface(_)));
    }
}
