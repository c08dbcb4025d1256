//! PMTU relay wire formats.
//!
//! A captured NFLOG payload is a raw IPv4 packet: a 20-byte outer IPv4
//! header (source = whoever generated the ICMP frag-needed), an 8-byte
//! ICMP header, then the leading bytes of the original oversized packet.
//! There is no ICMP type-3 parsing crate in our stack, so the inner
//! addresses are read at fixed offsets, with explicit length checks so a
//! truncated capture fails as an error instead of slicing out of bounds.
//!
//! All on-wire structs are #[repr(C, packed)] with zerocopy derives and
//! compile-time size guards.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Fixed layout constants ───────────────────────────────────────────────────

/// EtherType for IPv4, used on every relayed frame.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType for ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Link-layer header: destination MAC, source MAC, EtherType.
pub const ETHERNET_HEADER_LEN: usize = 14;
/// The outer IPv4 header is always 20 bytes (iptables hands us the packet
/// from the start of the IP header, and ICMP senders do not use options).
pub const OUTER_IPV4_HEADER_LEN: usize = 20;
/// Outer IPv4 (20) + ICMP header (8) + inner IPv4 bytes preceding the
/// address fields (12).
pub const INNER_SRC_OFFSET: usize = 40;
pub const INNER_DST_OFFSET: usize = 44;
pub const INNER_ADDRS_END: usize = 48;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting captured bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("payload is {0} bytes, need at least {1}")]
    Truncated(usize, usize),

    #[error("outer header is not IPv4: version nibble 0x{0:x}")]
    NotIpv4(u8),

    #[error("bad IPv4 header length field: {0} bytes")]
    BadHeaderLen(usize),

    #[error("bytes at offset {0} do not round-trip as an IPv4 address")]
    BadInnerAddress(usize),

    #[error("malformed hardware address {0:?}")]
    BadMac(String),
}

// ── Hardware addresses ───────────────────────────────────────────────────────

/// A 6-byte link-layer address with the canonical `aa:bb:cc:dd:ee:ff`
/// textual form. The peer directory stores the textual form; frames carry
/// the raw octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsBytes, FromBytes, FromZeroes)]
#[repr(transparent)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    pub const ZERO: MacAddr = MacAddr([0x00; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = WireError;

    /// Accepts `:` or `-` separated hex octets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split(|c| c == ':' || c == '-') {
            if count == 6 || part.len() != 2 {
                return Err(WireError::BadMac(s.to_string()));
            }
            octets[count] =
                u8::from_str_radix(part, 16).map_err(|_| WireError::BadMac(s.to_string()))?;
            count += 1;
        }
        if count != 6 {
            return Err(WireError::BadMac(s.to_string()));
        }
        Ok(MacAddr(octets))
    }
}

// ── Ethernet ─────────────────────────────────────────────────────────────────

/// Ethernet II header. Wire size: 14 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    /// Big-endian EtherType.
    pub ether_type: [u8; 2],
}

assert_eq_size!(EthernetHeader, [u8; 14]);

impl EthernetHeader {
    pub fn new(dst: MacAddr, src: MacAddr, ether_type: u16) -> Self {
        Self {
            dst,
            src,
            ether_type: ether_type.to_be_bytes(),
        }
    }

    pub fn ether_type(&self) -> u16 {
        u16::from_be_bytes(self.ether_type)
    }
}

/// Build a relay frame: 14-byte header followed by the captured payload,
/// verbatim and unmodified.
pub fn build_frame(dst: MacAddr, src: MacAddr, payload: &[u8]) -> Vec<u8> {
    let header = EthernetHeader::new(dst, src, ETHERTYPE_IPV4);
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

// ── IPv4 ─────────────────────────────────────────────────────────────────────

/// Fixed 20-byte IPv4 header, no options. Wire size: 20 bytes.
///
/// Multi-byte fields are stored as big-endian byte arrays; a packed struct
/// cannot hand out references to misaligned integers anyway.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub tos: u8,
    pub total_len: [u8; 2],
    pub id: [u8; 2],
    pub flags_frag: [u8; 2],
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

assert_eq_size!(Ipv4Header, [u8; 20]);

/// IP protocol number for ICMP.
pub const IPPROTO_ICMP: u8 = 1;

impl Ipv4Header {
    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src)
    }

    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst)
    }

    /// A minimal ICMP-carrying header for local re-injection. Total length,
    /// id and checksum are left zero — the kernel fills them on a raw
    /// IPPROTO_RAW socket.
    pub fn icmp_reinject(dst: Ipv4Addr, ttl: u8) -> Self {
        Self {
            version_ihl: 0x45,
            tos: 0,
            total_len: [0; 2],
            id: [0; 2],
            flags_frag: [0; 2],
            ttl,
            protocol: IPPROTO_ICMP,
            checksum: [0; 2],
            src: [0; 4],
            dst: dst.octets(),
        }
    }
}

/// Parse the outer IPv4 header of a captured payload and return the
/// address that generated the ICMP message.
pub fn outer_source(payload: &[u8]) -> Result<Ipv4Addr, WireError> {
    let header = Ipv4Header::read_from_prefix(payload)
        .ok_or(WireError::Truncated(payload.len(), OUTER_IPV4_HEADER_LEN))?;
    let version = header.version_ihl >> 4;
    if version != 4 {
        return Err(WireError::NotIpv4(version));
    }
    let ihl = ((header.version_ihl & 0x0f) as usize) * 4;
    if ihl < OUTER_IPV4_HEADER_LEN {
        return Err(WireError::BadHeaderLen(ihl));
    }
    Ok(header.source())
}

/// Pull the original packet's source and destination addresses out of a
/// captured payload (bytes 40..44 and 44..48). Diagnostic only: callers
/// must keep relaying when this fails.
pub fn inner_addrs(payload: &[u8]) -> Result<(Ipv4Addr, Ipv4Addr), WireError> {
    if payload.len() < INNER_ADDRS_END {
        return Err(WireError::Truncated(payload.len(), INNER_ADDRS_END));
    }
    let src = read_addr(payload, INNER_SRC_OFFSET)?;
    let dst = read_addr(payload, INNER_DST_OFFSET)?;
    Ok((src, dst))
}

fn read_addr(payload: &[u8], offset: usize) -> Result<Ipv4Addr, WireError> {
    let octets: [u8; 4] = payload[offset..offset + 4]
        .try_into()
        .map_err(|_| WireError::Truncated(payload.len(), offset + 4))?;
    let addr = Ipv4Addr::from(octets);
    // Reject anything that does not survive a textual round trip.
    if addr.to_string().parse::<Ipv4Addr>() != Ok(addr) {
        return Err(WireError::BadInnerAddress(offset));
    }
    Ok(addr)
}

// ── ARP ──────────────────────────────────────────────────────────────────────

pub const ARP_HW_ETHERNET: u16 = 1;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

/// ARP packet body for IPv4 over Ethernet. Wire size: 28 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ArpPacket {
    pub hardware_type: [u8; 2],
    pub protocol_type: [u8; 2],
    pub hardware_len: u8,
    pub protocol_len: u8,
    pub opcode: [u8; 2],
    pub sender_mac: MacAddr,
    pub sender_ip: [u8; 4],
    pub target_mac: MacAddr,
    pub target_ip: [u8; 4],
}

assert_eq_size!(ArpPacket, [u8; 28]);

impl ArpPacket {
    /// A who-has request for `target`, to be broadcast on the segment.
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target: Ipv4Addr) -> Self {
        Self {
            hardware_type: ARP_HW_ETHERNET.to_be_bytes(),
            protocol_type: ETHERTYPE_IPV4.to_be_bytes(),
            hardware_len: 6,
            protocol_len: 4,
            opcode: ARP_OP_REQUEST.to_be_bytes(),
            sender_mac,
            sender_ip: sender_ip.octets(),
            target_mac: MacAddr::ZERO,
            target_ip: target.octets(),
        }
    }

    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.opcode)
    }

    /// True if this is the reply that answers a request for `target`.
    pub fn answers(&self, target: Ipv4Addr) -> bool {
        self.opcode() == ARP_OP_REPLY && Ipv4Addr::from(self.sender_ip) == target
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal well-formed capture: outer IPv4 header, ICMP frag-needed
    /// header, inner IPv4 header with known addresses.
    fn sample_payload(inner_src: [u8; 4], inner_dst: [u8; 4]) -> Vec<u8> {
        let mut p = vec![0u8; 68];
        p[0] = 0x45; // version 4, IHL 5
        p[8] = 64; // ttl
        p[9] = IPPROTO_ICMP;
        p[12..16].copy_from_slice(&[10, 0, 0, 1]); // outer source
        p[16..20].copy_from_slice(&[10, 0, 0, 2]);
        p[20] = 3; // ICMP destination unreachable
        p[21] = 4; // fragmentation needed
        p[28] = 0x45; // inner IPv4 header
        p[INNER_SRC_OFFSET..INNER_DST_OFFSET].copy_from_slice(&inner_src);
        p[INNER_DST_OFFSET..INNER_ADDRS_END].copy_from_slice(&inner_dst);
        p
    }

    #[test]
    fn inner_addrs_round_trip() {
        let payload = sample_payload([192, 168, 1, 10], [172, 16, 0, 20]);
        let (src, dst) = inner_addrs(&payload).unwrap();
        assert_eq!(src, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(dst, Ipv4Addr::new(172, 16, 0, 20));
    }

    #[test]
    fn inner_addrs_rejects_short_payload() {
        let payload = sample_payload([1, 2, 3, 4], [5, 6, 7, 8]);
        assert_eq!(
            inner_addrs(&payload[..47]),
            Err(WireError::Truncated(47, INNER_ADDRS_END))
        );
        assert!(inner_addrs(&[]).is_err());
    }

    #[test]
    fn outer_source_reads_icmp_sender() {
        let payload = sample_payload([1, 1, 1, 1], [2, 2, 2, 2]);
        assert_eq!(outer_source(&payload).unwrap(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn outer_source_rejects_non_ipv4() {
        let mut payload = sample_payload([1, 1, 1, 1], [2, 2, 2, 2]);
        payload[0] = 0x65; // version 6
        assert_eq!(outer_source(&payload), Err(WireError::NotIpv4(6)));
    }

    #[test]
    fn outer_source_rejects_truncated() {
        assert_eq!(
            outer_source(&[0x45, 0, 0]),
            Err(WireError::Truncated(3, OUTER_IPV4_HEADER_LEN))
        );
    }

    #[test]
    fn mac_text_round_trip() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:0f".parse().unwrap();
        assert_eq!(mac.octets(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:0f");

        let dashed: MacAddr = "AA-BB-CC-00-11-22".parse().unwrap();
        assert_eq!(dashed.to_string(), "aa:bb:cc:00:11:22");
    }

    #[test]
    fn mac_rejects_malformed() {
        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("zz:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
        assert!("aabb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
    }

    #[test]
    fn frame_carries_payload_verbatim() {
        let payload = sample_payload([9, 9, 9, 9], [8, 8, 8, 8]);
        let dst: MacAddr = "aa:aa:aa:aa:aa:aa".parse().unwrap();
        let src: MacAddr = "bb:bb:bb:bb:bb:bb".parse().unwrap();

        let frame = build_frame(dst, src, &payload);
        assert_eq!(frame.len(), ETHERNET_HEADER_LEN + payload.len());
        assert_eq!(&frame[0..6], &dst.octets());
        assert_eq!(&frame[6..12], &src.octets());
        assert_eq!(&frame[12..14], &ETHERTYPE_IPV4.to_be_bytes());
        assert_eq!(&frame[ETHERNET_HEADER_LEN..], &payload[..]);
    }

    #[test]
    fn arp_request_layout() {
        let mac: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        let req = ArpPacket::request(
            mac,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        );
        let bytes = req.as_bytes();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..2], &[0, 1]); // ethernet
        assert_eq!(&bytes[2..4], &[0x08, 0x00]); // ipv4
        assert_eq!(&bytes[6..8], &[0, 1]); // request
        assert_eq!(&bytes[24..28], &[10, 0, 0, 2]);
    }

    #[test]
    fn arp_reply_matching() {
        let mut pkt = ArpPacket::request(
            MacAddr::ZERO,
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
        );
        pkt.opcode = ARP_OP_REPLY.to_be_bytes();
        assert!(pkt.answers(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(!pkt.answers(Ipv4Addr::new(10, 0, 0, 3)));

        pkt.opcode = ARP_OP_REQUEST.to_be_bytes();
        assert!(!pkt.answers(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
