//! Replication interface selection.
//!
//! The relay interface is picked from a configured candidate list and
//! must carry the expected MTU; a mismatched MTU would let the relay
//! advertise path limits the interface cannot honor.

use std::fs;
use std::io;
use std::net::Ipv4Addr;

use pmtud_core::wire::MacAddr;

/// Resolved properties of the interface frames are relayed on.
#[derive(Debug, Clone)]
pub struct ReplicationInterface {
    pub name: String,
    pub index: u32,
    pub mac: MacAddr,
    pub mtu: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum NetifError {
    #[error("no interface in {0:?} is up with MTU {1}")]
    NoMatch(Vec<String>, u32),
    #[error("interface {0:?} not found")]
    NotFound(String),
    #[error("interface {0:?} reports malformed hardware address {1:?}")]
    BadMac(String, String),
    #[error("interface {0:?} has no usable IPv4 address")]
    NoIpv4(String),
    #[error("no default route in the kernel routing table")]
    NoDefaultRoute,
    #[error("reading {0}: {1}")]
    Io(String, #[source] io::Error),
}

/// Looks up one interface by name.
pub fn lookup(name: &str) -> Result<ReplicationInterface, NetifError> {
    let index =
        nix::net::if_::if_nametoindex(name).map_err(|_| NetifError::NotFound(name.to_string()))?;
    let mtu_text = read_sys_attr(name, "mtu")?;
    let mtu = mtu_text
        .parse::<u32>()
        .map_err(|_| NetifError::Io(format!("/sys/class/net/{name}/mtu"), io::Error::other("not a number")))?;
    let mac_text = read_sys_attr(name, "address")?;
    let mac = mac_text
        .parse::<MacAddr>()
        .map_err(|_| NetifError::BadMac(name.to_string(), mac_text.clone()))?;
    Ok(ReplicationInterface {
        name: name.to_string(),
        index,
        mac,
        mtu,
    })
}

/// Scans the candidate names in order and returns the first interface
/// that exists and carries exactly `required_mtu`.
pub fn find_replication_interface(
    candidates: &[String],
    required_mtu: u32,
) -> Result<ReplicationInterface, NetifError> {
    for name in candidates {
        match lookup(name) {
            Ok(iface) if iface.mtu == required_mtu => return Ok(iface),
            Ok(iface) => {
                tracing::debug!(iface = %iface.name, mtu = iface.mtu, "candidate rejected on MTU");
            }
            Err(_) => {}
        }
    }
    Err(NetifError::NoMatch(candidates.to_vec(), required_mtu))
}

/// First non-loopback IPv4 address assigned to `name`.
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr, NetifError> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| NetifError::Io("getifaddrs".to_string(), io::Error::from(e)))?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            let ip = sin.ip();
            if !ip.is_loopback() {
                return Ok(ip);
            }
        }
    }
    Err(NetifError::NoIpv4(name.to_string()))
}

/// Name of the interface the default route leaves through.
pub fn default_route_interface() -> Result<String, NetifError> {
    let table = fs::read_to_string("/proc/net/route")
        .map_err(|e| NetifError::Io("/proc/net/route".to_string(), e))?;
    parse_default_route(&table).ok_or(NetifError::NoDefaultRoute)
}

fn read_sys_attr(name: &str, attr: &str) -> Result<String, NetifError> {
    let path = format!("/sys/class/net/{name}/{attr}");
    let text = fs::read_to_string(&path).map_err(|e| NetifError::Io(path, e))?;
    Ok(text.trim().to_string())
}

// One line per route; the destination column is hex, all-zero meaning
// the default route.
fn parse_default_route(table: &str) -> Option<String> {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        if fields[1] == "00000000" {
            return Some(fields[0].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTE_TABLE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth1\t0000A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0
eth0\t00000000\t010AA8C0\t0003\t0\t0\t0\t00000000\t0\t0\t0
";

    #[test]
    fn default_route_is_found() {
        assert_eq!(parse_default_route(ROUTE_TABLE).as_deref(), Some("eth0"));
    }

    #[test]
    fn table_without_default_route() {
        let table = "Iface\tDestination\nlo\t0000007F\n";
        assert_eq!(parse_default_route(table), None);
    }

    #[test]
    fn loopback_lookup_reads_sysfs() {
        let iface = lookup("lo").unwrap();
        assert_eq!(iface.name, "lo");
        assert!(iface.index > 0);
        assert_eq!(iface.mac, MacAddr::ZERO);
    }

    #[test]
    fn missing_interface_is_an_error() {
        assert!(matches!(
            lookup("definitely-not-here0"),
            Err(NetifError::NotFound(_))
        ));
    }
}
