use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use if_addrs::get_if_addrs;

/// Convenience wrapper so builders accept addresses in several shapes.
pub struct IpAddress(pub(crate) IpAddr);

impl From<IpAddr> for IpAddress {
    fn from(ip: IpAddr) -> Self {
        IpAddress(ip)
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(ip: Ipv4Addr) -> Self {
        IpAddress(IpAddr::V4(ip))
    }
}

impl From<&str> for IpAddress {
    fn from(s: &str) -> Self {
        IpAddress(IpAddr::from_str(s).unwrap_or_else(|_| IpAddr::V4(Ipv4Addr::LOCALHOST)))
    }
}

/// First private IPv4 address on any non-loopback interface. Used when
/// the node is bound to the wildcard address and must advertise
/// something routable.
pub(crate) fn find_private_ip() -> Result<IpAddr> {
    let interfaces = get_if_addrs()?;
    for iface in interfaces {
        if iface.is_loopback() {
            continue;
        }
        let ip = iface.addr.ip();
        if is_private(&ip) {
            return Ok(ip);
        }
    }
    Err(anyhow!("no private IP address found on any interface"))
}

pub(crate) fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}
