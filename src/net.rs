//! Local network evidence.
//!
//! Answers "which addresses does this machine own" without consulting any
//! stored configuration.  Only IPv4 addresses on up, non-loopback
//! interfaces count: loopback cannot tell members apart and consensus
//! traffic is bound on IPv4.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use tracing::debug;

use crate::errors::{BackstopError, Result};

/// One address on one interface, as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    pub addr: Option<IpAddr>,
}

/// Source of "what am I" evidence for survivor resolution.
pub trait AddressSource: Send + Sync {
    /// Every external IPv4 address of this machine.
    fn external_addresses(&self) -> Result<BTreeSet<String>>;
}

/// Addresses of the interfaces on the running machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalInterfaces;

impl AddressSource for LocalInterfaces {
    fn external_addresses(&self) -> Result<BTreeSet<String>> {
        let ifaces = interfaces().map_err(|e| BackstopError::io("network interfaces", e))?;
        external_ipv4(&ifaces)
    }
}

/// Reduce an interface listing to external IPv4 addresses.
pub fn external_ipv4(ifaces: &[InterfaceAddr]) -> Result<BTreeSet<String>> {
    let mut addresses = BTreeSet::new();
    for iface in ifaces {
        if !iface.up || iface.loopback {
            continue;
        }
        let Some(ip) = iface.addr else { continue };
        if let Some(v4) = as_ipv4(ip) {
            if !v4.is_loopback() {
                debug!(interface = %iface.name, address = %v4, "external address");
                addresses.insert(v4.to_string());
            }
        }
    }
    if addresses.is_empty() {
        return Err(BackstopError::not_found("external IPv4 address"));
    }
    Ok(addresses)
}

fn as_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Enumerate interface addresses with `getifaddrs(3)`.
#[cfg(unix)]
pub fn interfaces() -> std::io::Result<Vec<InterfaceAddr>> {
    use nix::net::if_::InterfaceFlags;

    let addrs = nix::ifaddrs::getifaddrs().map_err(std::io::Error::from)?;
    Ok(addrs
        .map(|ifa| InterfaceAddr {
            up: ifa.flags.contains(InterfaceFlags::IFF_UP),
            loopback: ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK),
            addr: ifa.address.as_ref().and_then(storage_ip),
            name: ifa.interface_name,
        })
        .collect())
}

#[cfg(not(unix))]
pub fn interfaces() -> std::io::Result<Vec<InterfaceAddr>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "interface enumeration is only supported on unix",
    ))
}

#[cfg(unix)]
fn storage_ip(storage: &nix::sys::socket::SockaddrStorage) -> Option<IpAddr> {
    use std::net::{SocketAddrV4, SocketAddrV6};

    if let Some(sin) = storage.as_sockaddr_in() {
        return Some(IpAddr::V4(*SocketAddrV4::from(*sin).ip()));
    }
    storage
        .as_sockaddr_in6()
        .map(|sin6| IpAddr::V6(*SocketAddrV6::from(*sin6).ip()))
}
