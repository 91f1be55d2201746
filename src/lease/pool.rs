use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{EdgeError, EdgeResult};

/// A group's IPv4 address pool.
///
/// The network address, the broadcast address and every address whose final
/// octet is 0 or 255 are reserved and never leased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool {
    net: Ipv4Net,
}

impl Pool {
    /// Parse a CIDR block. Host bits are cleared, so `10.0.0.7/24` yields the
    /// same pool as `10.0.0.0/24`.
    pub fn parse(cidr: &str) -> EdgeResult<Self> {
        let cidr = cidr.trim();
        if cidr.is_empty() {
            return Err(EdgeError::PoolMisconfigured(
                "no IP pool configured".to_string(),
            ));
        }

        let net: Ipv4Net = cidr.parse().map_err(|_| {
            EdgeError::PoolMisconfigured(format!("'{}' is not an IPv4 CIDR block", cidr))
        })?;

        Ok(Self { net: net.trunc() })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.net.network()
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.net.broadcast()
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.net.netmask()
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.net.contains(&addr)
    }

    pub fn is_reserved(&self, addr: Ipv4Addr) -> bool {
        let last_octet = addr.octets()[3];
        addr == self.network() || addr == self.broadcast() || last_octet == 0 || last_octet == 255
    }

    /// Leasable addresses in ascending order, starting from the network address.
    pub fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let start = u32::from(self.network());
        let end = u32::from(self.broadcast());
        (start..=end)
            .map(Ipv4Addr::from)
            .filter(move |addr| !self.is_reserved(*addr))
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}
