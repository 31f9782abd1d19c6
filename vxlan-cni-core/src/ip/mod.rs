use std::{
    fmt::{Display, Formatter},
    net::Ipv4Addr,
    str::FromStr,
};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mac;

#[derive(Debug, Error)]
pub enum SubnetError {
    #[error("Couldn't parse '{}' as an IPv4 CIDR!", .0)]
    Invalid(String),
}

/// A pod subnet assigned to exactly one cluster member.
///
/// The network address doubles as the node's VXLAN endpoint address, the
/// first host address is the bridge gateway and containers are leased
/// addresses from the remaining range, excluding the broadcast address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet(Ipv4Net);

impl Subnet {
    pub fn net(&self) -> Ipv4Net {
        self.0.trunc()
    }

    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    pub fn network(&self) -> Ipv4Addr {
        self.0.network()
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.0.broadcast()
    }

    pub fn gateway(&self) -> Ipv4Net {
        self.with_prefix(offset(self.network(), 1))
    }

    /// Network address with the original prefix. Bind it as a /32 when it
    /// lands on the VXLAN device.
    pub fn overlay_address(&self) -> Ipv4Net {
        self.with_prefix(self.network())
    }

    pub fn with_prefix(&self, address: Ipv4Addr) -> Ipv4Net {
        // prefix_len comes from a valid Ipv4Net
        Ipv4Net::new(address, self.prefix_len()).unwrap_or(self.0)
    }

    pub fn pool(&self) -> PoolIter {
        PoolIter {
            next: u32::from(self.network()).saturating_add(2),
            end: u32::from(self.broadcast()),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool().len()
    }
}

fn offset(address: Ipv4Addr, by: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(address).saturating_add(by))
}

/// Walks the allocatable range `[gateway + 1, broadcast)` in ascending order.
#[derive(Debug, Clone)]
pub struct PoolIter {
    next: u32,
    end: u32,
}

impl Iterator for PoolIter {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }

        let address = Ipv4Addr::from(self.next);
        self.next += 1;

        Some(address)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.next) as usize;

        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PoolIter {}

impl Display for Subnet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Subnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<Ipv4Net>()
            .map(|net| Self(net.trunc()))
            .map_err(|_| SubnetError::Invalid(s.to_owned()))
    }
}

impl TryFrom<String> for Subnet {
    type Error = SubnetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(value: Subnet) -> Self {
        value.to_string()
    }
}

impl From<Ipv4Net> for Subnet {
    fn from(value: Ipv4Net) -> Self {
        Self(value.trunc())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::Subnet;

    #[test]
    fn derives_gateway_and_overlay_address() {
        let subnet: Subnet = "10.244.1.0/24".parse().unwrap();

        assert_eq!(subnet.gateway().to_string(), "10.244.1.1/24");
        assert_eq!(subnet.overlay_address().to_string(), "10.244.1.0/24");
    }

    #[test]
    fn host_bits_are_truncated_on_parse() {
        let subnet: Subnet = "10.244.1.77/24".parse().unwrap();

        assert_eq!(subnet.network(), Ipv4Addr::new(10, 244, 1, 0));
        assert_eq!(subnet.gateway().to_string(), "10.244.1.1/24");
    }

    #[test]
    fn pool_excludes_network_gateway_and_broadcast() {
        let subnet: Subnet = "10.244.1.0/24".parse().unwrap();
        let pool = subnet.pool().collect::<Vec<_>>();

        assert_eq!(pool.len(), 253);
        assert_eq!(subnet.pool_size(), 253);
        assert_eq!(pool.first(), Some(&Ipv4Addr::new(10, 244, 1, 2)));
        assert_eq!(pool.last(), Some(&Ipv4Addr::new(10, 244, 1, 254)));
    }

    #[test]
    fn pool_carries_across_octets() {
        let subnet: Subnet = "10.244.0.0/23".parse().unwrap();
        let pool = subnet.pool().collect::<Vec<_>>();

        assert!(pool.contains(&Ipv4Addr::new(10, 244, 0, 255)));
        assert!(pool.contains(&Ipv4Addr::new(10, 244, 1, 0)));
        assert_eq!(pool.last(), Some(&Ipv4Addr::new(10, 244, 1, 254)));
    }

    #[test]
    fn tiny_subnets_have_empty_pools() {
        for raw in ["10.0.0.0/31", "10.0.0.4/32", "255.255.255.255/32"] {
            let subnet: Subnet = raw.parse().unwrap();

            assert_eq!(subnet.pool().count(), 0, "{raw}");
        }

        let subnet: Subnet = "10.0.0.0/30".parse().unwrap();
        assert_eq!(subnet.pool().collect::<Vec<_>>(), vec![Ipv4Addr::new(10, 0, 0, 2)]);
    }

    #[test]
    fn rejects_malformed_cidrs() {
        assert!("10.244.1.0".parse::<Subnet>().is_err());
        assert!("10.244.1.0/33".parse::<Subnet>().is_err());
        assert!("fd00::/64".parse::<Subnet>().is_err());
        assert!("".parse::<Subnet>().is_err());
    }
}
