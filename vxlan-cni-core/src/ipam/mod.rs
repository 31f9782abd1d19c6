use std::{
    collections::{BTreeSet, HashSet},
    net::Ipv4Addr,
};

use ipnet::Ipv4Net;
use thiserror::Error;

use crate::ip::Subnet;

pub mod lock;
pub mod store;

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("The IP range of {} was exhausted!", .0)]
    RangeExhausted(Subnet),
}

pub trait LeaseIndex {
    fn is_leased(&self, address: &Ipv4Addr) -> bool;
}

impl LeaseIndex for BTreeSet<Ipv4Addr> {
    fn is_leased(&self, address: &Ipv4Addr) -> bool {
        self.contains(address)
    }
}

impl LeaseIndex for HashSet<Ipv4Addr> {
    fn is_leased(&self, address: &Ipv4Addr) -> bool {
        self.contains(address)
    }
}

/// Picks the lowest pool address not present in the index.
///
/// Nothing is reserved here, the caller has to commit the lease while still
/// holding the host lock.
pub fn allocate(subnet: &Subnet, index: &impl LeaseIndex) -> Result<Ipv4Net, IpamError> {
    subnet
        .pool()
        .find(|address| !index.is_leased(address))
        .map(|address| subnet.with_prefix(address))
        .ok_or(IpamError::RangeExhausted(*subnet))
}
