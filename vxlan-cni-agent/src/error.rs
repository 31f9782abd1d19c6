use std::net::Ipv4Addr;

use thiserror::Error;
use vxlan_cni_core::{config::ConfigError, devices::DeviceError, directory::DirectoryError};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("None of this host's addresses {:?} belongs to a cluster member!", .0)]
    NoMatchingMember(Vec<Ipv4Addr>),
    #[error("Member '{}' has no pod CIDR assigned yet!", .0)]
    MissingPodCidr(String),
    #[error("VXLAN device '{}' has no MAC address!", .0)]
    MissingMac(String),
    #[error("Couldn't query the cluster directory! {}", .0)]
    Directory(#[from] DirectoryError),
    #[error("Couldn't configure the node's devices! {}", .0)]
    Device(#[from] DeviceError),
    #[error("Couldn't write the CNI configuration! {}", .0)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Refusing to touch the mesh, peer data is invalid! {}", .0)]
    InvalidPeer(DirectoryError),
    #[error("Couldn't update the forwarding entries! {}", .0)]
    Device(#[from] DeviceError),
}
