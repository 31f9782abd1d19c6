use std::{
    fmt::{Display, Formatter},
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use ipnet::Ipv4Net;
use thiserror::Error;

use crate::ip::mac::MacAddr;

pub mod iproute2;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use iproute2::IpRoute2;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Couldn't run '{}'! {}", .0, .1)]
    Spawn(String, std::io::Error),
    #[error("'{}' failed ({})! {}", .command, .status, .stderr)]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("Couldn't parse the output of '{}'! {}", .0, .1)]
    Decode(String, serde_json::Error),
    #[error("Couldn't open network namespace '{}'! {}", .0.display(), .1)]
    Namespace(PathBuf, std::io::Error),
    #[error("Link '{}' doesn't exist!", .0)]
    LinkNotFound(String),
    #[error("Link '{}' is a {} device, expected {}!", .name, .actual, .expected)]
    WrongKind {
        name: String,
        expected: LinkKind,
        actual: LinkKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Vxlan,
    Veth,
    Other(String),
}

impl LinkKind {
    pub fn from_info_kind(kind: Option<&str>) -> Self {
        match kind {
            Some("bridge") => Self::Bridge,
            Some("vxlan") => Self::Vxlan,
            Some("veth") => Self::Veth,
            Some(other) => Self::Other(other.to_owned()),
            None => Self::Other("device".to_owned()),
        }
    }
}

impl Display for LinkKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkKind::Bridge => f.write_str("bridge"),
            LinkKind::Vxlan => f.write_str("vxlan"),
            LinkKind::Veth => f.write_str("veth"),
            LinkKind::Other(kind) => f.write_str(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub index: u32,
    pub mac: Option<MacAddr>,
    pub kind: LinkKind,
    pub mtu: u32,
}

impl Link {
    pub fn expect_kind(self, expected: LinkKind) -> Result<Self, DeviceError> {
        if self.kind != expected {
            return Err(DeviceError::WrongKind {
                name: self.name,
                expected,
                actual: self.kind,
            });
        }

        Ok(self)
    }
}

/// A handle to a container network namespace, identified by its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetNs {
    path: PathBuf,
}

impl NetNs {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        fs::metadata(path).map_err(|err| DeviceError::Namespace(path.to_owned(), err))?;

        Ok(Self {
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    Host,
    Namespace(&'a NetNs),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanSpec {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    pub mtu: u32,
    pub underlay: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    /// `None` stands for the default route.
    pub destination: Option<Ipv4Net>,
    pub via: Ipv4Addr,
    pub device: String,
    pub onlink: bool,
}

impl Route {
    pub fn default_via(via: Ipv4Addr, device: &str) -> Self {
        Self {
            destination: None,
            via,
            device: device.to_owned(),
            onlink: false,
        }
    }

    pub fn onlink(destination: Ipv4Net, via: Ipv4Addr, device: &str) -> Self {
        Self {
            destination: Some(destination),
            via,
            device: device.to_owned(),
            onlink: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub interface: String,
    pub address: Ipv4Net,
}

/// Everything the plugin and the agent need from the kernel's networking
/// stack. Deletions tolerate missing objects, additions have replace
/// semantics unless stated otherwise.
pub trait DeviceControlPlane {
    fn link(&self, scope: Scope, name: &str) -> Result<Option<Link>, DeviceError>;

    /// Returns the existing bridge or creates it. An existing device of a
    /// different kind is an error.
    fn ensure_bridge(&self, name: &str, mtu: u32) -> Result<Link, DeviceError>;

    fn ensure_vxlan(&self, spec: &VxlanSpec) -> Result<Link, DeviceError>;

    fn create_veth_pair(
        &self,
        netns: &NetNs,
        name: &str,
        peer_name: &str,
        mtu: u32,
    ) -> Result<(), DeviceError>;

    /// Moves a link out of `netns` into the host namespace.
    fn move_to_host(&self, netns: &NetNs, name: &str) -> Result<(), DeviceError>;

    fn assign_address(&self, scope: Scope, name: &str, address: Ipv4Net)
        -> Result<(), DeviceError>;

    fn set_up(&self, scope: Scope, name: &str) -> Result<(), DeviceError>;

    fn set_master(&self, name: &str, master: &str) -> Result<(), DeviceError>;

    /// Returns `false` when there was nothing to delete.
    fn delete_link(&self, scope: Scope, name: &str) -> Result<bool, DeviceError>;

    fn replace_route(&self, scope: Scope, route: &Route) -> Result<(), DeviceError>;

    fn delete_route(&self, scope: Scope, route: &Route) -> Result<(), DeviceError>;

    fn append_fdb(&self, device: &str, mac: MacAddr, destination: Ipv4Addr)
        -> Result<(), DeviceError>;

    fn delete_fdb(&self, device: &str, mac: MacAddr, destination: Ipv4Addr)
        -> Result<(), DeviceError>;

    fn replace_neighbour(&self, device: &str, address: Ipv4Addr, mac: MacAddr)
        -> Result<(), DeviceError>;

    fn delete_neighbour(&self, device: &str, address: Ipv4Addr) -> Result<(), DeviceError>;

    /// Installs a source NAT rule rewriting traffic from `source` that leaves
    /// through `out_device` to `to_source`, unless it's already present.
    fn ensure_snat(
        &self,
        source: Ipv4Net,
        out_device: &str,
        to_source: Ipv4Addr,
    ) -> Result<(), DeviceError>;

    fn host_addresses(&self) -> Result<Vec<HostAddress>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::{DeviceError, LinkKind, NetNs};

    #[test]
    fn opening_missing_namespace_fails() {
        assert!(matches!(
            NetNs::open("/nonexistent/netns/path"),
            Err(DeviceError::Namespace(..))
        ));
    }

    #[test]
    fn unknown_kinds_are_kept_verbatim() {
        assert_eq!(LinkKind::from_info_kind(Some("vxlan")), LinkKind::Vxlan);
        assert_eq!(
            LinkKind::from_info_kind(Some("dummy")).to_string(),
            "dummy"
        );
    }
}
