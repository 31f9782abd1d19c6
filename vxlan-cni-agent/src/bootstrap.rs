use std::{net::Ipv4Addr, path::Path};

use ipnet::Ipv4Net;
use log::{debug, info};
use vxlan_cni_core::{
    config::{NetworkConfig, OverlaySettings},
    devices::{DeviceControlPlane, HostAddress, Scope, VxlanSpec},
    directory::{ClusterDirectory, MemberRecord},
    identity::OverlayIdentity,
    ip::{mac::MacAddr, Subnet},
};

use crate::error::BootstrapError;

/// The local end of the overlay as set up by a successful bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOverlay {
    pub member: String,
    pub subnet: Subnet,
    pub identity: OverlayIdentity,
    pub underlay_interface: String,
    pub vxlan_name: String,
}

pub struct Bootstrapper<'a, D, C> {
    pub devices: &'a D,
    pub directory: &'a C,
    pub settings: &'a OverlaySettings,
    pub cni_config_path: &'a Path,
}

impl<'a, D, C> Bootstrapper<'a, D, C>
where
    D: DeviceControlPlane,
    C: ClusterDirectory,
{
    /// Brings this node's side of the overlay up. Every step is idempotent,
    /// so a failed pass can simply be run again.
    pub async fn run(&self) -> Result<NodeOverlay, BootstrapError> {
        let members = self.directory.list_members().await?;
        let host_addresses = self.devices.host_addresses()?;
        let (member, underlay) = find_self(&members, &host_addresses)?;

        let subnet = member
            .subnet()?
            .ok_or_else(|| BootstrapError::MissingPodCidr(member.name.clone()))?;
        let host_address = underlay.address.addr();
        info!(
            "Bootstrapping '{}' ({host_address} on {}) with pod subnet {subnet}",
            member.name, underlay.interface
        );

        self.ensure_bridge(&subnet)?;
        let mac = self.ensure_vxlan(&subnet, &underlay.interface)?;

        let identity = OverlayIdentity {
            overlay_address: subnet.network(),
            mac,
            host_address,
        };
        self.directory
            .publish_identity(&member.name, &identity)
            .await?;

        NetworkConfig::for_subnet(subnet, self.settings).write_to(self.cni_config_path)?;

        self.devices
            .ensure_snat(subnet.net(), &underlay.interface, host_address)?;

        info!("Node '{}' joined the overlay", member.name);

        Ok(NodeOverlay {
            member: member.name.clone(),
            subnet,
            identity,
            underlay_interface: underlay.interface.clone(),
            vxlan_name: self.settings.vxlan_name.clone(),
        })
    }

    fn ensure_bridge(&self, subnet: &Subnet) -> Result<(), BootstrapError> {
        let name = &self.settings.bridge_name;

        self.devices.ensure_bridge(name, self.settings.pod_mtu)?;
        self.devices
            .assign_address(Scope::Host, name, subnet.gateway())?;
        self.devices.set_up(Scope::Host, name)?;
        debug!("Bridge '{name}' is up with {}", subnet.gateway());

        Ok(())
    }

    fn ensure_vxlan(
        &self,
        subnet: &Subnet,
        underlay: &str,
    ) -> Result<MacAddr, BootstrapError> {
        let name = &self.settings.vxlan_name;
        let vxlan = self.devices.ensure_vxlan(&VxlanSpec {
            name: name.clone(),
            vni: self.settings.vxlan_id,
            port: self.settings.vxlan_port,
            mtu: self.settings.vxlan_mtu,
            underlay: Some(underlay.to_owned()),
        })?;

        let overlay_address = host_route(subnet.network());
        self.devices
            .assign_address(Scope::Host, name, overlay_address)?;
        self.devices.set_up(Scope::Host, name)?;
        debug!("VXLAN device '{name}' is up with {overlay_address}");

        vxlan
            .mac
            .ok_or_else(|| BootstrapError::MissingMac(name.clone()))
    }
}

fn host_route(address: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(address)
}

/// Finds the member this host is, by matching the member's internal
/// addresses against the addresses configured on local interfaces.
fn find_self<'m, 'h>(
    members: &'m [MemberRecord],
    host_addresses: &'h [HostAddress],
) -> Result<(&'m MemberRecord, &'h HostAddress), BootstrapError> {
    members
        .iter()
        .find_map(|member| {
            host_addresses
                .iter()
                .find(|host| member.internal_addresses.contains(&host.address.addr()))
                .map(|host| (member, host))
        })
        .ok_or_else(|| {
            BootstrapError::NoMatchingMember(
                host_addresses
                    .iter()
                    .map(|host| host.address.addr())
                    .collect(),
            )
        })
}
