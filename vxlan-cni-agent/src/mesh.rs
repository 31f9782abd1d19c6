use std::collections::BTreeMap;

use log::{debug, info};
use vxlan_cni_core::{
    devices::{DeviceControlPlane, Route, Scope},
    directory::MemberRecord,
    identity::OverlayIdentity,
    ip::Subnet,
};

use crate::error::MeshError;

/// Another node of the overlay, as far as the forwarding entries care.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub subnet: Subnet,
    pub identity: OverlayIdentity,
}

impl Peer {
    fn route(&self, vxlan_name: &str) -> Route {
        Route::onlink(
            self.subnet.net(),
            self.identity.overlay_address,
            vxlan_name,
        )
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MeshChanges {
    pub installed: usize,
    pub removed: usize,
    pub pending: usize,
}

impl MeshChanges {
    pub fn is_empty(&self) -> bool {
        self.installed == 0 && self.removed == 0
    }
}

/// Parses every peer before anything is touched, so a single malformed
/// member fails the whole pass. Members without a subnet or without a
/// published identity are still joining and are reported as pending.
pub fn collect_peers(
    members: &[MemberRecord],
    self_name: &str,
) -> Result<(BTreeMap<String, Peer>, usize), MeshError> {
    let mut peers = BTreeMap::new();
    let mut pending = 0;

    for member in members.iter().filter(|member| member.name != self_name) {
        let subnet = member.subnet().map_err(MeshError::InvalidPeer)?;
        let identity = member.identity().map_err(MeshError::InvalidPeer)?;

        match (subnet, identity) {
            (Some(subnet), Some(identity)) => {
                peers.insert(
                    member.name.clone(),
                    Peer {
                        name: member.name.clone(),
                        subnet,
                        identity,
                    },
                );
            }
            _ => {
                debug!("Peer '{}' hasn't joined the overlay yet", member.name);
                pending += 1;
            }
        }
    }

    Ok((peers, pending))
}

/// Keeps the VXLAN forwarding database, the neighbour table and the routes
/// in line with the set of peers.
pub struct MeshReconciler<'a, D> {
    devices: &'a D,
    vxlan_name: String,
    self_name: String,
    installed: BTreeMap<String, Peer>,
}

impl<'a, D: DeviceControlPlane> MeshReconciler<'a, D> {
    pub fn new(devices: &'a D, vxlan_name: &str, self_name: &str) -> Self {
        Self {
            devices,
            vxlan_name: vxlan_name.to_owned(),
            self_name: self_name.to_owned(),
            installed: BTreeMap::new(),
        }
    }

    pub fn installed(&self) -> impl Iterator<Item = &Peer> {
        self.installed.values()
    }

    pub fn reconcile(&mut self, members: &[MemberRecord]) -> Result<MeshChanges, MeshError> {
        let (desired, pending) = collect_peers(members, &self.self_name)?;
        let mut changes = MeshChanges {
            pending,
            ..Default::default()
        };

        let outdated = self
            .installed
            .iter()
            .filter(|(name, peer)| desired.get(*name) != Some(*peer))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();

        for name in outdated {
            if let Some(peer) = self.installed.get(&name) {
                self.remove(peer)?;
            }
            self.installed.remove(&name);
            changes.removed += 1;
        }

        for (name, peer) in desired {
            if self.installed.contains_key(&name) {
                continue;
            }

            self.install(&peer)?;
            self.installed.insert(name, peer);
            changes.installed += 1;
        }

        Ok(changes)
    }

    fn install(&self, peer: &Peer) -> Result<(), MeshError> {
        let identity = &peer.identity;
        info!(
            "Adding peer '{}' ({} via {})",
            peer.name, peer.subnet, identity.host_address
        );

        self.devices
            .append_fdb(&self.vxlan_name, identity.mac, identity.host_address)?;
        self.devices
            .replace_neighbour(&self.vxlan_name, identity.overlay_address, identity.mac)?;
        self.devices
            .replace_route(Scope::Host, &peer.route(&self.vxlan_name))?;

        Ok(())
    }

    fn remove(&self, peer: &Peer) -> Result<(), MeshError> {
        let identity = &peer.identity;
        info!("Removing peer '{}' ({})", peer.name, peer.subnet);

        self.devices
            .delete_route(Scope::Host, &peer.route(&self.vxlan_name))?;
        self.devices
            .delete_neighbour(&self.vxlan_name, identity.overlay_address)?;
        self.devices
            .delete_fdb(&self.vxlan_name, identity.mac, identity.host_address)?;

        Ok(())
    }
}
