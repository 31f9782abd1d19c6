use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use ipnet::Ipv4Net;

use crate::ip::mac::MacAddr;

use super::{
    DeviceControlPlane, DeviceError, HostAddress, Link, LinkKind, NetNs, Route, Scope, VxlanSpec,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    pub link: Link,
    pub addresses: Vec<Ipv4Net>,
    pub up: bool,
    pub master: Option<String>,
    pub peer: Option<String>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub host: BTreeMap<String, FakeLink>,
    pub namespaces: BTreeMap<PathBuf, BTreeMap<String, FakeLink>>,
    pub host_routes: BTreeSet<Route>,
    pub namespace_routes: BTreeMap<PathBuf, BTreeSet<Route>>,
    pub fdb: BTreeSet<(String, MacAddr, Ipv4Addr)>,
    pub neighbours: BTreeMap<(String, Ipv4Addr), MacAddr>,
    pub snat_rules: BTreeSet<(Ipv4Net, String, Ipv4Addr)>,
    pub host_addresses: Vec<HostAddress>,
    pub journal: Vec<String>,
    pub fail_on: Option<String>,
    next_index: u32,
}

impl FakeState {
    fn links_mut(&mut self, scope: Scope) -> &mut BTreeMap<String, FakeLink> {
        match scope {
            Scope::Host => &mut self.host,
            Scope::Namespace(netns) => self
                .namespaces
                .entry(netns.path().to_owned())
                .or_default(),
        }
    }

    fn routes_mut(&mut self, scope: Scope) -> &mut BTreeSet<Route> {
        match scope {
            Scope::Host => &mut self.host_routes,
            Scope::Namespace(netns) => self
                .namespace_routes
                .entry(netns.path().to_owned())
                .or_default(),
        }
    }

    fn new_link(&mut self, name: &str, kind: LinkKind, mtu: u32) -> FakeLink {
        self.next_index += 1;
        let index = self.next_index;

        FakeLink {
            link: Link {
                name: name.to_owned(),
                index,
                mac: Some(MacAddr::new([0x0a, 0x58, 0, 0, (index >> 8) as u8, index as u8])),
                kind,
                mtu,
            },
            addresses: Vec::new(),
            up: false,
            master: None,
            peer: None,
        }
    }

    fn remove_link(&mut self, scope: Scope, name: &str) -> bool {
        let Some(removed) = self.links_mut(scope).remove(name) else {
            return false;
        };

        // a veth pair lives and dies together, wherever the other end is
        if let Some(peer) = removed.peer {
            self.host.remove(&peer);
            for links in self.namespaces.values_mut() {
                links.remove(&peer);
            }
        }

        true
    }
}

/// An in-memory device control plane that records every mutating call and
/// can be told to fail a given operation.
#[derive(Debug, Default)]
pub struct FakeDevices {
    state: Mutex<FakeState>,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host_address(self, interface: &str, address: &str) -> Self {
        {
            let mut state = self.state();
            let fake_link = state.new_link(interface, LinkKind::Other("device".to_owned()), 1500);
            state.host.insert(interface.to_owned(), fake_link);
            state.host_addresses.push(HostAddress {
                interface: interface.to_owned(),
                address: address.parse().expect("invalid test address"),
            });
        }

        self
    }

    pub fn with_link(self, name: &str, kind: LinkKind) -> Self {
        {
            let mut state = self.state();
            let fake_link = state.new_link(name, kind, 1500);
            state.host.insert(name.to_owned(), fake_link);
        }

        self
    }

    /// Makes every following call of `operation` fail.
    pub fn fail_on(&self, operation: &str) {
        self.state().fail_on = Some(operation.to_owned());
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn host_link(&self, name: &str) -> Option<FakeLink> {
        self.state().host.get(name).cloned()
    }

    pub fn namespace_link(&self, netns: &NetNs, name: &str) -> Option<FakeLink> {
        self.state()
            .namespaces
            .get(netns.path())
            .and_then(|links| links.get(name))
            .cloned()
    }

    pub fn host_link_names(&self) -> Vec<String> {
        self.state().host.keys().cloned().collect()
    }

    pub fn namespace_routes(&self, netns: &NetNs) -> Vec<Route> {
        self.state()
            .namespace_routes
            .get(netns.path())
            .map(|routes| routes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn journal(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    fn record(&self, operation: &str, details: String) -> Result<MutexGuard<'_, FakeState>, DeviceError> {
        let mut state = self.state();
        state.journal.push(format!("{operation} {details}"));

        if state.fail_on.as_deref() == Some(operation) {
            return Err(DeviceError::Command {
                command: format!("{operation} {details}"),
                status: "exit status: 2".to_owned(),
                stderr: "RTNETLINK answers: Operation not permitted".to_owned(),
            });
        }

        Ok(state)
    }
}

fn describe_scope(scope: Scope) -> String {
    match scope {
        Scope::Host => "host".to_owned(),
        Scope::Namespace(netns) => netns.path().display().to_string(),
    }
}

impl DeviceControlPlane for FakeDevices {
    fn link(&self, scope: Scope, name: &str) -> Result<Option<Link>, DeviceError> {
        let mut state = self.state();

        Ok(state.links_mut(scope).get(name).map(|fake| fake.link.clone()))
    }

    fn ensure_bridge(&self, name: &str, mtu: u32) -> Result<Link, DeviceError> {
        let mut state = self.record("ensure_bridge", name.to_owned())?;

        if let Some(existing) = state.host.get_mut(name) {
            existing.link.mtu = mtu;
            return existing.link.clone().expect_kind(LinkKind::Bridge);
        }

        let bridge = state.new_link(name, LinkKind::Bridge, mtu);
        state.host.insert(name.to_owned(), bridge.clone());

        Ok(bridge.link)
    }

    fn ensure_vxlan(&self, spec: &VxlanSpec) -> Result<Link, DeviceError> {
        let mut state = self.record("ensure_vxlan", spec.name.clone())?;

        if let Some(existing) = state.host.get(&spec.name) {
            return existing.link.clone().expect_kind(LinkKind::Vxlan);
        }

        let vxlan = state.new_link(&spec.name, LinkKind::Vxlan, spec.mtu);
        state.host.insert(spec.name.clone(), vxlan.clone());

        Ok(vxlan.link)
    }

    fn create_veth_pair(
        &self,
        netns: &NetNs,
        name: &str,
        peer_name: &str,
        mtu: u32,
    ) -> Result<(), DeviceError> {
        let mut state = self.record("create_veth_pair", format!("{name} {peer_name}"))?;

        let mut container_end = state.new_link(name, LinkKind::Veth, mtu);
        let mut peer_end = state.new_link(peer_name, LinkKind::Veth, mtu);
        container_end.peer = Some(peer_name.to_owned());
        peer_end.peer = Some(name.to_owned());

        let links = state.links_mut(Scope::Namespace(netns));
        if links.contains_key(name) || links.contains_key(peer_name) {
            return Err(DeviceError::Command {
                command: format!("ip link add {name}"),
                status: "exit status: 2".to_owned(),
                stderr: "RTNETLINK answers: File exists".to_owned(),
            });
        }
        links.insert(name.to_owned(), container_end);
        links.insert(peer_name.to_owned(), peer_end);

        Ok(())
    }

    fn move_to_host(&self, netns: &NetNs, name: &str) -> Result<(), DeviceError> {
        let mut state = self.record("move_to_host", name.to_owned())?;

        let moved = state
            .links_mut(Scope::Namespace(netns))
            .remove(name)
            .ok_or_else(|| DeviceError::LinkNotFound(name.to_owned()))?;
        state.host.insert(name.to_owned(), moved);

        Ok(())
    }

    fn assign_address(
        &self,
        scope: Scope,
        name: &str,
        address: Ipv4Net,
    ) -> Result<(), DeviceError> {
        let mut state = self.record(
            "assign_address",
            format!("{} {name} {address}", describe_scope(scope)),
        )?;

        let link = state
            .links_mut(scope)
            .get_mut(name)
            .ok_or_else(|| DeviceError::LinkNotFound(name.to_owned()))?;
        if !link.addresses.contains(&address) {
            link.addresses.push(address);
        }

        Ok(())
    }

    fn set_up(&self, scope: Scope, name: &str) -> Result<(), DeviceError> {
        let mut state = self.record("set_up", format!("{} {name}", describe_scope(scope)))?;

        state
            .links_mut(scope)
            .get_mut(name)
            .ok_or_else(|| DeviceError::LinkNotFound(name.to_owned()))?
            .up = true;

        Ok(())
    }

    fn set_master(&self, name: &str, master: &str) -> Result<(), DeviceError> {
        let mut state = self.record("set_master", format!("{name} {master}"))?;

        if !state.host.contains_key(master) {
            return Err(DeviceError::LinkNotFound(master.to_owned()));
        }

        state
            .host
            .get_mut(name)
            .ok_or_else(|| DeviceError::LinkNotFound(name.to_owned()))?
            .master = Some(master.to_owned());

        Ok(())
    }

    fn delete_link(&self, scope: Scope, name: &str) -> Result<bool, DeviceError> {
        let mut state = self.record("delete_link", format!("{} {name}", describe_scope(scope)))?;

        Ok(state.remove_link(scope, name))
    }

    fn replace_route(&self, scope: Scope, route: &Route) -> Result<(), DeviceError> {
        let mut state = self.record(
            "replace_route",
            format!("{} {:?} via {}", describe_scope(scope), route.destination, route.via),
        )?;

        let routes = state.routes_mut(scope);
        routes.retain(|existing| existing.destination != route.destination);
        routes.insert(route.clone());

        Ok(())
    }

    fn delete_route(&self, scope: Scope, route: &Route) -> Result<(), DeviceError> {
        let mut state = self.record(
            "delete_route",
            format!("{} {:?} via {}", describe_scope(scope), route.destination, route.via),
        )?;

        state.routes_mut(scope).remove(route);

        Ok(())
    }

    fn append_fdb(
        &self,
        device: &str,
        mac: MacAddr,
        destination: Ipv4Addr,
    ) -> Result<(), DeviceError> {
        let mut state = self.record("append_fdb", format!("{device} {mac} {destination}"))?;

        state.fdb.insert((device.to_owned(), mac, destination));

        Ok(())
    }

    fn delete_fdb(
        &self,
        device: &str,
        mac: MacAddr,
        destination: Ipv4Addr,
    ) -> Result<(), DeviceError> {
        let mut state = self.record("delete_fdb", format!("{device} {mac} {destination}"))?;

        state.fdb.remove(&(device.to_owned(), mac, destination));

        Ok(())
    }

    fn replace_neighbour(
        &self,
        device: &str,
        address: Ipv4Addr,
        mac: MacAddr,
    ) -> Result<(), DeviceError> {
        let mut state = self.record("replace_neighbour", format!("{device} {address} {mac}"))?;

        state.neighbours.insert((device.to_owned(), address), mac);

        Ok(())
    }

    fn delete_neighbour(&self, device: &str, address: Ipv4Addr) -> Result<(), DeviceError> {
        let mut state = self.record("delete_neighbour", format!("{device} {address}"))?;

        state.neighbours.remove(&(device.to_owned(), address));

        Ok(())
    }

    fn ensure_snat(
        &self,
        source: Ipv4Net,
        out_device: &str,
        to_source: Ipv4Addr,
    ) -> Result<(), DeviceError> {
        let mut state = self.record("ensure_snat", format!("{source} {out_device} {to_source}"))?;

        state
            .snat_rules
            .insert((source, out_device.to_owned(), to_source));

        Ok(())
    }

    fn host_addresses(&self) -> Result<Vec<HostAddress>, DeviceError> {
        let state = self.record("host_addresses", String::new())?;

        Ok(state.host_addresses.clone())
    }
}

#[cfg(test)]
mod tests {
    use crate::devices::{DeviceControlPlane, LinkKind, NetNs, Scope};

    use super::FakeDevices;

    #[test]
    fn deleting_one_end_removes_the_whole_pair() {
        let netns_file = tempfile::NamedTempFile::new().unwrap();
        let netns = NetNs::open(netns_file.path()).unwrap();
        let devices = FakeDevices::new();

        devices
            .create_veth_pair(&netns, "eth0", "veth00000001", 1450)
            .unwrap();
        devices.move_to_host(&netns, "veth00000001").unwrap();

        assert_eq!(
            devices.host_link("veth00000001").unwrap().link.kind,
            LinkKind::Veth
        );
        assert!(devices.delete_link(Scope::Host, "veth00000001").unwrap());
        assert!(devices.namespace_link(&netns, "eth0").is_none());
        assert!(!devices.delete_link(Scope::Host, "veth00000001").unwrap());
    }

    #[test]
    fn injected_failures_are_recorded() {
        let devices = FakeDevices::new();
        devices.fail_on("ensure_bridge");

        assert!(devices.ensure_bridge("vxcni0", 1450).is_err());
        assert_eq!(devices.journal(), ["ensure_bridge vxcni0"]);
    }
}
