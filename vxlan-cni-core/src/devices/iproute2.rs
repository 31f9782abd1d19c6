use std::{
    ffi::OsStr,
    net::Ipv4Addr,
    process::{self, Command},
};

use ipnet::Ipv4Net;
use log::{debug, info};
use serde::Deserialize;

use crate::ip::mac::MacAddr;

use super::{
    DeviceControlPlane, DeviceError, HostAddress, Link, LinkKind, NetNs, Route, Scope, VxlanSpec,
};

const MISSING_OBJECT_MARKERS: &[&str] = &[
    "does not exist",
    "Cannot find device",
    "No such file or directory",
    "No such process",
    "Cannot assign requested address",
];

const EXISTING_OBJECT_MARKERS: &[&str] = &["File exists"];

/// Drives the kernel through the `ip`, `bridge` and `iptables` tools.
/// Namespaced commands are run through `nsenter --net=<path>`, so the calling
/// process never leaves its own namespace.
#[derive(Debug, Clone, Default)]
pub struct IpRoute2;

impl IpRoute2 {
    pub fn new() -> Self {
        Self
    }

    fn command<I, S>(&self, scope: Scope, program: &str, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        match scope {
            Scope::Host => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            Scope::Namespace(netns) => {
                let mut command = Command::new("nsenter");
                command
                    .arg(format!("--net={}", netns.path().display()))
                    .arg(program)
                    .args(args);
                command
            }
        }
    }

    fn run(&self, mut command: Command) -> Result<String, DeviceError> {
        let description = describe(&command);
        debug!("Running '{description}'...");

        let output = command
            .output()
            .map_err(|err| DeviceError::Spawn(description.clone(), err))?;

        if !output.status.success() {
            return Err(DeviceError::Command {
                command: description,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn ip<I, S>(&self, scope: Scope, args: I) -> Result<String, DeviceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run(self.command(scope, "ip", args))
    }

    fn bridge<I, S>(&self, args: I) -> Result<String, DeviceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run(self.command(Scope::Host, "bridge", args))
    }

    fn create_link(&self, name: &str, args: &[String]) -> Result<Link, DeviceError> {
        info!("Creating link '{name}'...");
        tolerate_existing(self.ip(Scope::Host, args))?;

        self.link(Scope::Host, name)?
            .ok_or_else(|| DeviceError::LinkNotFound(name.to_owned()))
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<(), DeviceError> {
        self.ip(
            Scope::Host,
            ["link", "set", "dev", name, "mtu", mtu.to_string().as_str()],
        )
        .map(|_| ())
    }
}

impl DeviceControlPlane for IpRoute2 {
    fn link(&self, scope: Scope, name: &str) -> Result<Option<Link>, DeviceError> {
        let output = match self.ip(scope, ["-d", "-j", "link", "show", "dev", name]) {
            Ok(output) => output,
            Err(err) if is_missing(&err) => return Ok(None),
            Err(err) => return Err(err),
        };

        let links = parse_links(&output)
            .map_err(|err| DeviceError::Decode(format!("ip link show dev {name}"), err))?;

        Ok(links.into_iter().find(|link| link.name == name))
    }

    fn ensure_bridge(&self, name: &str, mtu: u32) -> Result<Link, DeviceError> {
        let bridge = match self.link(Scope::Host, name)? {
            Some(link) => link.expect_kind(LinkKind::Bridge)?,
            None => self
                .create_link(
                    name,
                    &["link", "add", "name", name, "type", "bridge"].map(str::to_owned),
                )?
                .expect_kind(LinkKind::Bridge)?,
        };

        if bridge.mtu != mtu {
            self.set_mtu(name, mtu)?;
        }

        Ok(Link { mtu, ..bridge })
    }

    fn ensure_vxlan(&self, spec: &VxlanSpec) -> Result<Link, DeviceError> {
        if let Some(link) = self.link(Scope::Host, &spec.name)? {
            return link.expect_kind(LinkKind::Vxlan);
        }

        let mut args = vec![
            "link".to_owned(),
            "add".to_owned(),
            spec.name.clone(),
            "mtu".to_owned(),
            spec.mtu.to_string(),
            "type".to_owned(),
            "vxlan".to_owned(),
            "id".to_owned(),
            spec.vni.to_string(),
            "dstport".to_owned(),
            spec.port.to_string(),
            "nolearning".to_owned(),
        ];
        if let Some(underlay) = &spec.underlay {
            args.extend(["dev".to_owned(), underlay.clone()]);
        }

        self.create_link(&spec.name, &args)?
            .expect_kind(LinkKind::Vxlan)
    }

    fn create_veth_pair(
        &self,
        netns: &NetNs,
        name: &str,
        peer_name: &str,
        mtu: u32,
    ) -> Result<(), DeviceError> {
        let mtu = mtu.to_string();

        self.ip(
            Scope::Namespace(netns),
            [
                "link",
                "add",
                name,
                "mtu",
                mtu.as_str(),
                "type",
                "veth",
                "peer",
                "name",
                peer_name,
                "mtu",
                mtu.as_str(),
            ],
        )
        .map(|_| ())
    }

    fn move_to_host(&self, netns: &NetNs, name: &str) -> Result<(), DeviceError> {
        // our own pid lives in the host namespace
        self.ip(
            Scope::Namespace(netns),
            [
                "link",
                "set",
                "dev",
                name,
                "netns",
                process::id().to_string().as_str(),
            ],
        )
        .map(|_| ())
    }

    fn assign_address(
        &self,
        scope: Scope,
        name: &str,
        address: Ipv4Net,
    ) -> Result<(), DeviceError> {
        self.ip(scope, ["addr", "replace", address.to_string().as_str(), "dev", name])
            .map(|_| ())
    }

    fn set_up(&self, scope: Scope, name: &str) -> Result<(), DeviceError> {
        self.ip(scope, ["link", "set", "dev", name, "up"]).map(|_| ())
    }

    fn set_master(&self, name: &str, master: &str) -> Result<(), DeviceError> {
        self.ip(Scope::Host, ["link", "set", "dev", name, "master", master])
            .map(|_| ())
    }

    fn delete_link(&self, scope: Scope, name: &str) -> Result<bool, DeviceError> {
        match self.ip(scope, ["link", "del", "dev", name]) {
            Ok(_) => Ok(true),
            Err(err) if is_missing(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn replace_route(&self, scope: Scope, route: &Route) -> Result<(), DeviceError> {
        self.ip(scope, route_args("replace", route)).map(|_| ())
    }

    fn delete_route(&self, scope: Scope, route: &Route) -> Result<(), DeviceError> {
        tolerate_missing(self.ip(scope, route_args("del", route)))
    }

    fn append_fdb(
        &self,
        device: &str,
        mac: MacAddr,
        destination: Ipv4Addr,
    ) -> Result<(), DeviceError> {
        tolerate_existing(self.bridge([
            "fdb",
            "append",
            mac.to_string().as_str(),
            "dev",
            device,
            "dst",
            destination.to_string().as_str(),
        ]))
    }

    fn delete_fdb(
        &self,
        device: &str,
        mac: MacAddr,
        destination: Ipv4Addr,
    ) -> Result<(), DeviceError> {
        tolerate_missing(self.bridge([
            "fdb",
            "del",
            mac.to_string().as_str(),
            "dev",
            device,
            "dst",
            destination.to_string().as_str(),
        ]))
    }

    fn replace_neighbour(
        &self,
        device: &str,
        address: Ipv4Addr,
        mac: MacAddr,
    ) -> Result<(), DeviceError> {
        self.ip(
            Scope::Host,
            [
                "neigh",
                "replace",
                address.to_string().as_str(),
                "lladdr",
                mac.to_string().as_str(),
                "dev",
                device,
                "nud",
                "permanent",
            ],
        )
        .map(|_| ())
    }

    fn delete_neighbour(&self, device: &str, address: Ipv4Addr) -> Result<(), DeviceError> {
        tolerate_missing(self.ip(
            Scope::Host,
            ["neigh", "del", address.to_string().as_str(), "dev", device],
        ))
    }

    fn ensure_snat(
        &self,
        source: Ipv4Net,
        out_device: &str,
        to_source: Ipv4Addr,
    ) -> Result<(), DeviceError> {
        let rule = snat_rule(source, out_device, to_source);
        let check = self.command(
            Scope::Host,
            "iptables",
            ["-t", "nat", "-C"].into_iter().map(str::to_owned).chain(rule.clone()),
        );

        if self.run(check).is_ok() {
            debug!("SNAT rule for {source} is already in place");
            return Ok(());
        }

        info!("Adding SNAT rule for {source} via {out_device} ({to_source})...");
        let append = self.command(
            Scope::Host,
            "iptables",
            ["-t", "nat", "-A"].into_iter().map(str::to_owned).chain(rule),
        );

        self.run(append).map(|_| ())
    }

    fn host_addresses(&self) -> Result<Vec<HostAddress>, DeviceError> {
        let output = self.ip(Scope::Host, ["-j", "-4", "addr", "show"])?;

        parse_host_addresses(&output)
            .map_err(|err| DeviceError::Decode("ip -4 addr show".to_owned(), err))
    }
}

fn describe(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

fn stderr_contains(err: &DeviceError, markers: &[&str]) -> bool {
    match err {
        DeviceError::Command { stderr, .. } => markers.iter().any(|marker| stderr.contains(marker)),
        _ => false,
    }
}

fn is_missing(err: &DeviceError) -> bool {
    stderr_contains(err, MISSING_OBJECT_MARKERS)
}

fn tolerate_missing(result: Result<String, DeviceError>) -> Result<(), DeviceError> {
    match result {
        Err(err) if !is_missing(&err) => Err(err),
        _ => Ok(()),
    }
}

fn tolerate_existing(result: Result<String, DeviceError>) -> Result<(), DeviceError> {
    match result {
        Err(err) if !stderr_contains(&err, EXISTING_OBJECT_MARKERS) => Err(err),
        _ => Ok(()),
    }
}

fn route_args(action: &str, route: &Route) -> Vec<String> {
    let destination = route
        .destination
        .map(|destination| destination.to_string())
        .unwrap_or_else(|| "default".to_owned());

    let mut args = vec![
        "route".to_owned(),
        action.to_owned(),
        destination,
        "via".to_owned(),
        route.via.to_string(),
        "dev".to_owned(),
        route.device.clone(),
    ];
    if route.onlink {
        args.push("onlink".to_owned());
    }

    args
}

fn snat_rule(source: Ipv4Net, out_device: &str, to_source: Ipv4Addr) -> Vec<String> {
    [
        "POSTROUTING",
        "-s",
        source.to_string().as_str(),
        "-o",
        out_device,
        "-j",
        "SNAT",
        "--to-source",
        to_source.to_string().as_str(),
    ]
    .map(str::to_owned)
    .to_vec()
}

#[derive(Debug, Deserialize)]
struct LinkRecord {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    linkinfo: Option<LinkInfoRecord>,
}

#[derive(Debug, Deserialize)]
struct LinkInfoRecord {
    #[serde(default)]
    info_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddressRecord {
    ifname: String,
    #[serde(default)]
    addr_info: Vec<AddrInfoRecord>,
}

#[derive(Debug, Deserialize)]
struct AddrInfoRecord {
    family: String,
    local: String,
    prefixlen: u8,
}

fn parse_links(output: &str) -> Result<Vec<Link>, serde_json::Error> {
    let records: Vec<LinkRecord> = serde_json::from_str(output)?;

    Ok(records
        .into_iter()
        .map(|record| Link {
            kind: LinkKind::from_info_kind(
                record
                    .linkinfo
                    .as_ref()
                    .and_then(|info| info.info_kind.as_deref()),
            ),
            mac: record.address.and_then(|address| address.parse().ok()),
            name: record.ifname,
            index: record.ifindex,
            mtu: record.mtu,
        })
        .collect())
}

fn parse_host_addresses(output: &str) -> Result<Vec<HostAddress>, serde_json::Error> {
    let records: Vec<AddressRecord> = serde_json::from_str(output)?;

    Ok(records
        .into_iter()
        .flat_map(|record| {
            let interface = record.ifname;
            record
                .addr_info
                .into_iter()
                .filter(|info| info.family == "inet")
                .filter_map(move |info| {
                    let address = info.local.parse().ok()?;
                    let address = Ipv4Net::new(address, info.prefixlen).ok()?;

                    Some(HostAddress {
                        interface: interface.clone(),
                        address,
                    })
                })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::devices::{DeviceError, LinkKind, Route};

    use super::{is_missing, parse_host_addresses, parse_links, route_args, snat_rule};

    const LINK_OUTPUT: &str = r#"[{"ifindex":4,"ifname":"vxcni0","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],"mtu":1450,"qdisc":"noqueue","operstate":"UP","linkmode":"DEFAULT","group":"default","txqlen":1000,"link_type":"ether","address":"5a:1e:2f:44:10:0b","broadcast":"ff:ff:ff:ff:ff:ff","promiscuity":0,"linkinfo":{"info_kind":"bridge","info_data":{"forward_delay":1500,"stp_state":0}}}]"#;

    const ADDR_OUTPUT: &str = r#"[{"ifindex":1,"ifname":"lo","flags":["LOOPBACK","UP","LOWER_UP"],"mtu":65536,"addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8,"scope":"host","label":"lo"}]},{"ifindex":2,"ifname":"eth0","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],"mtu":1500,"addr_info":[{"family":"inet","local":"192.168.10.11","prefixlen":24,"broadcast":"192.168.10.255","scope":"global","label":"eth0"},{"family":"inet","local":"192.168.10.50","prefixlen":32,"scope":"global","label":"eth0"}]},{"ifindex":3,"ifname":"tun0","addr_info":[]}]"#;

    #[test]
    fn parses_link_details() {
        let links = parse_links(LINK_OUTPUT).unwrap();

        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name, "vxcni0");
        assert_eq!(links[0].index, 4);
        assert_eq!(links[0].mtu, 1450);
        assert_eq!(links[0].kind, LinkKind::Bridge);
        assert_eq!(links[0].mac.unwrap().to_string(), "5a:1e:2f:44:10:0b");
    }

    #[test]
    fn links_without_ethernet_address_have_no_mac() {
        let links =
            parse_links(r#"[{"ifindex":7,"ifname":"ipip0","mtu":1480,"address":"0.0.0.0"}]"#)
                .unwrap();

        assert_eq!(links[0].mac, None);
        assert_eq!(links[0].kind.to_string(), "device");
    }

    #[test]
    fn parses_every_ipv4_address_of_every_interface() {
        let addresses = parse_host_addresses(ADDR_OUTPUT).unwrap();

        assert_eq!(
            addresses
                .iter()
                .map(|address| format!("{} {}", address.interface, address.address))
                .collect::<Vec<_>>(),
            [
                "lo 127.0.0.1/8",
                "eth0 192.168.10.11/24",
                "eth0 192.168.10.50/32"
            ]
        );
    }

    #[test]
    fn onlink_route_arguments() {
        let route = Route::onlink(
            "10.244.2.0/24".parse().unwrap(),
            Ipv4Addr::new(10, 244, 2, 0),
            "vxcni.1",
        );

        assert_eq!(
            route_args("replace", &route).join(" "),
            "route replace 10.244.2.0/24 via 10.244.2.0 dev vxcni.1 onlink"
        );
    }

    #[test]
    fn default_route_arguments() {
        let route = Route::default_via(Ipv4Addr::new(10, 244, 1, 1), "eth0");

        assert_eq!(
            route_args("replace", &route).join(" "),
            "route replace default via 10.244.1.1 dev eth0"
        );
    }

    #[test]
    fn snat_rule_arguments() {
        assert_eq!(
            snat_rule(
                "10.244.1.0/24".parse().unwrap(),
                "eth0",
                Ipv4Addr::new(192, 168, 10, 11)
            )
            .join(" "),
            "POSTROUTING -s 10.244.1.0/24 -o eth0 -j SNAT --to-source 192.168.10.11"
        );
    }

    #[test]
    fn recognizes_missing_objects() {
        let missing = DeviceError::Command {
            command: "ip link del dev veth0".to_owned(),
            status: "exit status: 1".to_owned(),
            stderr: "Cannot find device \"veth0\"".to_owned(),
        };
        let denied = DeviceError::Command {
            command: "ip link del dev veth0".to_owned(),
            status: "exit status: 2".to_owned(),
            stderr: "RTNETLINK answers: Operation not permitted".to_owned(),
        };

        assert!(is_missing(&missing));
        assert!(!is_missing(&denied));
    }
}
