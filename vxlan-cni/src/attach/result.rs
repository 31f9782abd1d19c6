use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::Serialize;
use vxlan_cni_core::ip::mac::MacAddr;

const DEFAULT_ROUTE: &str = "0.0.0.0/0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub mac: Option<MacAddr>,
    /// Namespace path for container-side interfaces.
    pub sandbox: Option<String>,
}

/// What ADD set up, independent of the protocol version it's reported in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub address: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub host_interface: InterfaceInfo,
    pub container_interface: InterfaceInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFormat {
    /// 0.1.0 and 0.2.0: a single `ip4` object.
    Legacy,
    /// 0.3.x and 0.4.0: `ips` entries tagged with the IP version.
    Tagged,
    /// 1.x: untagged `ips` entries.
    Current,
}

impl ResultFormat {
    pub fn for_version(version: &str) -> Self {
        match version {
            "0.1.0" | "0.2.0" => Self::Legacy,
            _ if version.starts_with("0.") => Self::Tagged,
            _ => Self::Current,
        }
    }
}

#[derive(Serialize)]
struct Route {
    dst: &'static str,
    gw: Ipv4Addr,
}

#[derive(Serialize)]
struct Dns {}

#[derive(Serialize)]
struct LegacyIpConfig {
    ip: Ipv4Net,
    gateway: Ipv4Addr,
    routes: Vec<Route>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LegacyResult<'a> {
    cni_version: &'a str,
    ip4: LegacyIpConfig,
    dns: Dns,
}

#[derive(Serialize)]
struct Interface<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mac: Option<MacAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sandbox: Option<&'a str>,
}

#[derive(Serialize)]
struct IpConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'static str>,
    interface: usize,
    address: Ipv4Net,
    gateway: Ipv4Addr,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InterfacesResult<'a> {
    cni_version: &'a str,
    interfaces: Vec<Interface<'a>>,
    ips: Vec<IpConfig>,
    routes: Vec<Route>,
    dns: Dns,
}

impl<'a> From<&'a InterfaceInfo> for Interface<'a> {
    fn from(info: &'a InterfaceInfo) -> Self {
        Self {
            name: &info.name,
            mac: info.mac,
            sandbox: info.sandbox.as_deref(),
        }
    }
}

impl Attachment {
    /// Renders the result document in the shape `cni_version` expects.
    pub fn to_result(&self, cni_version: &str) -> serde_json::Result<serde_json::Value> {
        let routes = vec![Route {
            dst: DEFAULT_ROUTE,
            gw: self.gateway,
        }];

        let format = ResultFormat::for_version(cni_version);
        if format == ResultFormat::Legacy {
            return serde_json::to_value(LegacyResult {
                cni_version,
                ip4: LegacyIpConfig {
                    ip: self.address,
                    gateway: self.gateway,
                    routes,
                },
                dns: Dns {},
            });
        }

        serde_json::to_value(InterfacesResult {
            cni_version,
            interfaces: vec![
                (&self.host_interface).into(),
                (&self.container_interface).into(),
            ],
            ips: vec![IpConfig {
                version: match format {
                    ResultFormat::Tagged => Some("4"),
                    _ => None,
                },
                // index of the container interface above
                interface: 1,
                address: self.address,
                gateway: self.gateway,
            }],
            routes,
            dns: Dns {},
        })
    }
}
