use std::{collections::BTreeMap, net::Ipv4Addr};

use thiserror::Error;

use crate::{ip::mac::MacAddr, ANNOTATION_PREFIX};

pub const FIELD_SEPARATOR: char = '|';

pub fn overlay_ip_to_mac_annotation() -> String {
    format!("{ANNOTATION_PREFIX}/overlay-ip-to-mac")
}

pub fn mac_to_host_ip_annotation() -> String {
    format!("{ANNOTATION_PREFIX}/mac-to-host-ip")
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Annotation '{}' has an invalid value '{}'!", .0, .1)]
    Malformed(String, String),
    #[error("Annotations disagree on the overlay MAC address ({} vs {})!", .0, .1)]
    MacMismatch(MacAddr, MacAddr),
}

/// What a node tells its peers about itself: where its overlay endpoint is
/// and which host address the VXLAN frames for it should be sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayIdentity {
    pub overlay_address: Ipv4Addr,
    pub mac: MacAddr,
    pub host_address: Ipv4Addr,
}

impl OverlayIdentity {
    pub fn to_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                overlay_ip_to_mac_annotation(),
                format!("{}{FIELD_SEPARATOR}{}", self.overlay_address, self.mac),
            ),
            (
                mac_to_host_ip_annotation(),
                format!("{}{FIELD_SEPARATOR}{}", self.mac, self.host_address),
            ),
        ])
    }

    /// Returns `Ok(None)` when the node hasn't published its identity yet,
    /// and an error when it's there but can't be trusted.
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<Self>, IdentityError> {
        let ip_to_mac_key = overlay_ip_to_mac_annotation();
        let mac_to_ip_key = mac_to_host_ip_annotation();

        let (ip_to_mac, mac_to_ip) = match (
            annotations.get(&ip_to_mac_key),
            annotations.get(&mac_to_ip_key),
        ) {
            (Some(ip_to_mac), Some(mac_to_ip)) => (ip_to_mac, mac_to_ip),
            _ => return Ok(None),
        };

        let (overlay_address, mac) = parse_pair::<Ipv4Addr, MacAddr>(&ip_to_mac_key, ip_to_mac)?;
        let (announced_mac, host_address) =
            parse_pair::<MacAddr, Ipv4Addr>(&mac_to_ip_key, mac_to_ip)?;

        if mac != announced_mac {
            return Err(IdentityError::MacMismatch(mac, announced_mac));
        }

        Ok(Some(Self {
            overlay_address,
            mac,
            host_address,
        }))
    }
}

fn parse_pair<A: std::str::FromStr, B: std::str::FromStr>(
    key: &str,
    value: &str,
) -> Result<(A, B), IdentityError> {
    let malformed = || IdentityError::Malformed(key.to_owned(), value.to_owned());
    let mut fields = value.split(FIELD_SEPARATOR);

    match (fields.next(), fields.next(), fields.next()) {
        (Some(first), Some(second), None) => Ok((
            first.trim().parse().map_err(|_| malformed())?,
            second.trim().parse().map_err(|_| malformed())?,
        )),
        _ => Err(malformed()),
    }
}
