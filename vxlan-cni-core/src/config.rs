use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use derive_builder::Builder;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    ip::Subnet, DEFAULT_BRIDGE_NAME, DEFAULT_DATA_DIR, DEFAULT_VXLAN_NAME, PLUGIN_NAME,
};

pub const CONFIG_CNI_VERSION: &str = "0.4.0";

pub const DEFAULT_POD_MTU: u32 = 1450;
pub const DEFAULT_VXLAN_MTU: u32 = 1500;
pub const DEFAULT_VXLAN_ID: u32 = 1;
pub const DEFAULT_VXLAN_PORT: u16 = 8472;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't parse the network configuration! {}", .0)]
    Decode(serde_json::Error),
    #[error("Couldn't encode the network configuration! {}", .0)]
    Encode(serde_json::Error),
    #[error("Couldn't write the network configuration to '{}'! {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
}

/// The network configuration handed to the plugin on stdin, as written by
/// the agent into the runtime's configuration directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default)]
    pub cni_version: String,
    pub name: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub subnet: Subnet,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_bridge() -> String {
    DEFAULT_BRIDGE_NAME.to_owned()
}

fn default_mtu() -> u32 {
    DEFAULT_POD_MTU
}

fn default_data_dir() -> PathBuf {
    DEFAULT_DATA_DIR.into()
}

impl NetworkConfig {
    pub fn for_subnet(subnet: Subnet, settings: &OverlaySettings) -> Self {
        Self {
            cni_version: CONFIG_CNI_VERSION.to_owned(),
            name: PLUGIN_NAME.to_owned(),
            plugin_type: PLUGIN_NAME.to_owned(),
            subnet,
            bridge: settings.bridge_name.clone(),
            mtu: settings.pod_mtu,
            data_dir: DEFAULT_DATA_DIR.into(),
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, ConfigError> {
        serde_json::from_slice(data).map_err(ConfigError::Decode)
    }

    /// Writes the configuration next to its final location and renames it
    /// into place, so the runtime never picks up a half-written file.
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |err| ConfigError::Io(path.to_owned(), err);
        let content = serde_json::to_vec_pretty(self).map_err(ConfigError::Encode)?;
        let staging_path = path.with_extension("tmp");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let mut file = File::create(&staging_path).map_err(io_error)?;
        file.write_all(&content).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        fs::rename(&staging_path, path).map_err(io_error)?;

        info!("Network configuration written to {}", path.display());

        Ok(())
    }
}

/// Node-level overlay device parameters shared by the agent and the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(setter(into))]
pub struct OverlaySettings {
    #[builder(default = "DEFAULT_BRIDGE_NAME.to_owned()")]
    pub bridge_name: String,
    #[builder(default = "DEFAULT_VXLAN_NAME.to_owned()")]
    pub vxlan_name: String,
    #[builder(default = "DEFAULT_VXLAN_ID")]
    pub vxlan_id: u32,
    #[builder(default = "DEFAULT_VXLAN_PORT")]
    pub vxlan_port: u16,
    #[builder(default = "DEFAULT_POD_MTU")]
    pub pod_mtu: u32,
    #[builder(default = "DEFAULT_VXLAN_MTU")]
    pub vxlan_mtu: u32,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            bridge_name: DEFAULT_BRIDGE_NAME.to_owned(),
            vxlan_name: DEFAULT_VXLAN_NAME.to_owned(),
            vxlan_id: DEFAULT_VXLAN_ID,
            vxlan_port: DEFAULT_VXLAN_PORT,
            pod_mtu: DEFAULT_POD_MTU,
            vxlan_mtu: DEFAULT_VXLAN_MTU,
        }
    }
}
