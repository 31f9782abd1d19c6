pub mod config;
pub mod devices;
pub mod directory;
pub mod identity;
pub mod ip;
pub mod ipam;

pub const PLUGIN_NAME: &str = "vxlan-cni";
pub const ANNOTATION_PREFIX: &str = "vxlan-cni.io";

pub const DEFAULT_BRIDGE_NAME: &str = "vxcni0";
pub const DEFAULT_VXLAN_NAME: &str = "vxcni.1";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/cni/vxlan-cni";
pub const DEFAULT_CNI_CONFIG_PATH: &str = "/etc/cni/net.d/10-vxlan-cni.conf";
