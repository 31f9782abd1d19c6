use std::{path::PathBuf, time::Duration};

use clap::Parser;
use vxlan_cni_core::{
    config::{
        OverlaySettings, OverlaySettingsBuilder, OverlaySettingsBuilderError, DEFAULT_POD_MTU,
        DEFAULT_VXLAN_ID, DEFAULT_VXLAN_MTU, DEFAULT_VXLAN_PORT,
    },
    DEFAULT_BRIDGE_NAME, DEFAULT_CNI_CONFIG_PATH, DEFAULT_VXLAN_NAME,
};

pub const DEFAULT_STATUS_FILE: &str = "/run/vxlan-cni/status";

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// bridge the pods of this node are attached to
    #[arg(long, env = "VXLAN_CNI_BRIDGE", default_value = DEFAULT_BRIDGE_NAME)]
    pub bridge_name: String,
    /// name of the VXLAN device carrying traffic between nodes
    #[arg(long, env = "VXLAN_CNI_VXLAN", default_value = DEFAULT_VXLAN_NAME)]
    pub vxlan_name: String,
    /// VXLAN network identifier
    #[arg(long, env = "VXLAN_CNI_VXLAN_ID", default_value_t = DEFAULT_VXLAN_ID)]
    pub vxlan_id: u32,
    /// UDP port of the VXLAN tunnel
    #[arg(long, env = "VXLAN_CNI_VXLAN_PORT", default_value_t = DEFAULT_VXLAN_PORT)]
    pub vxlan_port: u16,
    /// MTU of the bridge and pod interfaces
    #[arg(long, env = "VXLAN_CNI_POD_MTU", default_value_t = DEFAULT_POD_MTU)]
    pub pod_mtu: u32,
    /// MTU of the VXLAN device
    #[arg(long, env = "VXLAN_CNI_VXLAN_MTU", default_value_t = DEFAULT_VXLAN_MTU)]
    pub vxlan_mtu: u32,
    /// where the CNI network configuration is written to
    #[arg(long, env = "VXLAN_CNI_CONFIG_PATH", default_value = DEFAULT_CNI_CONFIG_PATH)]
    pub cni_config_path: PathBuf,
    /// readiness file watched by the supervisor
    #[arg(long, env = "VXLAN_CNI_STATUS_FILE", default_value = DEFAULT_STATUS_FILE)]
    pub status_file: PathBuf,
    /// seconds between full mesh reconciliations
    #[arg(long, env = "VXLAN_CNI_RESYNC_INTERVAL", default_value_t = 60)]
    pub resync_interval: u64,
    /// seconds to wait before retrying a failed bootstrap
    #[arg(long, env = "VXLAN_CNI_RETRY_INTERVAL", default_value_t = 10)]
    pub retry_interval: u64,
    /// enable verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose_logging: bool,
    /// enable trace output (more detailed than verbose, overrides it if present)
    #[arg(long = "trace")]
    pub trace_logging: bool,
}

pub enum LogLevel {
    Normal,
    Verbose,
    Trace,
}

impl Cli {
    pub fn get_log_level(&self) -> LogLevel {
        if self.trace_logging {
            return LogLevel::Trace;
        }

        if self.verbose_logging {
            return LogLevel::Verbose;
        }

        LogLevel::Normal
    }

    pub fn overlay_settings(&self) -> Result<OverlaySettings, OverlaySettingsBuilderError> {
        OverlaySettingsBuilder::default()
            .bridge_name(self.bridge_name.as_str())
            .vxlan_name(self.vxlan_name.as_str())
            .vxlan_id(self.vxlan_id)
            .vxlan_port(self.vxlan_port)
            .pod_mtu(self.pod_mtu)
            .vxlan_mtu(self.vxlan_mtu)
            .build()
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval.max(1))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval.max(1))
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn defaults_match_the_overlay_defaults() {
        let cli = Cli::try_parse_from(["vxlan-cni-agent"]).unwrap();

        let settings = cli.overlay_settings().unwrap();

        assert_eq!(settings.bridge_name, "vxcni0");
        assert_eq!(settings.vxlan_name, "vxcni.1");
        assert_eq!(settings.vxlan_id, 1);
        assert_eq!(settings.vxlan_port, 8472);
        assert_eq!(cli.status_file.to_str(), Some("/run/vxlan-cni/status"));
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "vxlan-cni-agent",
            "--vxlan-port",
            "4789",
            "--bridge-name",
            "br-pods",
            "--resync-interval",
            "0",
        ])
        .unwrap();

        let settings = cli.overlay_settings().unwrap();

        assert_eq!(settings.vxlan_port, 4789);
        assert_eq!(settings.bridge_name, "br-pods");
        assert_eq!(cli.resync_interval().as_secs(), 1);
    }
}
