use std::{fs::OpenOptions, process::exit};

use env_logger::Target;
use log::LevelFilter;
use vxlan_cni_core::{devices::IpRoute2, PLUGIN_NAME};

use crate::{attach::AttachController, skel::plugin_main};

mod attach;
mod skel;

pub const LOG_FILE_ENV: &str = "VXLAN_CNI_LOG_FILE";
pub const DEFAULT_LOG_FILE: &str = "/var/log/vxlan-cni.log";

fn main() {
    configure_logging();

    let controller = AttachController::new(IpRoute2::new());
    let about = format!("{PLUGIN_NAME} CNI plugin v{}", env!("CARGO_PKG_VERSION"));

    exit(plugin_main(&controller, &about));
}

// stdout belongs to the runtime, so logs go to a file
fn configure_logging() {
    let log_path = std::env::var(LOG_FILE_ENV).unwrap_or_else(|_| DEFAULT_LOG_FILE.to_owned());
    let mut logger = env_logger::builder();

    logger
        .format_module_path(false)
        .filter_level(LevelFilter::Info)
        .parse_default_env();

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => logger.target(Target::Pipe(Box::new(file))),
        Err(_) => logger.target(Target::Stderr),
    };

    logger.init();
}
