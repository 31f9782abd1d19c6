use serde::{Deserialize, Serialize};

use super::error::{CniError, ErrorCode};

pub const CURRENT_VERSION: &str = "1.1.0";
pub const SUPPORTED_VERSIONS: &[&str] = &[
    "0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0", "1.1.0",
];

/// Configurations that don't declare a version predate versioning.
pub const IMPLICIT_VERSION: &str = "0.1.0";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub cni_version: &'static str,
    pub supported_versions: &'static [&'static str],
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            cni_version: CURRENT_VERSION,
            supported_versions: SUPPORTED_VERSIONS,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionedConfig {
    #[serde(default)]
    cni_version: String,
}

pub fn decode_config_version(config: &[u8]) -> Result<String, CniError> {
    let config: VersionedConfig = serde_json::from_slice(config).map_err(|err| {
        CniError::new(
            ErrorCode::DecodingFailure,
            format!("decoding version from network config: {err}"),
        )
    })?;

    match config.cni_version.is_empty() {
        true => Ok(IMPLICIT_VERSION.to_owned()),
        false => Ok(config.cni_version),
    }
}

pub fn check_version(version: &str) -> Result<(), CniError> {
    if SUPPORTED_VERSIONS.contains(&version) {
        return Ok(());
    }

    Err(
        CniError::new(ErrorCode::IncompatibleVersion, "incompatible CNI versions").with_details(
            format!("config is {version:?}, plugin supports {SUPPORTED_VERSIONS:?}"),
        ),
    )
}
