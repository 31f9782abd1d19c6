use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::error::{CniError, ErrorCode};

const MAX_INTERFACE_NAME_LEN: usize = 15;

static NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.\-]*$").expect("name pattern is valid")
});

#[derive(Deserialize)]
struct NamedConfig {
    #[serde(default)]
    name: String,
}

pub fn validate_config(config: &[u8]) -> Result<(), CniError> {
    let config: NamedConfig = serde_json::from_slice(config).map_err(|err| {
        CniError::new(
            ErrorCode::DecodingFailure,
            format!("error unmarshall network config: {err}"),
        )
    })?;

    if config.name.is_empty() {
        return Err(CniError::new(
            ErrorCode::InvalidNetworkConfig,
            "missing network name",
        ));
    }

    if !NAME_REGEX.is_match(&config.name) {
        return Err(CniError::new(
            ErrorCode::InvalidNetworkConfig,
            "invalid characters found in network name",
        )
        .with_details(config.name));
    }

    Ok(())
}

pub fn validate_container_id(container_id: &str) -> Result<(), CniError> {
    if container_id.is_empty() {
        return Err(CniError::new(
            ErrorCode::UnknownContainer,
            "missing containerID",
        ));
    }

    if !NAME_REGEX.is_match(container_id) {
        return Err(CniError::new(
            ErrorCode::InvalidEnvironment,
            "invalid characters in containerID",
        )
        .with_details(container_id));
    }

    Ok(())
}

pub fn validate_interface_name(name: &str) -> Result<(), CniError> {
    let invalid = |msg: &str| CniError::new(ErrorCode::InvalidEnvironment, msg).with_details(name);

    if name.is_empty() {
        return Err(invalid("interface name is empty"));
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(invalid("interface name is too long"));
    }
    if name == "." || name == ".." {
        return Err(invalid("interface name is . or .."));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == ':' || c.is_whitespace())
    {
        return Err(invalid(
            "interface name contains / or : or whitespace characters",
        ));
    }

    Ok(())
}
