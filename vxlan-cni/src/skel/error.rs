use std::io::Write;

use serde::{Serialize, Serializer};
use thiserror::Error;

use super::version::CURRENT_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    IncompatibleVersion = 1,
    UnknownContainer = 3,
    InvalidEnvironment = 4,
    IoFailure = 5,
    DecodingFailure = 6,
    InvalidNetworkConfig = 7,
    Internal = 999,
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(*self as u32)
    }
}

/// A protocol level failure, printed to the runtime as an error document.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{msg}")]
pub struct CniError {
    pub code: ErrorCode,
    pub msg: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDocument<'a> {
    cni_version: &'a str,
    #[serde(flatten)]
    error: &'a CniError,
}

impl CniError {
    pub fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            details: String::new(),
        }
    }

    pub fn with_details(self, details: impl Into<String>) -> Self {
        Self {
            details: details.into(),
            ..self
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        let details = match err.chain().count() {
            1 => String::new(),
            _ => format!("{err:#}"),
        };

        Self::new(ErrorCode::Internal, err.to_string()).with_details(details)
    }

    pub fn print(&self, out: &mut impl Write) -> std::io::Result<()> {
        let document = ErrorDocument {
            cni_version: CURRENT_VERSION,
            error: self,
        };

        serde_json::to_writer_pretty(&mut *out, &document)?;
        writeln!(out)
    }
}
