//! Error types for wvkeys.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Stage of an acquisition at which a network call or decode failed.
///
/// Carried by every fatal error so an operator can tell which request broke
/// for which asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Playback descriptor (webPlayback) request.
    WebPlayback,
    /// HLS playlist download or parse.
    Playlist,
    /// First license round: service certificate request.
    Certificate,
    /// CDM session creation and challenge generation.
    Challenge,
    /// Second license round: license request with the CDM challenge.
    License,
    /// Feeding the license response back into the CDM.
    AcceptLicense,
    /// Reading keys out of the CDM session.
    Keys,
    /// Key vault read or write.
    Vault,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::WebPlayback => "webplayback",
            Step::Playlist => "playlist",
            Step::Certificate => "certificate request",
            Step::Challenge => "challenge",
            Step::License => "license request",
            Step::AcceptLicense => "license parse",
            Step::Keys => "key retrieval",
            Step::Vault => "key vault",
        };
        f.write_str(name)
    }
}

/// Main error type for wvkeys operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A network call returned a non-success status, timed out or could not
    /// be sent at all.
    #[error("[{asset_id}] {step} failed{}: {message}", fmt_status(.status))]
    Transport {
        asset_id: String,
        step: Step,
        status: Option<u16>,
        message: String,
    },

    /// The remote accepted the request but the response lacks a required field.
    #[error("[{asset_id}] {step} returned an unusable response: {message}")]
    Protocol {
        asset_id: String,
        step: Step,
        message: String,
    },

    /// The catalog promised decryptable content but the required variant or
    /// protection data is missing.
    #[error("[{asset_id}] {message}")]
    Content { asset_id: String, message: String },

    /// A license exchange step failed for one init data fingerprint.
    #[error("[{asset_id}] {step} failed for {fingerprint}: {message}")]
    KeyExchange {
        asset_id: String,
        fingerprint: String,
        step: Step,
        message: String,
    },

    /// The CDM backend rejected an operation.
    #[error("CDM error: {0}")]
    Cdm(String),

    /// The key vault could not be read or written.
    #[error("Key vault error: {0}")]
    Vault(String),

    /// The Widevine init data is invalid or empty.
    #[error("Invalid init data: {0}")]
    InvalidInitData(String),

    /// A playlist could not be parsed.
    #[error("Invalid playlist: {0}")]
    InvalidPlaylist(String),

    /// Failed to decode data.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Failed to parse protobuf message.
    #[error("Protobuf decode error: {0}")]
    ProtobufDecodeError(#[from] prost::DecodeError),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// JSON error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML configuration error.
    #[error("Config error: {0}")]
    ConfigError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a transport error from a failed `reqwest` call.
    pub fn transport(asset_id: &str, step: Step, err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("timed out: {}", err)
        } else {
            err.to_string()
        };
        Error::Transport {
            asset_id: asset_id.to_string(),
            step,
            status: err.status().map(|s| s.as_u16()),
            message,
        }
    }

    /// Build a transport error from a non-success status and response body.
    pub fn status(asset_id: &str, step: Step, status: u16, body: impl Into<String>) -> Self {
        Error::Transport {
            asset_id: asset_id.to_string(),
            step,
            status: Some(status),
            message: body.into(),
        }
    }

    pub fn protocol(asset_id: &str, step: Step, message: impl Into<String>) -> Self {
        Error::Protocol {
            asset_id: asset_id.to_string(),
            step,
            message: message.into(),
        }
    }

    pub fn content(asset_id: &str, message: impl Into<String>) -> Self {
        Error::Content {
            asset_id: asset_id.to_string(),
            message: message.into(),
        }
    }

    /// Whether the failed item should be skipped rather than treated as an
    /// aborted acquisition.
    #[must_use]
    pub fn is_content(&self) -> bool {
        matches!(self, Error::Content { .. })
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" with status {}", s))
        .unwrap_or_default()
}

/// Result type alias for wvkeys operations.
pub type Result<T> = std::result::Result<T, Error>;
