//! License endpoint client.
//!
//! Both rounds of the exchange go through the same call: the first carries
//! the fixed service certificate challenge, the second the CDM's challenge.
use base64::Engine;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::cdm::SERVICE_CERTIFICATE_CHALLENGE;
use crate::error::{Error, Result, Step};

/// EME key system name sent with every license request.
pub const KEY_SYSTEM: &str = "com.widevine.alpha";

/// One license round trip.
///
/// Implementations must be callable from several workers at once.
pub trait LicenseExchange: Send + Sync {
    /// Send `challenge` for `asset_id`/`key_uri` and return the decoded
    /// `license` payload.
    fn request_license(&self, asset_id: &str, key_uri: &str, challenge: &[u8]) -> Result<Vec<u8>>;
}

impl<L: LicenseExchange + ?Sized> LicenseExchange for &L {
    fn request_license(&self, asset_id: &str, key_uri: &str, challenge: &[u8]) -> Result<Vec<u8>> {
        (**self).request_license(asset_id, key_uri, challenge)
    }
}

#[derive(Debug, Serialize)]
struct LicenseRequest<'a> {
    #[serde(rename = "adamId")]
    adam_id: &'a str,
    challenge: String,
    #[serde(rename = "isLibrary")]
    is_library: bool,
    #[serde(rename = "key-system")]
    key_system: &'a str,
    uri: &'a str,
    #[serde(rename = "user-initiated")]
    user_initiated: bool,
}

impl<'a> LicenseRequest<'a> {
    fn new(asset_id: &'a str, key_uri: &'a str, challenge: &[u8]) -> Self {
        Self {
            adam_id: asset_id,
            challenge: base64::engine::general_purpose::STANDARD.encode(challenge),
            is_library: false,
            key_system: KEY_SYSTEM,
            uri: key_uri,
            user_initiated: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LicenseResponse {
    license: Option<String>,
    errors: Option<serde_json::Value>,
}

/// HTTP client for the license URL of one acquisition.
///
/// The URL comes from the playback descriptor and differs per session, so a
/// new client is built for every acquisition; the underlying HTTP client (and
/// its headers and timeout) is shared.
#[derive(Debug, Clone)]
pub struct LicenseClient {
    http: Client,
    license_url: String,
}

impl LicenseClient {
    pub fn new(http: Client, license_url: impl Into<String>) -> Self {
        Self {
            http,
            license_url: license_url.into(),
        }
    }

    pub fn license_url(&self) -> &str {
        &self.license_url
    }
}

impl LicenseExchange for LicenseClient {
    fn request_license(&self, asset_id: &str, key_uri: &str, challenge: &[u8]) -> Result<Vec<u8>> {
        let step = round_step(challenge);
        trace!("[{}] POST {} ({})", asset_id, self.license_url, step);

        let response = self
            .http
            .post(&self.license_url)
            .json(&LicenseRequest::new(asset_id, key_uri, challenge))
            .send()
            .map_err(|e| Error::transport(asset_id, step, e))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| Error::transport(asset_id, step, e))?;
        if !status.is_success() {
            error!("[{}] [{}] {}: {}", asset_id, status.as_u16(), step, body);
            return Err(Error::status(asset_id, step, status.as_u16(), body));
        }

        decode_license_response(asset_id, step, &body)
    }
}

/// Which round a challenge belongs to, for error reporting.
fn round_step(challenge: &[u8]) -> Step {
    if challenge == SERVICE_CERTIFICATE_CHALLENGE {
        Step::Certificate
    } else {
        Step::License
    }
}

fn decode_license_response(asset_id: &str, step: Step, body: &str) -> Result<Vec<u8>> {
    let response: LicenseResponse = serde_json::from_str(body)
        .map_err(|e| Error::protocol(asset_id, step, format!("invalid JSON: {}", e)))?;

    match response.license {
        Some(license) if !license.is_empty() => base64::engine::general_purpose::STANDARD
            .decode(license)
            .map_err(|e| Error::protocol(asset_id, step, format!("license is not base64: {}", e))),
        _ => {
            let detail = response
                .errors
                .map(|errors| format!(": {}", errors))
                .unwrap_or_default();
            Err(Error::protocol(
                asset_id,
                step,
                format!("unable to get license{}", detail),
            ))
        }
    }
}
