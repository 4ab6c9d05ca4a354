//! Remote CDM client for pywidevine serve-compatible APIs.
//!
//! The device keys live on the remote server; this client only forwards init
//! data, certificates and license messages, so it satisfies the [`Cdm`]
//! boundary without any local cryptography.
use std::time::Duration;

use base64::Engine;
use reqwest::blocking::Client;
use serde::Deserialize;

use crate::cdm::{Cdm, CdmSession};
use crate::config::RemoteCdmConfig;
use crate::error::{Error, Result};
use crate::key::ContentKey;
use crate::pssh::ProtectionInitData;

/// License type requested from the remote CDM.
const LICENSE_TYPE: &str = "STREAMING";

/// Remote-accessible CDM wrapper.
#[derive(Debug, Clone)]
pub struct RemoteCdm {
    /// Expected Widevine system id.
    pub system_id: u32,
    /// Expected security level.
    pub security_level: u8,
    host: String,
    secret: String,
    device_name: String,
    client: Client,
}

impl RemoteCdm {
    /// Create a new RemoteCdm client and verify server version.
    ///
    /// The server must advertise a `pywidevine serve vX.Y.Z` header and the
    /// version must be >= 1.4.3.
    pub fn new(config: &RemoteCdmConfig, timeout: Duration) -> Result<Self> {
        let host = config.host.trim_end_matches('/').to_string();

        let client = Client::builder()
            .user_agent("wvkeys")
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Cdm(format!("Failed to build HTTP client: {}", e)))?;

        let response = client
            .head(&host)
            .header("X-Secret-Key", &config.secret)
            .send()
            .map_err(|e| Error::Cdm(format!("Failed to contact server: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Cdm(format!(
                "Server did not respond successfully: {}",
                response.status()
            )));
        }

        if let Some(server_str) = response
            .headers()
            .get("Server")
            .and_then(|h| h.to_str().ok())
        {
            let server_lower = server_str.to_lowercase();
            let marker = "pywidevine serve v";
            if !server_lower.contains(marker) {
                return Err(Error::Cdm(format!(
                    "Remote API does not appear to be pywidevine serve ({})",
                    server_str
                )));
            }
            if let Some(version) = extract_version(&server_lower, marker) {
                if !version_at_least(&version, "1.4.3") {
                    return Err(Error::Cdm(format!(
                        "Remote API version {} is not supported",
                        version
                    )));
                }
            }
        }

        Ok(Self {
            system_id: config.system_id,
            security_level: config.security_level,
            host,
            secret: config.secret.clone(),
            device_name: config.device.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.host, self.device_name, path)
    }

    fn call<T: serde::de::DeserializeOwned>(
        &self,
        what: &str,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<Option<T>> {
        let response: ApiResponse<T> = request
            .header("X-Secret-Key", &self.secret)
            .send()
            .map_err(|e| Error::Cdm(format!("Failed to {}: {}", what, e)))?
            .json()
            .map_err(|e| Error::Cdm(format!("Invalid response to {}: {}", what, e)))?;

        if response.status != 200 {
            return Err(Error::Cdm(format!(
                "Cannot {}: {}",
                what, response.message
            )));
        }
        Ok(response.data)
    }

    /// Open a remote session and return session id.
    pub fn open(&self) -> Result<Vec<u8>> {
        let data: OpenResponse = self
            .call("open session", self.client.get(self.url("open")))?
            .ok_or_else(|| Error::Cdm("Missing response data".to_string()))?;

        if data.device.system_id != self.system_id
            || data.device.security_level != self.security_level
        {
            return Err(Error::Cdm(format!(
                "Device metadata mismatch: expected {} L{}, server has {} L{}",
                self.system_id,
                self.security_level,
                data.device.system_id,
                data.device.security_level
            )));
        }

        hex::decode(data.session_id).map_err(|e| Error::Cdm(format!("Invalid session id: {}", e)))
    }

    /// Close a remote session.
    pub fn close(&self, session_id: &[u8]) -> Result<()> {
        let path = format!("close/{}", hex::encode(session_id));
        self.call::<serde_json::Value>("close session", self.client.get(self.url(&path)))?;
        Ok(())
    }

    /// Set the service certificate for a remote session, returning the
    /// provider id it names.
    pub fn set_service_certificate(&self, session_id: &[u8], certificate: &[u8]) -> Result<String> {
        let request = self
            .client
            .post(self.url("set_service_certificate"))
            .json(&serde_json::json!({
                "session_id": hex::encode(session_id),
                "certificate": base64::engine::general_purpose::STANDARD.encode(certificate),
            }));
        let data: ProviderResponse = self
            .call("set service certificate", request)?
            .ok_or_else(|| Error::Cdm("Missing response data".to_string()))?;
        Ok(data.provider_id)
    }

    /// Request a license challenge from the remote server.
    pub fn get_license_challenge(
        &self,
        session_id: &[u8],
        init_data: &ProtectionInitData,
        privacy_mode: bool,
    ) -> Result<Vec<u8>> {
        let request = self
            .client
            .post(self.url(&format!("get_license_challenge/{}", LICENSE_TYPE)))
            .json(&serde_json::json!({
                "session_id": hex::encode(session_id),
                "init_data": init_data.to_base64(),
                "privacy_mode": privacy_mode,
            }));
        let data: ChallengeResponse = self
            .call("get license challenge", request)?
            .ok_or_else(|| Error::Cdm("Missing response data".to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.decode(data.challenge_b64)?)
    }

    /// Submit a license response to the remote server.
    pub fn parse_license(&self, session_id: &[u8], license_message: &[u8]) -> Result<()> {
        let request = self.client.post(self.url("parse_license")).json(&serde_json::json!({
            "session_id": hex::encode(session_id),
            "license_message": base64::engine::general_purpose::STANDARD.encode(license_message),
        }));
        self.call::<serde_json::Value>("parse license", request)?;
        Ok(())
    }

    /// Fetch decrypted keys from the remote server.
    pub fn get_keys(&self, session_id: &[u8]) -> Result<Vec<ContentKey>> {
        let request = self.client.post(self.url("get_keys/ALL")).json(&serde_json::json!({
            "session_id": hex::encode(session_id),
        }));
        let data: KeysResponse = self
            .call("get keys", request)?
            .ok_or_else(|| Error::Cdm("Missing response data".to_string()))?;

        data.keys
            .into_iter()
            .map(|k| {
                let kid = hex::decode(&k.key_id)
                    .map_err(|e| Error::Cdm(format!("Invalid key id {}: {}", k.key_id, e)))?;
                let key = hex::decode(&k.key)
                    .map_err(|e| Error::Cdm(format!("Invalid key for {}: {}", k.key_id, e)))?;
                Ok(ContentKey::new(k.r#type, ContentKey::kid_to_uuid(&kid), key))
            })
            .collect()
    }
}

impl Cdm for RemoteCdm {
    type Session = RemoteSession;

    fn new_session(
        &self,
        init_data: &ProtectionInitData,
        service_certificate: &[u8],
    ) -> Result<RemoteSession> {
        let session_id = self.open()?;
        let session = RemoteSession {
            cdm: self.clone(),
            session_id,
            init_data: init_data.clone(),
        };
        let provider_id = session
            .cdm
            .set_service_certificate(&session.session_id, service_certificate)?;
        debug!("Set service certificate: {}", provider_id);
        Ok(session)
    }
}

/// An open session on a [`RemoteCdm`]; closed on drop.
#[derive(Debug)]
pub struct RemoteSession {
    cdm: RemoteCdm,
    session_id: Vec<u8>,
    init_data: ProtectionInitData,
}

impl CdmSession for RemoteSession {
    fn challenge(&mut self) -> Result<Vec<u8>> {
        self.cdm
            .get_license_challenge(&self.session_id, &self.init_data, true)
    }

    fn accept_license(&mut self, license: &[u8]) -> Result<()> {
        self.cdm.parse_license(&self.session_id, license)
    }

    fn keys(&self) -> Result<Vec<ContentKey>> {
        self.cdm.get_keys(&self.session_id)
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if let Err(e) = self.cdm.close(&self.session_id) {
            warn!("Failed to close CDM session {}: {}", hex::encode(&self.session_id), e);
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: i32,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct OpenResponse {
    session_id: String,
    device: DeviceInfo,
}

#[derive(Debug, Deserialize)]
struct DeviceInfo {
    system_id: u32,
    security_level: u8,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    provider_id: String,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    challenge_b64: String,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    keys: Vec<KeyResponse>,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    key_id: String,
    key: String,
    r#type: String,
}

fn extract_version(server: &str, marker: &str) -> Option<String> {
    server
        .find(marker)
        .map(|idx| server[idx + marker.len()..].trim().to_string())
}

fn version_at_least(version: &str, minimum: &str) -> bool {
    let parse = |v: &str| {
        v.split('.')
            .filter_map(|s| s.parse::<u32>().ok())
            .collect::<Vec<_>>()
    };
    let v = parse(version);
    let m = parse(minimum);
    for i in 0..m.len().max(v.len()) {
        let a = *v.get(i).unwrap_or(&0);
        let b = *m.get(i).unwrap_or(&0);
        if a != b {
            return a > b;
        }
    }
    true
}
