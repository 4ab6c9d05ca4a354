//! PSSH parsing, init data construction and fingerprinting.
//!
//! Audio streams only carry a raw key ID in their key URI, so their init data
//! is synthesized as a `WidevinePsshData` message. Video streams carry a full
//! PSSH box which is taken verbatim. Either way the canonical bytes are what
//! the CDM receives and what the key vault is keyed by.
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use prost::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::key::ContentKey;
use crate::license_protocol::widevine_pssh_data::Algorithm;
use crate::license_protocol::WidevinePsshData;

/// Widevine system UUID.
pub const WIDEVINE_UUID: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);
/// Widevine URN string, as used in HLS `KEYFORMAT` attributes.
pub const WIDEVINE_URN: &str = "urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed";

/// Stable vault key derived from canonical init data bytes.
///
/// This is the standard base64 text of the bytes, so it is readable in the
/// vault file and identical across runs for identical input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    /// Accept a fingerprint typed by an operator, normalizing it through a
    /// decode/encode cycle.
    fn from_str(s: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(s.trim())?;
        if bytes.is_empty() {
            return Err(Error::InvalidInitData("Fingerprint must not be empty".to_string()));
        }
        Ok(Self(base64::engine::general_purpose::STANDARD.encode(bytes)))
    }
}

/// Protection system init data in its canonical binary form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtectionInitData {
    bytes: Vec<u8>,
}

impl ProtectionInitData {
    /// Synthesize audio init data: a `WidevinePsshData` with `AESCTR` and a
    /// single key ID entry.
    pub fn from_key_id(key_id: &[u8]) -> Self {
        let pssh_data = WidevinePsshData {
            algorithm: Some(Algorithm::Aesctr as i32),
            key_ids: vec![key_id.to_vec()],
            ..Default::default()
        };
        Self {
            bytes: pssh_data.encode_to_vec(),
        }
    }

    /// Build audio init data from a `data:;base64,<kid>` key URI.
    pub fn from_audio_key_uri(key_uri: &str) -> Result<Self> {
        let key_id = base64::engine::general_purpose::STANDARD.decode(data_uri_payload(key_uri)?)?;
        if key_id.is_empty() {
            return Err(Error::InvalidInitData(format!(
                "Key URI carries no key ID: {}",
                key_uri
            )));
        }
        Ok(Self::from_key_id(&key_id))
    }

    /// Take video init data verbatim from a `data:text/plain;base64,<pssh>`
    /// key URI.
    pub fn from_video_key_uri(key_uri: &str) -> Result<Self> {
        Self::from_base64(data_uri_payload(key_uri)?)
    }

    /// Wrap base64 init data verbatim.
    pub fn from_base64(data_b64: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(data_b64.trim())?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidInitData("Data must not be empty".to_string()));
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }

    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(self.to_base64())
    }

    /// Key IDs referenced by this init data.
    ///
    /// Video init data is a full `pssh` box; audio init data is the bare
    /// `WidevinePsshData` payload.
    pub fn key_ids(&self) -> Result<Vec<Uuid>> {
        match parse_pssh_box(&self.bytes)? {
            Some(pssh) if !pssh.key_ids.is_empty() => Ok(pssh.key_ids),
            Some(pssh) => widevine_key_ids(pssh.data),
            None => widevine_key_ids(&self.bytes),
        }
    }
}

/// Return the distinct init data values in first-seen order.
///
/// Manifests commonly repeat the same PSSH across variants of different
/// bitrates; each distinct value needs exactly one license exchange.
pub fn distinct_init_data<'a, I>(init_data: I) -> Vec<ProtectionInitData>
where
    I: IntoIterator<Item = &'a ProtectionInitData>,
{
    let mut seen = std::collections::HashSet::new();
    init_data
        .into_iter()
        .filter(|data| seen.insert(data.fingerprint()))
        .cloned()
        .collect()
}

/// Return the payload of a `data:` URI (everything after the last comma).
pub fn data_uri_payload(uri: &str) -> Result<&str> {
    let (_, payload) = uri
        .rsplit_once(',')
        .ok_or_else(|| Error::InvalidInitData(format!("Not a data URI: {}", uri)))?;
    if payload.is_empty() {
        return Err(Error::InvalidInitData(format!("Empty data URI: {}", uri)));
    }
    Ok(payload)
}

/// Header fields of a `pssh` box that key ID extraction needs.
struct PsshBox<'a> {
    key_ids: Vec<Uuid>,
    data: &'a [u8],
}

/// Parse `data` as a `pssh` box; `Ok(None)` when it is not one.
fn parse_pssh_box(data: &[u8]) -> Result<Option<PsshBox<'_>>> {
    if data.len() < 8 || &data[4..8] != b"pssh" {
        return Ok(None);
    }
    let truncated = |what: &str| Error::InvalidInitData(format!("PSSH box truncated at {}", what));

    let size = BigEndian::read_u32(&data[..4]) as usize;
    if size == 1 {
        return Err(Error::InvalidInitData("64-bit PSSH box sizes are not supported".to_string()));
    }
    if size > data.len() {
        return Err(truncated("box size"));
    }
    let header = data.get(8..28).ok_or_else(|| truncated("header"))?;
    let version = header[0];
    let system_id = Uuid::from_slice(&header[4..20])
        .map_err(|_| Error::InvalidInitData("Invalid system ID".to_string()))?;
    if system_id != WIDEVINE_UUID {
        return Err(Error::InvalidInitData(format!(
            "Not a Widevine PSSH box: {}",
            system_id
        )));
    }

    let mut rest = &data[28..];
    let mut key_ids = Vec::new();
    if version == 1 {
        let count = rest.get(..4).ok_or_else(|| truncated("KID count"))?;
        let count = BigEndian::read_u32(count) as usize;
        let kids = rest.get(4..4 + count * 16).ok_or_else(|| truncated("KIDs"))?;
        key_ids = kids.chunks_exact(16).map(ContentKey::kid_to_uuid).collect();
        rest = &rest[4 + count * 16..];
    }

    let length = rest.get(..4).ok_or_else(|| truncated("data size"))?;
    let length = BigEndian::read_u32(length) as usize;
    let data = rest.get(4..4 + length).ok_or_else(|| truncated("data"))?;
    Ok(Some(PsshBox { key_ids, data }))
}

fn widevine_key_ids(data: &[u8]) -> Result<Vec<Uuid>> {
    let pssh_data = WidevinePsshData::decode(data)?;
    Ok(pssh_data
        .key_ids
        .iter()
        .map(|kid| ContentKey::kid_to_uuid(kid))
        .collect())
}
