//! Content key representation.
//!
//! Keys come out of a CDM session after a license has been accepted and are
//! persisted in the key vault as `kid:key` hex pairs plus their type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Key type name for content decryption keys.
pub const CONTENT_KEY_TYPE: &str = "CONTENT";

/// A decrypted key returned by a CDM session.
///
/// Key type names use the license protocol enum string values (e.g. CONTENT).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentKey {
    /// Key type (e.g., CONTENT, SIGNING, etc.).
    #[serde(rename = "type")]
    pub key_type: String,
    /// Key ID as UUID.
    #[serde(with = "kid_hex")]
    pub kid: Uuid,
    /// Decrypted key bytes.
    #[serde(with = "hex")]
    pub key: Vec<u8>,
}

impl ContentKey {
    pub fn new(key_type: impl Into<String>, kid: Uuid, key: Vec<u8>) -> Self {
        Self {
            key_type: key_type.into(),
            kid,
            key,
        }
    }

    /// Create a CONTENT key.
    pub fn content(kid: Uuid, key: Vec<u8>) -> Self {
        Self::new(CONTENT_KEY_TYPE, kid, key)
    }

    #[must_use]
    pub fn is_content(&self) -> bool {
        self.key_type == CONTENT_KEY_TYPE
    }

    /// Convert a Key ID to a UUID.
    ///
    /// Handles various formats:
    /// - 16 bytes: direct UUID bytes
    /// - 32 bytes: hex-encoded UUID string
    /// - Decimal ASCII bytes: parsed as integer
    /// - Other lengths: padded or truncated to 16 bytes
    pub fn kid_to_uuid(kid: &[u8]) -> Uuid {
        if kid.is_empty() {
            return Uuid::nil();
        }

        if let Ok(s) = std::str::from_utf8(kid) {
            if s.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(n) = s.parse::<u128>() {
                    return Uuid::from_u128(n);
                }
            }
        }

        if kid.len() == 16 {
            return Uuid::from_slice(kid).unwrap_or_else(|_| Uuid::nil());
        }

        if kid.len() == 32 {
            if let Ok(s) = std::str::from_utf8(kid) {
                if let Ok(uuid) = Uuid::parse_str(s) {
                    return uuid;
                }
            }
        }

        let mut padded = [0u8; 16];
        let len = kid.len().min(16);
        padded[..len].copy_from_slice(&kid[..len]);
        Uuid::from_bytes(padded)
    }
}

/// `kid_hex:key_hex`, the form decryption tools take on the command line.
impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kid.as_simple(), hex::encode(&self.key))
    }
}

impl FromStr for ContentKey {
    type Err = Error;

    /// Parse a `kid_hex:key_hex` pair as a CONTENT key.
    fn from_str(s: &str) -> Result<Self> {
        let (kid, key) = s
            .split_once(':')
            .ok_or_else(|| Error::DecodeError(format!("Expected kid:key, got {:?}", s)))?;
        let kid = Uuid::parse_str(kid)
            .map_err(|e| Error::DecodeError(format!("Invalid key ID {:?}: {}", kid, e)))?;
        let key = hex::decode(key)
            .map_err(|e| Error::DecodeError(format!("Invalid key {:?}: {}", key, e)))?;
        Ok(Self::content(kid, key))
    }
}

mod kid_hex {
    use serde::{Deserialize, Deserializer, Serializer};
    use uuid::Uuid;

    pub fn serialize<S: Serializer>(kid: &Uuid, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&kid.as_simple())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Uuid, D::Error> {
        let s = String::deserialize(deserializer)?;
        Uuid::parse_str(&s).map_err(serde::de::Error::custom)
    }
}
