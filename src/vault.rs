//! Key vault: content keys indexed by init data fingerprint.
//!
//! Entries never expire. Once keys for a fingerprint are stored, every later
//! acquisition of the same protected content is served from here without
//! touching the license server; removing an entry is an operator action.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::ContentKey;
use crate::pssh::Fingerprint;
use crate::utils::ensure_parent_dir;

/// Version tag written into vault files.
const VAULT_VERSION: u32 = 1;

/// Content-addressed key store.
///
/// Stores are idempotent: two workers racing to store the same fingerprint
/// carry identical key material, so either write may win.
pub trait KeyVault: Send + Sync {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<ContentKey>>>;

    fn store(&self, fingerprint: &Fingerprint, keys: &[ContentKey]) -> Result<()>;

    /// Remove an entry; returns whether it existed.
    fn remove(&self, fingerprint: &Fingerprint) -> Result<bool>;

    fn fingerprints(&self) -> Result<Vec<Fingerprint>>;
}

impl<V: KeyVault + ?Sized> KeyVault for Arc<V> {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<ContentKey>>> {
        (**self).lookup(fingerprint)
    }

    fn store(&self, fingerprint: &Fingerprint, keys: &[ContentKey]) -> Result<()> {
        (**self).store(fingerprint, keys)
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<bool> {
        (**self).remove(fingerprint)
    }

    fn fingerprints(&self) -> Result<Vec<Fingerprint>> {
        (**self).fingerprints()
    }
}

/// In-process vault.
#[derive(Debug, Default)]
pub struct MemoryKeyVault {
    entries: RwLock<HashMap<Fingerprint, Vec<ContentKey>>>,
}

impl MemoryKeyVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyVault for MemoryKeyVault {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<ContentKey>>> {
        Ok(self.entries.read().get(fingerprint).cloned())
    }

    fn store(&self, fingerprint: &Fingerprint, keys: &[ContentKey]) -> Result<()> {
        self.entries.write().insert(fingerprint.clone(), keys.to_vec());
        Ok(())
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.entries.write().remove(fingerprint).is_some())
    }

    fn fingerprints(&self) -> Result<Vec<Fingerprint>> {
        let mut out: Vec<_> = self.entries.read().keys().cloned().collect();
        out.sort();
        Ok(out)
    }
}

/// A stored vault entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultEntry {
    pub keys: Vec<ContentKey>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultFile {
    version: u32,
    entries: BTreeMap<Fingerprint, VaultEntry>,
}

/// JSON-file backed vault.
///
/// The whole document is held in memory and rewritten on every change via a
/// temporary file and rename, so a crash mid-write leaves the previous file
/// intact. Writes happen under the entry lock, which serializes concurrent
/// stores.
#[derive(Debug)]
pub struct FileKeyVault {
    path: PathBuf,
    entries: RwLock<BTreeMap<Fingerprint, VaultEntry>>,
}

impl FileKeyVault {
    /// Open a vault file, starting empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let data = std::fs::read(&path)?;
            let file: VaultFile = serde_json::from_slice(&data).map_err(|e| {
                Error::Vault(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            if file.version != VAULT_VERSION {
                return Err(Error::Vault(format!(
                    "Unsupported vault version {} in {}",
                    file.version,
                    path.display()
                )));
            }
            file.entries
        } else {
            BTreeMap::new()
        };
        debug!("Opened key vault {} ({} entries)", path.display(), entries.len());

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Default vault location under the user's data directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("wvkeys").join("keys.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full entry including the time it was stored.
    pub fn entry(&self, fingerprint: &Fingerprint) -> Option<VaultEntry> {
        self.entries.read().get(fingerprint).cloned()
    }

    fn persist(&self, entries: &BTreeMap<Fingerprint, VaultEntry>) -> Result<()> {
        let file = VaultFileRef {
            version: VAULT_VERSION,
            entries,
        };
        let data = serde_json::to_vec_pretty(&file)?;

        ensure_parent_dir(&self.path)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Persist `next`, then make it the in-memory state. The map is left
    /// untouched when the write fails.
    fn commit(
        &self,
        entries: &mut BTreeMap<Fingerprint, VaultEntry>,
        next: BTreeMap<Fingerprint, VaultEntry>,
    ) -> Result<()> {
        self.persist(&next)
            .map_err(|e| Error::Vault(format!("Failed to write {}: {}", self.path.display(), e)))?;
        *entries = next;
        Ok(())
    }
}

#[derive(Serialize)]
struct VaultFileRef<'a> {
    version: u32,
    entries: &'a BTreeMap<Fingerprint, VaultEntry>,
}

impl KeyVault for FileKeyVault {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<ContentKey>>> {
        Ok(self.entries.read().get(fingerprint).map(|e| e.keys.clone()))
    }

    fn store(&self, fingerprint: &Fingerprint, keys: &[ContentKey]) -> Result<()> {
        let mut entries = self.entries.write();
        let mut next = entries.clone();
        next.insert(
            fingerprint.clone(),
            VaultEntry {
                keys: keys.to_vec(),
                stored_at: Utc::now(),
            },
        );
        self.commit(&mut entries, next)
    }

    fn remove(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let mut entries = self.entries.write();
        if !entries.contains_key(fingerprint) {
            return Ok(false);
        }
        let mut next = entries.clone();
        next.remove(fingerprint);
        self.commit(&mut entries, next)?;
        Ok(true)
    }

    fn fingerprints(&self) -> Result<Vec<Fingerprint>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}
