//! Two-round license exchange with vault short-circuit.
//!
//! For each distinct init data the vault is consulted first. On a miss the
//! license server is called twice: once with the service certificate
//! challenge to obtain its certificate, then with the CDM challenge to obtain
//! the license. Keys read back from the session are stored before returning.
use serde::Serialize;

use crate::cdm::{Cdm, CdmSession, SERVICE_CERTIFICATE_CHALLENGE};
use crate::error::{Error, Result, Step};
use crate::key::ContentKey;
use crate::license::LicenseExchange;
use crate::pssh::{distinct_init_data, Fingerprint, ProtectionInitData};
use crate::vault::KeyVault;

/// Keys resolved for one init data value.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub fingerprint: Fingerprint,
    pub keys: Vec<ContentKey>,
    /// Whether the keys came from the vault.
    pub cached: bool,
}

/// An init data value whose exchange failed.
#[derive(Debug, Clone, Serialize)]
pub struct KeyFailure {
    pub fingerprint: Fingerprint,
    pub step: Step,
    pub reason: String,
}

/// Outcome of resolving a set of init data values independently.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub resolved: Vec<Resolved>,
    pub failures: Vec<KeyFailure>,
}

/// Resolves content keys through a vault and a CDM.
pub struct KeyResolver<C, V> {
    cdm: C,
    vault: V,
}

impl<C: Cdm, V: KeyVault> KeyResolver<C, V> {
    pub fn new(cdm: C, vault: V) -> Self {
        Self { cdm, vault }
    }

    pub fn cdm(&self) -> &C {
        &self.cdm
    }

    pub fn vault(&self) -> &V {
        &self.vault
    }

    /// Resolve keys for one init data value.
    ///
    /// A vault hit issues no license calls. A miss issues exactly two.
    pub fn resolve<L: LicenseExchange + ?Sized>(
        &self,
        asset_id: &str,
        license: &L,
        init_data: &ProtectionInitData,
        key_uri: &str,
    ) -> Result<Resolved> {
        self.try_resolve(asset_id, license, init_data, key_uri)
            .map_err(|(step, err)| match err {
                Error::Transport { .. } | Error::Protocol { .. } => err,
                other => Error::KeyExchange {
                    asset_id: asset_id.to_string(),
                    fingerprint: init_data.fingerprint().to_string(),
                    step,
                    message: other.to_string(),
                },
            })
    }

    /// Resolve every distinct value in `init_data`; a failure for one
    /// fingerprint does not stop the others.
    pub fn resolve_all<L, F>(
        &self,
        asset_id: &str,
        license: &L,
        init_data: &[ProtectionInitData],
        key_uri: F,
    ) -> Resolution
    where
        L: LicenseExchange + ?Sized,
        F: Fn(&ProtectionInitData) -> String,
    {
        let mut resolution = Resolution::default();
        for data in distinct_init_data(init_data) {
            let uri = key_uri(&data);
            match self.try_resolve(asset_id, license, &data, &uri) {
                Ok(resolved) => resolution.resolved.push(resolved),
                Err((step, err)) => {
                    let fingerprint = data.fingerprint();
                    warn!("[{}] {} failed for {}: {}", asset_id, step, fingerprint, err);
                    resolution.failures.push(KeyFailure {
                        fingerprint,
                        step,
                        reason: err.to_string(),
                    });
                }
            }
        }
        resolution
    }

    fn try_resolve<L: LicenseExchange + ?Sized>(
        &self,
        asset_id: &str,
        license: &L,
        init_data: &ProtectionInitData,
        key_uri: &str,
    ) -> std::result::Result<Resolved, (Step, Error)> {
        let fingerprint = init_data.fingerprint();

        if let Some(keys) = self
            .vault
            .lookup(&fingerprint)
            .map_err(|e| (Step::Vault, e))?
        {
            debug!("[{}] Using keys found in vault for {}", asset_id, fingerprint);
            return Ok(Resolved {
                fingerprint,
                keys,
                cached: true,
            });
        }

        info!("[{}] Requesting keys for {}", asset_id, fingerprint);
        let keys = self.exchange(asset_id, license, init_data, key_uri)?;

        self.vault
            .store(&fingerprint, &keys)
            .map_err(|e| (Step::Vault, e))?;
        debug!("[{}] Stored {} key(s) for {}", asset_id, keys.len(), fingerprint);

        Ok(Resolved {
            fingerprint,
            keys,
            cached: false,
        })
    }

    fn exchange<L: LicenseExchange + ?Sized>(
        &self,
        asset_id: &str,
        license: &L,
        init_data: &ProtectionInitData,
        key_uri: &str,
    ) -> std::result::Result<Vec<ContentKey>, (Step, Error)> {
        let certificate = license
            .request_license(asset_id, key_uri, SERVICE_CERTIFICATE_CHALLENGE)
            .map_err(|e| (Step::Certificate, e))?;

        let mut session = self
            .cdm
            .new_session(init_data, &certificate)
            .map_err(|e| (Step::Challenge, e))?;
        let challenge = session.challenge().map_err(|e| (Step::Challenge, e))?;

        let response = license
            .request_license(asset_id, key_uri, &challenge)
            .map_err(|e| (Step::License, e))?;

        session
            .accept_license(&response)
            .map_err(|e| (Step::AcceptLicense, e))?;

        let keys: Vec<ContentKey> = session
            .keys()
            .map_err(|e| (Step::Keys, e))?
            .into_iter()
            .filter(ContentKey::is_content)
            .collect();
        if keys.is_empty() {
            return Err((
                Step::Keys,
                Error::Cdm("License carried no content keys".to_string()),
            ));
        }
        Ok(keys)
    }
}
