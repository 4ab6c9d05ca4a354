//! Content Decryption Module boundary.
//!
//! The CDM turns init data plus a service certificate into a license
//! challenge, and a license response into content keys. This crate only
//! sequences those calls; any backend (remote API, local device, hardware)
//! plugs in by implementing [`Cdm`].
use crate::error::Result;
use crate::key::ContentKey;
use crate::pssh::ProtectionInitData;

/// Service certificate request payload (`CAQ=` in base64).
///
/// Sent as the challenge of the first license round; the license server
/// answers it with its service certificate instead of a license.
pub const SERVICE_CERTIFICATE_CHALLENGE: &[u8] = b"\x08\x04";

/// A CDM able to open license sessions.
pub trait Cdm: Send + Sync {
    type Session: CdmSession;

    /// Open a session for `init_data` using the license server's service
    /// certificate.
    fn new_session(
        &self,
        init_data: &ProtectionInitData,
        service_certificate: &[u8],
    ) -> Result<Self::Session>;
}

/// One license exchange worth of CDM state.
pub trait CdmSession {
    /// Produce the license request message to send to the license server.
    fn challenge(&mut self) -> Result<Vec<u8>>;

    /// Feed the license server's response into the session.
    fn accept_license(&mut self, license: &[u8]) -> Result<()>;

    /// Keys loaded by [`CdmSession::accept_license`].
    fn keys(&self) -> Result<Vec<ContentKey>>;
}

impl<C: Cdm + ?Sized> Cdm for std::sync::Arc<C> {
    type Session = C::Session;

    fn new_session(
        &self,
        init_data: &ProtectionInitData,
        service_certificate: &[u8],
    ) -> Result<Self::Session> {
        (**self).new_session(init_data, service_certificate)
    }
}
