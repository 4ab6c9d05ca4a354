//! In-process fakes for the network and CDM boundaries.
use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use uuid::Uuid;

use crate::cdm::{Cdm, CdmSession, SERVICE_CERTIFICATE_CHALLENGE};
use crate::error::{Error, Result, Step};
use crate::key::ContentKey;
use crate::license::LicenseExchange;
use crate::playback::{CatalogApi, PlaybackDescriptor};
use crate::pssh::{Fingerprint, ProtectionInitData};

pub const FAKE_CERTIFICATE: &[u8] = b"service certificate";
const CHALLENGE_PREFIX: &[u8] = b"challenge:";
const LICENSE_PREFIX: &[u8] = b"license:";

/// The CONTENT key [`FakeCdm`] yields for `init_data`.
pub fn fake_content_key(init_data: &ProtectionInitData) -> ContentKey {
    let bytes = init_data.as_bytes();
    let kid = ContentKey::kid_to_uuid(&bytes[bytes.len().saturating_sub(16)..]);
    let key = bytes.iter().rev().take(16).copied().collect();
    ContentKey::content(kid, key)
}

/// License server answering the certificate round with
/// [`FAKE_CERTIFICATE`] and the license round with an echo of the challenge.
#[derive(Debug, Default)]
pub struct FakeLicense {
    pub calls: AtomicUsize,
    fail_license: bool,
}

impl FakeLicense {
    /// Answer the license round with a 403.
    pub fn failing_license() -> Self {
        Self {
            fail_license: true,
            ..Self::default()
        }
    }
}

impl LicenseExchange for FakeLicense {
    fn request_license(&self, asset_id: &str, _key_uri: &str, challenge: &[u8]) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if challenge == SERVICE_CERTIFICATE_CHALLENGE {
            return Ok(FAKE_CERTIFICATE.to_vec());
        }
        if self.fail_license {
            return Err(Error::status(asset_id, Step::License, 403, "forbidden"));
        }
        let payload = challenge
            .strip_prefix(CHALLENGE_PREFIX)
            .ok_or_else(|| Error::protocol(asset_id, Step::License, "unexpected challenge"))?;
        Ok([LICENSE_PREFIX, payload].concat())
    }
}

/// CDM whose sessions reject licenses for chosen fingerprints.
#[derive(Debug, Default)]
pub struct FakeCdm {
    rejected: HashSet<Fingerprint>,
    pub sessions: AtomicUsize,
}

impl FakeCdm {
    pub fn rejecting(fingerprints: impl IntoIterator<Item = Fingerprint>) -> Self {
        Self {
            rejected: fingerprints.into_iter().collect(),
            ..Self::default()
        }
    }
}

impl Cdm for FakeCdm {
    type Session = FakeSession;

    fn new_session(
        &self,
        init_data: &ProtectionInitData,
        service_certificate: &[u8],
    ) -> Result<FakeSession> {
        if service_certificate != FAKE_CERTIFICATE {
            return Err(Error::Cdm("Unknown service certificate".to_string()));
        }
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession {
            reject: self.rejected.contains(&init_data.fingerprint()),
            init_data: init_data.clone(),
            accepted: false,
        })
    }
}

#[derive(Debug)]
pub struct FakeSession {
    init_data: ProtectionInitData,
    reject: bool,
    accepted: bool,
}

impl CdmSession for FakeSession {
    fn challenge(&mut self) -> Result<Vec<u8>> {
        Ok([CHALLENGE_PREFIX, self.init_data.as_bytes()].concat())
    }

    fn accept_license(&mut self, license: &[u8]) -> Result<()> {
        if self.reject {
            return Err(Error::Cdm("License signature mismatch".to_string()));
        }
        if license.strip_prefix(LICENSE_PREFIX) != Some(self.init_data.as_bytes()) {
            return Err(Error::Cdm("License does not match session".to_string()));
        }
        self.accepted = true;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<ContentKey>> {
        if !self.accepted {
            return Err(Error::Cdm("No license loaded".to_string()));
        }
        Ok(vec![
            ContentKey::new("SIGNING", Uuid::nil(), vec![0; 32]),
            fake_content_key(&self.init_data),
        ])
    }
}

/// Catalog serving canned descriptors and playlists.
#[derive(Debug, Default)]
pub struct FakeCatalog {
    pub descriptors: HashMap<String, PlaybackDescriptor>,
    pub playlists: HashMap<String, String>,
    pub license: FakeLicense,
}

impl FakeCatalog {
    pub fn with_descriptor(mut self, asset_id: &str, descriptor: PlaybackDescriptor) -> Self {
        self.descriptors.insert(asset_id.to_string(), descriptor);
        self
    }

    pub fn with_playlist(mut self, url: &str, body: &str) -> Self {
        self.playlists.insert(url.to_string(), body.to_string());
        self
    }
}

impl<'a> CatalogApi for &'a FakeCatalog {
    type License = &'a FakeLicense;

    fn web_playback(&self, asset_id: &str) -> Result<PlaybackDescriptor> {
        self.descriptors
            .get(asset_id)
            .cloned()
            .ok_or_else(|| Error::status(asset_id, Step::WebPlayback, 404, "not found"))
    }

    fn fetch_playlist(&self, asset_id: &str, url: &str) -> Result<Vec<u8>> {
        self.playlists
            .get(url)
            .map(|body| body.as_bytes().to_vec())
            .ok_or_else(|| Error::status(asset_id, Step::Playlist, 404, url))
    }

    fn license_client(&self, _license_url: &str) -> &'a FakeLicense {
        let catalog: &'a FakeCatalog = *self;
        &catalog.license
    }
}

/// Answer one HTTP request on a local port with `status` (e.g.
/// `"403 Forbidden"`) and `body`. Returns the base URL.
pub fn serve_once(status: &str, body: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind local listener");
    let addr = listener.local_addr().expect("local address");
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            read_request(&mut stream);
            let _ = stream.write_all(response.as_bytes());
        }
    });
    format!("http://{}", addr)
}

/// Accept one connection and never answer it. Returns the base URL.
pub fn serve_silently() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind local listener");
    let addr = listener.local_addr().expect("local address");
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            // Drains until the client gives up and closes.
            let _ = io::copy(&mut stream, &mut io::sink());
        }
    });
    format!("http://{}", addr)
}

fn read_request(stream: &mut TcpStream) {
    let mut reader = BufReader::new(stream);
    let mut content_length = 0;
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0; content_length];
    let _ = reader.read_exact(&mut body);
}
