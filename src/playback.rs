//! Playback descriptor lookup and the HTTP clients built from configuration.
use reqwest::blocking::Client;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result, Step};
use crate::license::{LicenseClient, LicenseExchange};

/// Webplayback endpoint returning playback descriptors.
pub const WEBPLAYBACK_URL: &str = "https://play.itunes.apple.com/WebObjects/MZPlay.woa/wa/webPlayback";

/// Flavor of the only audio asset this crate can decrypt.
pub const AUDIO_FLAVOR: &str = "28:ctrp256";

const ORIGIN: &str = "https://music.apple.com";
const REFERER: &str = "https://music.apple.com/";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/110.0.0.0 Safari/537.36";

#[derive(Debug, Deserialize)]
struct WebPlaybackResponse {
    #[serde(rename = "songList", default)]
    song_list: Vec<PlaybackDescriptor>,
    #[serde(rename = "failureType")]
    failure_type: Option<serde_json::Value>,
    #[serde(rename = "customerMessage")]
    customer_message: Option<String>,
}

/// Playback information for one catalog item.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaybackDescriptor {
    /// Master playlist of a video.
    #[serde(rename = "hls-playlist-url")]
    pub hls_playlist_url: Option<String>,
    /// License URL scoped to this playback session.
    #[serde(rename = "hls-key-server-url")]
    pub hls_key_server_url: Option<String>,
    /// Encoded audio variants.
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// One encoded variant of an audio item.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Asset {
    pub flavor: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(default)]
    pub metadata: AssetMetadata,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AssetMetadata {
    #[serde(rename = "discCount", default)]
    pub disc_count: Option<u32>,
}

/// What a descriptor offers, decided once per acquisition.
#[derive(Debug, Clone)]
pub enum PlaybackAsset {
    Video { playlist_url: String },
    Audio(Asset),
    /// Nothing streamable; the item is skipped.
    Unavailable,
}

impl PlaybackDescriptor {
    /// Classify the descriptor.
    ///
    /// An audio asset list without the [`AUDIO_FLAVOR`] variant is a content
    /// error, not an unavailable item.
    pub fn asset(&self, asset_id: &str) -> Result<PlaybackAsset> {
        if let Some(url) = &self.hls_playlist_url {
            return Ok(PlaybackAsset::Video {
                playlist_url: url.clone(),
            });
        }
        if self.assets.is_empty() {
            return Ok(PlaybackAsset::Unavailable);
        }
        self.assets
            .iter()
            .find(|asset| asset.flavor == AUDIO_FLAVOR)
            .cloned()
            .map(PlaybackAsset::Audio)
            .ok_or_else(|| Error::content(asset_id, format!("Failed to find {} asset", AUDIO_FLAVOR)))
    }

    pub fn license_url(&self, asset_id: &str) -> Result<&str> {
        self.hls_key_server_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::protocol(asset_id, Step::WebPlayback, "missing hls-key-server-url"))
    }
}

/// Catalog-side calls made during an acquisition.
pub trait CatalogApi: Send + Sync {
    type License: LicenseExchange;

    fn web_playback(&self, asset_id: &str) -> Result<PlaybackDescriptor>;

    fn fetch_playlist(&self, asset_id: &str, url: &str) -> Result<Vec<u8>>;

    /// License client bound to the license URL of one acquisition.
    fn license_client(&self, license_url: &str) -> Self::License;
}

/// HTTP implementation of [`CatalogApi`].
#[derive(Debug, Clone)]
pub struct PlaybackClient {
    api: Client,
    cdn: Client,
    webplayback_url: String,
}

impl PlaybackClient {
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(header::ORIGIN, HeaderValue::from_static(ORIGIN));
        headers.insert(header::REFERER, HeaderValue::from_static(REFERER));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json;charset=utf-8"),
        );
        headers.insert(
            header::AUTHORIZATION,
            header_value(&format!("Bearer {}", config.access_token))?,
        );
        headers.insert("media-user-token", header_value(&config.media_user_token)?);

        let api = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))?;
        let cdn = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api,
            cdn,
            webplayback_url: WEBPLAYBACK_URL.to_string(),
        })
    }

    /// Point webplayback requests somewhere else.
    pub fn with_webplayback_url(mut self, url: impl Into<String>) -> Self {
        self.webplayback_url = url.into();
        self
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Other(format!("Invalid header value: {}", e)))
}

impl CatalogApi for PlaybackClient {
    type License = LicenseClient;

    fn web_playback(&self, asset_id: &str) -> Result<PlaybackDescriptor> {
        info!("[{}] Getting webplayback", asset_id);
        let response = self
            .api
            .post(&self.webplayback_url)
            .json(&serde_json::json!({ "salableAdamId": asset_id }))
            .send()
            .map_err(|e| Error::transport(asset_id, Step::WebPlayback, e))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| Error::transport(asset_id, Step::WebPlayback, e))?;
        if !status.is_success() {
            error!("[{}] [{}] webplayback: {}", asset_id, status.as_u16(), body);
            return Err(Error::status(asset_id, Step::WebPlayback, status.as_u16(), body));
        }
        decode_web_playback(asset_id, &body)
    }

    fn fetch_playlist(&self, asset_id: &str, url: &str) -> Result<Vec<u8>> {
        trace!("[{}] GET {}", asset_id, url);
        let response = self
            .cdn
            .get(url)
            .send()
            .map_err(|e| Error::transport(asset_id, Step::Playlist, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::status(asset_id, Step::Playlist, status.as_u16(), body));
        }
        let bytes = response
            .bytes()
            .map_err(|e| Error::transport(asset_id, Step::Playlist, e))?;
        Ok(bytes.to_vec())
    }

    fn license_client(&self, license_url: &str) -> LicenseClient {
        LicenseClient::new(self.api.clone(), license_url)
    }
}

fn decode_web_playback(asset_id: &str, body: &str) -> Result<PlaybackDescriptor> {
    let response: WebPlaybackResponse = serde_json::from_str(body)
        .map_err(|e| Error::protocol(asset_id, Step::WebPlayback, format!("invalid JSON: {}", e)))?;

    if response.failure_type.is_some() {
        let message = response
            .customer_message
            .unwrap_or_else(|| "Unable to get webplayback".to_string());
        return Err(Error::protocol(asset_id, Step::WebPlayback, message));
    }

    response
        .song_list
        .into_iter()
        .next()
        .ok_or_else(|| Error::protocol(asset_id, Step::WebPlayback, "empty songList"))
}
