//! HLS playlist parsing and the stream manifests handed to the download stage.
use std::collections::BTreeMap;

use m3u8_rs::{AlternativeMediaType, MediaPlaylist, Playlist};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::key::ContentKey;
use crate::pssh::{Fingerprint, WIDEVINE_URN};
use crate::resolver::KeyFailure;
use crate::utils::resolve_uri;

/// An `EXT-X-KEY` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyTag {
    pub method: String,
    pub uri: Option<String>,
    pub keyformat: Option<String>,
}

impl KeyTag {
    #[must_use]
    pub fn is_widevine(&self) -> bool {
        self.keyformat
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case(WIDEVINE_URN))
    }
}

/// A single media segment.
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub uri: String,
    pub duration: f32,
    /// `(length, offset)` of an `EXT-X-BYTERANGE`.
    pub byte_range: Option<(u64, u64)>,
}

/// A parsed media playlist.
#[derive(Debug, Clone, Serialize)]
pub struct MediaStream {
    pub url: String,
    pub target_duration: u64,
    /// fMP4 init segment URL (from `EXT-X-MAP`).
    pub init_segment: Option<String>,
    pub segments: Vec<Segment>,
    pub keys: Vec<KeyTag>,
}

impl MediaStream {
    /// Parse a media playlist fetched from `url`.
    pub fn parse(url: &str, data: &[u8]) -> Result<Self> {
        let playlist = match m3u8_rs::parse_playlist_res(data) {
            Ok(Playlist::MediaPlaylist(playlist)) => playlist,
            Ok(Playlist::MasterPlaylist(_)) => {
                return Err(Error::InvalidPlaylist(format!(
                    "Expected a media playlist at {}",
                    url
                )))
            }
            Err(e) => {
                return Err(Error::InvalidPlaylist(format!(
                    "Failed to parse {}: {:?}",
                    url, e
                )))
            }
        };
        Self::from_playlist(url, &playlist, data)
    }

    fn from_playlist(url: &str, playlist: &MediaPlaylist, data: &[u8]) -> Result<Self> {
        let init_segment = playlist
            .segments
            .iter()
            .find_map(|seg| seg.map.as_ref())
            .map(|map| resolve_uri(url, &map.uri))
            .transpose()?;

        let segments = playlist
            .segments
            .iter()
            .map(|seg| {
                Ok(Segment {
                    uri: resolve_uri(url, &seg.uri)?,
                    duration: seg.duration,
                    byte_range: seg
                        .byte_range
                        .as_ref()
                        .map(|br| (br.length, br.offset.unwrap_or(0))),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            url: url.to_string(),
            target_duration: playlist.target_duration,
            init_segment,
            segments,
            keys: scan_key_tags(data),
        })
    }

    /// URI of the Widevine key tag, falling back to the first `data:` key URI
    /// when no tag names a key format.
    pub fn widevine_key_uri(&self) -> Option<&str> {
        self.keys
            .iter()
            .find(|k| k.is_widevine())
            .or_else(|| {
                self.keys.iter().find(|k| {
                    k.keyformat.is_none() && k.uri.as_deref().is_some_and(|u| u.starts_with("data:"))
                })
            })
            .and_then(|k| k.uri.as_deref())
    }
}

/// Collect every `EXT-X-KEY` tag in playlist order.
///
/// m3u8-rs keeps only the last key tag per segment, and services list one
/// tag per DRM system in a row, so the tags are read from the raw text.
fn scan_key_tags(data: &[u8]) -> Vec<KeyTag> {
    String::from_utf8_lossy(data)
        .lines()
        .filter_map(|line| line.trim().strip_prefix("#EXT-X-KEY:"))
        .map(|attrs| {
            let attrs = parse_attribute_list(attrs);
            KeyTag {
                method: attrs.get("METHOD").cloned().unwrap_or_default(),
                uri: attrs.get("URI").cloned(),
                keyformat: attrs.get("KEYFORMAT").cloned(),
            }
        })
        .collect()
}

/// Parse an HLS attribute list (`KEY=VALUE,KEY="quoted, value"`).
fn parse_attribute_list(input: &str) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some((name, after)) = rest.split_once('=') else {
            break;
        };
        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.split_once('"') {
                Some((value, tail)) => (value, tail),
                None => (quoted, ""),
            }
        } else {
            match after.split_once(',') {
                Some((value, tail)) => (value, tail),
                None => (after, ""),
            }
        };
        attrs.insert(name.trim().to_string(), value.to_string());
        rest = remainder.trim_start_matches(',').trim_start();
    }
    attrs
}

/// What a master playlist entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenditionKind {
    Video,
    Audio,
}

/// A variant stream or alternative rendition listed in a master playlist.
#[derive(Debug, Clone, Serialize)]
pub struct VariantRef {
    pub uri: String,
    pub kind: RenditionKind,
    pub bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub resolution: Option<(u64, u64)>,
    pub group_id: Option<String>,
    pub language: Option<String>,
}

/// Parse a master playlist into its playable entries.
///
/// I-frame-only variants are skipped; audio renditions with their own URI
/// are included since they are encrypted separately.
pub fn parse_master(url: &str, data: &[u8]) -> Result<Vec<VariantRef>> {
    let master = match m3u8_rs::parse_playlist_res(data) {
        Ok(Playlist::MasterPlaylist(master)) => master,
        Ok(Playlist::MediaPlaylist(_)) => {
            return Err(Error::InvalidPlaylist(format!(
                "Expected a master playlist at {}",
                url
            )))
        }
        Err(e) => {
            return Err(Error::InvalidPlaylist(format!(
                "Failed to parse {}: {:?}",
                url, e
            )))
        }
    };

    let mut out = Vec::new();
    for variant in master.variants.iter().filter(|v| !v.is_i_frame) {
        out.push(VariantRef {
            uri: resolve_uri(url, &variant.uri)?,
            kind: RenditionKind::Video,
            bandwidth: Some(variant.bandwidth),
            codecs: variant.codecs.clone(),
            resolution: variant.resolution.map(|r| (r.width, r.height)),
            group_id: variant.audio.clone(),
            language: None,
        });
    }
    for media in master
        .alternatives
        .iter()
        .filter(|m| m.media_type == AlternativeMediaType::Audio)
    {
        let Some(uri) = media.uri.as_deref() else {
            continue;
        };
        out.push(VariantRef {
            uri: resolve_uri(url, uri)?,
            kind: RenditionKind::Audio,
            bandwidth: None,
            codecs: None,
            resolution: None,
            group_id: Some(media.group_id.clone()),
            language: media.language.clone(),
        });
    }
    Ok(out)
}

/// Streams and keys for one acquired item.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamManifest {
    Audio(AudioManifest),
    Video(VideoManifest),
}

/// A single encrypted audio stream and its key.
#[derive(Debug, Clone, Serialize)]
pub struct AudioManifest {
    pub stream: MediaStream,
    pub key_uri: String,
    pub fingerprint: Fingerprint,
    pub keys: Vec<ContentKey>,
}

/// A video variant and the fingerprint of the init data protecting it.
#[derive(Debug, Clone, Serialize)]
pub struct VideoVariant {
    #[serde(flatten)]
    pub info: VariantRef,
    pub stream: MediaStream,
    pub fingerprint: Fingerprint,
}

/// All variants of a video plus the keys resolved for them.
///
/// Keys are indexed by fingerprint because variants share init data; a
/// fingerprint that could not be resolved appears in `failures` instead.
#[derive(Debug, Clone, Serialize)]
pub struct VideoManifest {
    pub playlist_url: String,
    pub variants: Vec<VideoVariant>,
    pub keys: BTreeMap<Fingerprint, Vec<ContentKey>>,
    pub failures: Vec<KeyFailure>,
}

impl VideoManifest {
    /// Keys for a variant, if its fingerprint was resolved.
    pub fn keys_for(&self, variant: &VideoVariant) -> Option<&[ContentKey]> {
        self.keys.get(&variant.fingerprint).map(Vec::as_slice)
    }

    /// Whether every variant has keys.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_attribute_list, parse_master, MediaStream, RenditionKind};

    const AUDIO_PLAYLIST: &str = r#"#EXTM3U
#EXT-X-TARGETDURATION:20
#EXT-X-VERSION:7
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-MAP:URI="P123_A.mp4",BYTERANGE="1000@0"
#EXT-X-KEY:METHOD=SAMPLE-AES,URI="skd://itunes.apple.com/P000000000/s1/e1",KEYFORMAT="com.apple.streamingkeydelivery",KEYFORMATVERSIONS="1"
#EXT-X-KEY:METHOD=SAMPLE-AES,URI="data:;base64,AAAAAAAAAAAAAAAAAAAAAQ==",KEYFORMAT="urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed",KEYFORMATVERSIONS="1"
#EXT-X-KEY:METHOD=SAMPLE-AES,URI="data:text/plain;charset=UTF-16;base64,AAAA",KEYFORMAT="com.microsoft.playready",KEYFORMATVERSIONS="1"
#EXTINF:19.999,
#EXT-X-BYTERANGE:500000@1000
P123_A.mp4
#EXTINF:10.5,
#EXT-X-BYTERANGE:250000@501000
P123_A.mp4
#EXT-X-ENDLIST
"#;

    const MASTER_PLAYLIST: &str = r#"#EXTM3U
#EXT-X-VERSION:6
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="audio-stereo-256",LANGUAGE="en",NAME="English",DEFAULT=YES,AUTOSELECT=YES,URI="audio/stereo.m3u8"
#EXT-X-STREAM-INF:BANDWIDTH=2000000,CODECS="avc1.640028,mp4a.40.2",RESOLUTION=1280x720,AUDIO="audio-stereo-256"
video/720.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=6000000,CODECS="avc1.640028,mp4a.40.2",RESOLUTION=1920x1080,AUDIO="audio-stereo-256"
https://cdn.example/video/1080.m3u8
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=300000,URI="video/iframe.m3u8"
"#;

    #[test]
    fn media_playlist_keeps_every_key_tag() {
        let url = "https://aod.example/itunes-assets/x/P123.m3u8";
        let stream = MediaStream::parse(url, AUDIO_PLAYLIST.as_bytes()).expect("parse");

        assert_eq!(stream.keys.len(), 3);
        assert_eq!(
            stream.widevine_key_uri(),
            Some("data:;base64,AAAAAAAAAAAAAAAAAAAAAQ==")
        );
        assert_eq!(stream.segments.len(), 2);
        assert_eq!(stream.segments[0].uri, "https://aod.example/itunes-assets/x/P123_A.mp4");
        assert_eq!(stream.segments[1].byte_range, Some((250000, 501000)));
        assert_eq!(
            stream.init_segment.as_deref(),
            Some("https://aod.example/itunes-assets/x/P123_A.mp4")
        );
    }

    #[test]
    fn media_playlist_without_widevine_key() {
        let data = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10,\nseg0.ts\n#EXT-X-ENDLIST\n";
        let stream = MediaStream::parse("https://x.example/a.m3u8", data.as_bytes()).expect("parse");
        assert_eq!(stream.widevine_key_uri(), None);
    }

    #[test]
    fn master_playlist_lists_variants_and_audio() {
        let url = "https://mvod.example/hls/master.m3u8";
        let variants = parse_master(url, MASTER_PLAYLIST.as_bytes()).expect("parse");

        assert_eq!(variants.len(), 3);
        assert_eq!(variants[0].uri, "https://mvod.example/hls/video/720.m3u8");
        assert_eq!(variants[0].resolution, Some((1280, 720)));
        assert_eq!(variants[1].uri, "https://cdn.example/video/1080.m3u8");
        assert_eq!(variants[2].kind, RenditionKind::Audio);
        assert_eq!(variants[2].uri, "https://mvod.example/hls/audio/stereo.m3u8");
        assert_eq!(variants[2].language.as_deref(), Some("en"));
    }

    #[test]
    fn media_playlist_is_not_a_master() {
        let url = "https://aod.example/P123.m3u8";
        assert!(parse_master(url, AUDIO_PLAYLIST.as_bytes()).is_err());
    }

    #[test]
    fn attribute_list_handles_quoted_commas() {
        let attrs = parse_attribute_list(r#"METHOD=SAMPLE-AES,URI="data:a,b",KEYFORMATVERSIONS="1""#);
        assert_eq!(attrs.get("METHOD").map(String::as_str), Some("SAMPLE-AES"));
        assert_eq!(attrs.get("URI").map(String::as_str), Some("data:a,b"));
        assert_eq!(attrs.get("KEYFORMATVERSIONS").map(String::as_str), Some("1"));
    }
}
