//! Catalog item acquisition: descriptor, asset selection, manifests and keys.
use std::collections::BTreeMap;
use std::thread;

use parking_lot::Mutex;
use serde::Serialize;

use crate::cdm::Cdm;
use crate::error::{Error, Result, Step};
use crate::manifest::{
    parse_master, AudioManifest, MediaStream, StreamManifest, VideoManifest, VideoVariant,
};
use crate::playback::{Asset, CatalogApi, PlaybackAsset};
use crate::pssh::ProtectionInitData;
use crate::resolver::KeyResolver;
use crate::vault::KeyVault;

/// A catalog item and, once acquired, its streams.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogItem {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disc_count: Option<u32>,
    pub streams: Option<StreamManifest>,
}

impl CatalogItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            disc_count: None,
            streams: None,
        }
    }
}

/// Attaches decryptable stream manifests to catalog items.
pub struct ContentAcquirer<A, C, V> {
    api: A,
    resolver: KeyResolver<C, V>,
}

impl<A, C, V> ContentAcquirer<A, C, V>
where
    A: CatalogApi,
    C: Cdm,
    V: KeyVault,
{
    pub fn new(api: A, resolver: KeyResolver<C, V>) -> Self {
        Self { api, resolver }
    }

    pub fn resolver(&self) -> &KeyResolver<C, V> {
        &self.resolver
    }

    /// Acquire streams and keys for `item`.
    ///
    /// Returns `false` when the item has nothing streamable. On error the
    /// item carries no streams; keys stored before the error stay in the
    /// vault.
    pub fn acquire(&self, item: &mut CatalogItem) -> Result<bool> {
        item.streams = None;
        item.disc_count = None;
        let asset_id = item.id.clone();

        let descriptor = self.api.web_playback(&asset_id)?;
        let asset = descriptor.asset(&asset_id)?;
        if matches!(asset, PlaybackAsset::Unavailable) {
            info!("[{}] No streamable asset, skipping", asset_id);
            return Ok(false);
        }
        let license = self.api.license_client(descriptor.license_url(&asset_id)?);

        let streams = match asset {
            PlaybackAsset::Audio(asset) => {
                item.disc_count = asset.metadata.disc_count;
                StreamManifest::Audio(self.acquire_audio(&asset_id, &license, &asset)?)
            }
            PlaybackAsset::Video { playlist_url } => {
                StreamManifest::Video(self.acquire_video(&asset_id, &license, &playlist_url)?)
            }
            PlaybackAsset::Unavailable => return Ok(false),
        };

        item.streams = Some(streams);
        Ok(true)
    }

    fn acquire_audio(
        &self,
        asset_id: &str,
        license: &A::License,
        asset: &Asset,
    ) -> Result<AudioManifest> {
        info!("[{}] Parsing song playlist", asset_id);
        let stream = self.media_stream(asset_id, &asset.url)?;

        let key_uri = stream
            .widevine_key_uri()
            .ok_or_else(|| Error::content(asset_id, "Audio playlist carries no Widevine key"))?
            .to_string();
        let init_data = ProtectionInitData::from_audio_key_uri(&key_uri)
            .map_err(|e| Error::content(asset_id, e.to_string()))?;

        let resolved = self.resolver.resolve(asset_id, license, &init_data, &key_uri)?;
        Ok(AudioManifest {
            stream,
            key_uri,
            fingerprint: resolved.fingerprint,
            keys: resolved.keys,
        })
    }

    fn acquire_video(
        &self,
        asset_id: &str,
        license: &A::License,
        playlist_url: &str,
    ) -> Result<VideoManifest> {
        info!("[{}] Parsing music video playlist", asset_id);
        let master = self.api.fetch_playlist(asset_id, playlist_url)?;
        let refs = parse_master(playlist_url, &master)
            .map_err(|e| Error::protocol(asset_id, Step::Playlist, e.to_string()))?;
        if refs.is_empty() {
            return Err(Error::content(asset_id, "Master playlist lists no variants"));
        }

        let mut variants = Vec::with_capacity(refs.len());
        let mut init_data = Vec::with_capacity(refs.len());
        for info in refs {
            let stream = self.media_stream(asset_id, &info.uri)?;
            let key_uri = stream.widevine_key_uri().ok_or_else(|| {
                Error::content(asset_id, format!("No Widevine key in {}", info.uri))
            })?;
            let data = ProtectionInitData::from_video_key_uri(key_uri)
                .map_err(|e| Error::content(asset_id, e.to_string()))?;
            variants.push(VideoVariant {
                info,
                stream,
                fingerprint: data.fingerprint(),
            });
            init_data.push(data);
        }

        let resolution = self.resolver.resolve_all(asset_id, license, &init_data, |data| {
            format!("data:text/plain;base64,{}", data.to_base64())
        });
        if !resolution.failures.is_empty() {
            warn!(
                "[{}] {} of {} key(s) could not be resolved",
                asset_id,
                resolution.failures.len(),
                resolution.failures.len() + resolution.resolved.len()
            );
        }

        let keys: BTreeMap<_, _> = resolution
            .resolved
            .into_iter()
            .map(|resolved| (resolved.fingerprint, resolved.keys))
            .collect();
        Ok(VideoManifest {
            playlist_url: playlist_url.to_string(),
            variants,
            keys,
            failures: resolution.failures,
        })
    }

    fn media_stream(&self, asset_id: &str, url: &str) -> Result<MediaStream> {
        let data = self.api.fetch_playlist(asset_id, url)?;
        MediaStream::parse(url, &data)
            .map_err(|e| Error::protocol(asset_id, Step::Playlist, e.to_string()))
    }

    /// Acquire `items` on up to `workers` threads.
    ///
    /// Results are returned in item order. A failure only affects its own
    /// item.
    pub fn acquire_many(&self, items: &mut [CatalogItem], workers: usize) -> Vec<Result<bool>> {
        let count = items.len();
        let workers = workers.clamp(1, count.max(1));
        let queue = Mutex::new(items.iter_mut().enumerate());
        let results: Mutex<Vec<Option<Result<bool>>>> =
            Mutex::new((0..count).map(|_| None).collect());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let next = queue.lock().next();
                    let Some((index, item)) = next else {
                        break;
                    };
                    let result = self.acquire(item);
                    match &result {
                        Ok(true) => {
                            info!("[{}] Acquired", item.id);
                        }
                        Ok(false) => {}
                        Err(e) if e.is_content() => {
                            warn!("Skipping: {}", e);
                        }
                        Err(e) => {
                            error!("{}", e);
                        }
                    }
                    results.lock()[index] = Some(result);
                });
            }
        });

        results
            .into_inner()
            .into_iter()
            .map(|result| result.unwrap_or_else(|| Err(Error::Other("Item was not acquired".to_string()))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::{CatalogItem, ContentAcquirer};
    use crate::error::Error;
    use crate::manifest::StreamManifest;
    use crate::playback::{Asset, AssetMetadata, PlaybackDescriptor};
    use crate::pssh::ProtectionInitData;
    use crate::resolver::KeyResolver;
    use crate::testing::{fake_content_key, FakeCatalog, FakeCdm};
    use crate::vault::{KeyVault, MemoryKeyVault};

    const LICENSE_URL: &str = "https://play.example/acquireWebPlaybackLicense";
    const MASTER_URL: &str = "https://mvod.example/hls/master.m3u8";
    const AUDIO_URL: &str = "https://aod.example/P1.m3u8";

    fn media_playlist(key_uri: &str) -> String {
        format!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-VERSION:7\n\
             #EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://key\",KEYFORMAT=\"com.apple.streamingkeydelivery\",KEYFORMATVERSIONS=\"1\"\n\
             #EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"{}\",KEYFORMAT=\"urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed\",KEYFORMATVERSIONS=\"1\"\n\
             #EXTINF:6.0,\nseg0.mp4\n#EXT-X-ENDLIST\n",
            key_uri
        )
    }

    fn master_playlist(names: &[&str]) -> String {
        let mut out = String::from("#EXTM3U\n");
        for (i, name) in names.iter().enumerate() {
            out.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION=1280x720\n{}.m3u8\n",
                (i + 1) * 1_000_000,
                name
            ));
        }
        out
    }

    fn video_init(n: u8) -> ProtectionInitData {
        ProtectionInitData::from_key_id(&[n; 16])
    }

    fn video_catalog(variants: &[(&str, &ProtectionInitData)]) -> FakeCatalog {
        let names: Vec<&str> = variants.iter().map(|(name, _)| *name).collect();
        let mut catalog = FakeCatalog::default()
            .with_descriptor(
                "mv",
                PlaybackDescriptor {
                    hls_playlist_url: Some(MASTER_URL.to_string()),
                    hls_key_server_url: Some(LICENSE_URL.to_string()),
                    assets: Vec::new(),
                },
            )
            .with_playlist(MASTER_URL, &master_playlist(&names));
        for (name, init) in variants {
            catalog = catalog.with_playlist(
                &format!("https://mvod.example/hls/{}.m3u8", name),
                &media_playlist(&format!("data:text/plain;base64,{}", init.to_base64())),
            );
        }
        catalog
    }

    fn audio_catalog(flavor: &str) -> FakeCatalog {
        FakeCatalog::default()
            .with_descriptor(
                "song",
                PlaybackDescriptor {
                    hls_playlist_url: None,
                    hls_key_server_url: Some(LICENSE_URL.to_string()),
                    assets: vec![Asset {
                        flavor: flavor.to_string(),
                        url: AUDIO_URL.to_string(),
                        metadata: AssetMetadata {
                            disc_count: Some(2),
                        },
                    }],
                },
            )
            .with_playlist(AUDIO_URL, &media_playlist("data:;base64,AAAAAAAAAAAAAAAAAAAAAQ=="))
    }

    #[test]
    fn audio_is_resolved_then_served_from_vault() {
        let catalog = audio_catalog("28:ctrp256");
        let acquirer = ContentAcquirer::new(
            &catalog,
            KeyResolver::new(FakeCdm::default(), MemoryKeyVault::new()),
        );

        let mut item = CatalogItem::new("song");
        assert!(acquirer.acquire(&mut item).expect("acquire"));
        assert_eq!(item.disc_count, Some(2));
        let expected = ProtectionInitData::from_audio_key_uri("data:;base64,AAAAAAAAAAAAAAAAAAAAAQ==")
            .expect("init data");
        match item.streams.as_ref().expect("streams") {
            StreamManifest::Audio(audio) => {
                assert_eq!(audio.fingerprint, expected.fingerprint());
                assert_eq!(audio.keys, vec![fake_content_key(&expected)]);
                assert_eq!(audio.stream.segments.len(), 1);
            }
            other => panic!("unexpected manifest: {other:?}"),
        }
        assert_eq!(catalog.license.calls.load(Ordering::SeqCst), 2);

        let mut again = CatalogItem::new("song");
        assert!(acquirer.acquire(&mut again).expect("acquire"));
        assert_eq!(catalog.license.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn audio_without_required_flavor_attaches_nothing() {
        let catalog = audio_catalog("30:cbcp256");
        let acquirer = ContentAcquirer::new(
            &catalog,
            KeyResolver::new(FakeCdm::default(), MemoryKeyVault::new()),
        );

        let mut item = CatalogItem::new("song");
        let err = acquirer.acquire(&mut item).expect_err("missing flavor");
        assert!(err.is_content());
        assert!(item.streams.is_none());
        assert_eq!(catalog.license.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn video_with_one_rejected_key_still_succeeds() {
        let good = video_init(1);
        let bad = video_init(2);
        let catalog = video_catalog(&[("v1", &good), ("v2", &bad)]);
        let acquirer = ContentAcquirer::new(
            &catalog,
            KeyResolver::new(FakeCdm::rejecting([bad.fingerprint()]), MemoryKeyVault::new()),
        );

        let mut item = CatalogItem::new("mv");
        assert!(acquirer.acquire(&mut item).expect("acquire"));
        match item.streams.as_ref().expect("streams") {
            StreamManifest::Video(video) => {
                assert_eq!(video.variants.len(), 2);
                assert_eq!(video.keys.len(), 1);
                assert_eq!(video.keys_for(&video.variants[0]), Some(&[fake_content_key(&good)][..]));
                assert_eq!(video.keys_for(&video.variants[1]), None);
                assert_eq!(video.failures.len(), 1);
                assert_eq!(video.failures[0].fingerprint, bad.fingerprint());
                assert!(!video.is_complete());
            }
            other => panic!("unexpected manifest: {other:?}"),
        }
    }

    #[test]
    fn shared_pssh_is_exchanged_once() {
        let init = video_init(3);
        let catalog = video_catalog(&[("v1", &init), ("v2", &init), ("v3", &init)]);
        let cdm = FakeCdm::default();
        let acquirer = ContentAcquirer::new(&catalog, KeyResolver::new(cdm, MemoryKeyVault::new()));

        let mut item = CatalogItem::new("mv");
        assert!(acquirer.acquire(&mut item).expect("acquire"));
        assert_eq!(catalog.license.calls.load(Ordering::SeqCst), 2);
        assert_eq!(acquirer.resolver().cdm().sessions.load(Ordering::SeqCst), 1);
        assert_eq!(acquirer.resolver().vault().fingerprints().expect("list").len(), 1);
    }

    #[test]
    fn reacquiring_clears_stale_disc_count() {
        let mut catalog = audio_catalog("28:ctrp256");
        let init = video_init(5);
        let video = video_catalog(&[("v1", &init)]);
        catalog.descriptors.extend(video.descriptors);
        catalog.playlists.extend(video.playlists);
        let acquirer = ContentAcquirer::new(
            &catalog,
            KeyResolver::new(FakeCdm::default(), MemoryKeyVault::new()),
        );

        let mut item = CatalogItem::new("song");
        assert!(acquirer.acquire(&mut item).expect("acquire audio"));
        assert_eq!(item.disc_count, Some(2));

        item.id = "mv".to_string();
        assert!(acquirer.acquire(&mut item).expect("acquire video"));
        assert_eq!(item.disc_count, None);
        assert!(matches!(item.streams, Some(StreamManifest::Video(_))));

        item.id = "missing".to_string();
        item.disc_count = Some(7);
        assert!(acquirer.acquire(&mut item).is_err());
        assert_eq!(item.disc_count, None);
        assert!(item.streams.is_none());
    }

    #[test]
    fn item_without_assets_is_skipped() {
        let catalog = FakeCatalog::default().with_descriptor("empty", PlaybackDescriptor::default());
        let acquirer = ContentAcquirer::new(
            &catalog,
            KeyResolver::new(FakeCdm::default(), MemoryKeyVault::new()),
        );

        let mut item = CatalogItem::new("empty");
        assert!(!acquirer.acquire(&mut item).expect("acquire"));
        assert!(item.streams.is_none());
    }

    #[test]
    fn acquire_many_keeps_item_order() {
        let mut catalog = audio_catalog("28:ctrp256");
        let init = video_init(4);
        let video = video_catalog(&[("v1", &init)]);
        catalog.descriptors.extend(video.descriptors);
        catalog.playlists.extend(video.playlists);
        let acquirer = ContentAcquirer::new(
            &catalog,
            KeyResolver::new(FakeCdm::default(), MemoryKeyVault::new()),
        );

        let mut items = vec![
            CatalogItem::new("song"),
            CatalogItem::new("missing"),
            CatalogItem::new("mv"),
        ];
        let results = acquirer.acquire_many(&mut items, 3);

        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Ok(true)));
        assert!(matches!(results[1], Err(Error::Transport { .. })));
        assert!(matches!(results[2], Ok(true)));
        assert!(items[0].streams.is_some());
        assert!(items[1].streams.is_none());
        assert!(matches!(items[2].streams, Some(StreamManifest::Video(_))));
    }
}
