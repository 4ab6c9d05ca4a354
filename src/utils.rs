//! Miscellaneous helper utilities.
use std::path::Path;

use reqwest::Url;

use crate::error::{Error, Result};

/// Ensure a file path's parent directory exists.
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Resolve a playlist entry against the URL of the playlist that holds it.
pub fn resolve_uri(base: &str, uri: &str) -> Result<String> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(uri.to_string());
    }
    let base = Url::parse(base).map_err(|e| Error::InvalidPlaylist(format!("{}: {}", base, e)))?;
    base.join(uri)
        .map(String::from)
        .map_err(|e| Error::InvalidPlaylist(format!("{}: {}", uri, e)))
}

#[cfg(test)]
mod tests {
    use super::resolve_uri;

    #[test]
    fn resolves_relative_and_keeps_absolute() {
        let base = "https://aod.itunes.apple.com/itunes-assets/a/b/P1.m3u8";
        assert_eq!(
            resolve_uri(base, "seg/0.mp4").expect("resolve"),
            "https://aod.itunes.apple.com/itunes-assets/a/b/seg/0.mp4"
        );
        assert_eq!(
            resolve_uri(base, "https://cdn.example/x.mp4").expect("resolve"),
            "https://cdn.example/x.mp4"
        );
    }
}
