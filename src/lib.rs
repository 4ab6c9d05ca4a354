//! wvkeys - Widevine license acquisition and content key vault.
//!
//! This crate provides:
//! - Widevine init data construction, PSSH parsing and fingerprinting.
//! - A content-addressed key vault (in memory or JSON file).
//! - The two-round license exchange driven through a pluggable CDM.
//! - Catalog item acquisition producing stream manifests with keys.
//!
//! Feature flags:
//! - `cli`: enable the `wvkeys` binary.
//! - `remote`: enable the pywidevine serve compatible remote CDM client.
//! - `log`: log through the `log` facade.
//! - `tracing`: log through `tracing` instead.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Catalog item acquisition.
pub mod acquire;
/// CDM capability boundary.
pub mod cdm;
/// YAML configuration.
pub mod config;
/// Common error types and Result alias.
pub mod error;
/// Decrypted key representation.
pub mod key;
/// License endpoint client.
pub mod license;
/// Widevine protobuf messages.
pub mod license_protocol;
/// HLS playlist parsing and stream manifests.
pub mod manifest;
/// Playback descriptor lookup.
pub mod playback;
/// Init data and PSSH utilities.
pub mod pssh;
/// Vault-first key resolution.
pub mod resolver;
/// Shared helper utilities.
pub mod utils;
/// Content key vault.
pub mod vault;

/// Remote CDM client (feature: `remote`).
#[cfg(feature = "remote")]
pub mod remotecdm;

#[cfg(test)]
mod testing;
