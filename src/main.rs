#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info, warn, Level};

use wvkeys::acquire::{CatalogItem, ContentAcquirer};
use wvkeys::config::Config;
use wvkeys::playback::PlaybackClient;
use wvkeys::pssh::{Fingerprint, ProtectionInitData};
use wvkeys::remotecdm::RemoteCdm;
use wvkeys::resolver::KeyResolver;
use wvkeys::vault::{FileKeyVault, KeyVault};

#[derive(Parser)]
#[command(name = "wvkeys", version, disable_version_flag = true, about = "wvkeys CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Acquire streams and keys for catalog items.
    ///
    /// Prints the items with their stream manifests as JSON.
    Acquire {
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(short = 'c', long = "config", default_value = "wvkeys.yml")]
        config: PathBuf,
        #[arg(short = 'w', long = "workers")]
        workers: Option<usize>,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Inspect or edit the key vault.
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
        /// Vault file; defaults to the configured or platform location.
        #[arg(long = "vault")]
        vault: Option<PathBuf>,
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
    /// Print init data, fingerprint and key IDs for an HLS key URI.
    Pssh {
        key_uri: String,
        /// Treat the URI payload as a full PSSH instead of a key ID.
        #[arg(long = "video", action = ArgAction::SetTrue)]
        video: bool,
    },
}

#[derive(Subcommand)]
enum KeysCommand {
    /// List stored fingerprints.
    List,
    /// Print the keys stored for a fingerprint as kid:key.
    Get { fingerprint: String },
    /// Remove a fingerprint from the vault.
    Remove { fingerprint: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    info!("wvkeys version {}", env!("CARGO_PKG_VERSION"));

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::Acquire {
            ids,
            config,
            workers,
            output,
        }) => run_acquire(&ids, &config, workers, output.as_deref()),
        Some(Commands::Keys {
            command,
            vault,
            config,
        }) => run_keys(command, vault, config.as_deref()),
        Some(Commands::Pssh { key_uri, video }) => run_pssh(&key_uri, video),
        None => Ok(()),
    }
}

fn run_acquire(
    ids: &[String],
    config_path: &Path,
    workers: Option<usize>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let config = Config::from_path(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    let vault_path = config.vault_path()?;
    let vault = FileKeyVault::open(&vault_path).context("Failed to open key vault")?;
    info!("[+] Loaded key vault {}", vault_path.display());

    let cdm = RemoteCdm::new(&config.cdm, config.timeout()).context("Failed to connect to CDM")?;
    info!("[+] Connected to remote CDM ({} L{})", cdm.system_id, cdm.security_level);

    let api = PlaybackClient::new(&config)?;
    let acquirer = ContentAcquirer::new(api, KeyResolver::new(cdm, vault));

    let mut items: Vec<CatalogItem> = ids.iter().map(CatalogItem::new).collect();
    let results = acquirer.acquire_many(&mut items, workers.unwrap_or(config.workers));

    let mut failed = 0usize;
    for (item, result) in items.iter().zip(&results) {
        match result {
            Ok(true) => info!("[+] {}", item.id),
            Ok(false) => warn!("[-] {}: no streamable asset", item.id),
            Err(e) if e.is_content() => warn!("[-] {}", e),
            Err(e) => {
                error!("[-] {}", e);
                failed += 1;
            }
        }
    }

    let json = serde_json::to_string_pretty(&items)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)?;
            info!("Saved manifests to {}", path.display());
        }
        None => println!("{}", json),
    }

    if failed > 0 {
        anyhow::bail!("{} of {} item(s) failed", failed, items.len());
    }
    Ok(())
}

fn run_keys(
    command: KeysCommand,
    vault: Option<PathBuf>,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let vault_path = match (vault, config_path) {
        (Some(path), _) => path,
        (None, Some(config_path)) => Config::from_path(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?
            .vault_path()?,
        (None, None) => FileKeyVault::default_path().context("No data directory available")?,
    };
    let vault = FileKeyVault::open(&vault_path).context("Failed to open key vault")?;

    match command {
        KeysCommand::List => {
            let fingerprints = vault.fingerprints()?;
            for fingerprint in &fingerprints {
                if let Some(entry) = vault.entry(fingerprint) {
                    println!(
                        "{}\t{}\t{} key(s)",
                        fingerprint,
                        entry.stored_at.to_rfc3339(),
                        entry.keys.len()
                    );
                }
            }
            info!("{} entries in {}", fingerprints.len(), vault.path().display());
        }
        KeysCommand::Get { fingerprint } => {
            let fingerprint: Fingerprint = fingerprint.parse()?;
            let keys = vault
                .lookup(&fingerprint)?
                .with_context(|| format!("No keys stored for {}", fingerprint))?;
            for key in keys {
                println!("{}", key);
            }
        }
        KeysCommand::Remove { fingerprint } => {
            let fingerprint: Fingerprint = fingerprint.parse()?;
            if vault.remove(&fingerprint)? {
                info!("Removed {}", fingerprint);
            } else {
                warn!("{} is not in the vault", fingerprint);
            }
        }
    }
    Ok(())
}

fn run_pssh(key_uri: &str, video: bool) -> anyhow::Result<()> {
    let init_data = if video {
        ProtectionInitData::from_video_key_uri(key_uri)?
    } else {
        ProtectionInitData::from_audio_key_uri(key_uri)?
    };

    println!("init data:   {}", init_data.to_base64());
    println!("fingerprint: {}", init_data.fingerprint());
    match init_data.key_ids() {
        Ok(key_ids) => {
            for kid in key_ids {
                println!("key id:      {}", kid.as_simple());
            }
        }
        Err(e) => warn!("Could not read key IDs: {}", e),
    }
    Ok(())
}
