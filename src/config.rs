use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use ipcclib::{catalog::DEFAULT_CATALOG_URL, download::DEFAULT_TIMEOUT, pipeline::DEFAULT_CONCURRENCY};
use serde::{Deserialize, Serialize};

use crate::PKG_NAME;

/// Number of most recent firmware versions processed per device.
pub const DEFAULT_VERSIONS_PER_DEVICE: usize = 2;

/// Optional settings loaded from the JSON config file. Every field falls back
/// to a default when absent.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding the per-device output directories
    pub output_dir: Option<PathBuf>,
    /// Base URL of the firmware catalog API
    pub catalog_url: Option<String>,
    /// Maximum number of firmware versions processed at the same time
    pub concurrency: Option<usize>,
    pub versions_per_device: Option<usize>,
    pub download_timeout_secs: Option<u64>,
    /// Path or name of the 7-Zip executable
    pub seven_zip: Option<PathBuf>,
    /// Path or name of the ipsw executable
    pub ipsw: Option<PathBuf>,
    /// Program for decrypting legacy disk images, invoked as
    /// `<program> <identifier> <build ID> <image>`
    pub legacy_decryptor: Option<PathBuf>,
    /// Whether to print download and extraction progress
    pub progress: Option<bool>,
    /// Remote to push to in git mode
    pub git_remote: Option<String>,
    /// Branch to push in git mode
    pub git_branch: Option<String>,
}

impl Config {
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn catalog_url(&self) -> &str {
        self.catalog_url.as_deref().unwrap_or(DEFAULT_CATALOG_URL)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(DEFAULT_CONCURRENCY)
    }

    pub fn versions_per_device(&self) -> usize {
        self.versions_per_device.unwrap_or(DEFAULT_VERSIONS_PER_DEVICE)
    }

    pub fn download_timeout(&self) -> Duration {
        self.download_timeout_secs.map_or(DEFAULT_TIMEOUT, Duration::from_secs)
    }

    pub fn seven_zip(&self) -> &Path {
        self.seven_zip.as_deref().unwrap_or_else(|| Path::new("7z"))
    }

    pub fn ipsw(&self) -> &Path {
        self.ipsw.as_deref().unwrap_or_else(|| Path::new("ipsw"))
    }

    pub fn progress(&self) -> bool {
        self.progress.unwrap_or(true)
    }

    /// Reject values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            return Err(anyhow!("concurrency must be at least 1"));
        } else if self.versions_per_device == Some(0) {
            return Err(anyhow!("versions_per_device must be at least 1"));
        } else if self.download_timeout_secs == Some(0) {
            return Err(anyhow!("download_timeout_secs must be at least 1"));
        }

        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(format!("{}.conf", PKG_NAME));
        p
    })
}

/// Load the config file from `user_path` or the default location. A missing
/// file yields the default config.
pub fn load_config_file(user_path: Option<&Path>) -> Result<Config> {
    let default_path = default_config_path();
    let path = match user_path.or_else(|| default_path.as_deref()) {
        Some(p) => p,
        None => return Ok(Config::default()),
    };

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(e).context(format!("Could not open file: {:?}", path)),
    };

    let config: Config = serde_json::from_reader(file)
        .context(format!("Could not parse config file: {:?}", path))?;
    config.validate()
        .context(format!("Invalid config file: {:?}", path))?;

    Ok(config)
}
