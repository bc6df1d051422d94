//! Per-version processing: download, extract, collect, package and record.
//!
//! Output layout under the root directory:
//!
//! ```text
//! <identifier>/metadata.json
//! <identifier>/<version>/bundles.json
//! <identifier>/<version>/<bundle>.tar
//! ```

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::{fs, sync::Semaphore};

use crate::{
    bundles::{collect_bundles, BundleError},
    catalog::{CatalogResponse, FirmwareRecord},
    download::{DownloadError, Downloader},
    extract::{ExtractError, ExtractJob, Extractor},
    file::{delete_dir_if_exists, delete_if_exists},
    ledger::{Ledger, LedgerError, ProcessedRecord},
    package::{package_bundles, PackageError},
};

/// Maximum number of versions processed at the same time.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Per-device metadata file name.
pub const DEVICE_METADATA: &str = "metadata.json";
/// Per-version metadata file name.
pub const VERSION_METADATA: &str = "bundles.json";

/// Suffixes of files in a version directory that survive an interrupted run.
/// Everything else is regenerated.
const RESUMABLE_SUFFIXES: &[&str] = &[".dmg", ".dmg.aea"];

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("Bundle discovery failed: {0}")]
    Bundle(#[from] BundleError),
    #[error("Packaging failed: {0}")]
    Package(#[from] PackageError),
    #[error("Metadata update failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("I/O error on {0:?}: {1}")]
    Io(PathBuf, #[source] io::Error),
}

/// Result of a version that did not fail.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VersionStatus {
    Processed,
    Skipped,
}

/// Runs the per-version pipeline for catalog listings. Clones share the same
/// concurrency gate, so the limit applies across all of them.
#[derive(Clone)]
pub struct Pipeline {
    root: PathBuf,
    downloader: Downloader,
    extractor: Extractor,
    ledger: Arc<Ledger>,
    gate: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(
        root: impl Into<PathBuf>,
        downloader: Downloader,
        extractor: Extractor,
        ledger: Arc<Ledger>,
        concurrency: usize,
    ) -> Self {
        Self {
            root: root.into(),
            downloader,
            extractor,
            ledger,
            gate: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Output directory of a device.
    pub fn device_dir(&self, identifier: &str) -> PathBuf {
        self.root.join(identifier)
    }

    /// Process every firmware in the listing and return how many were newly
    /// processed. Failed versions are logged and left for a future run.
    pub async fn run(&self, catalog: &CatalogResponse) -> usize {
        let mut tasks = catalog.firmwares.iter()
            .cloned()
            .map(|record| {
                let pipeline = self.clone();
                tokio::spawn(async move { pipeline.process_gated(record).await })
            })
            .collect::<FuturesUnordered<_>>();

        let mut processed = 0;

        while let Some(result) = tasks.next().await {
            match result {
                Ok(VersionStatus::Processed) => processed += 1,
                Ok(VersionStatus::Skipped) => {}
                Err(e) => error!("Version task failed: {e}"),
            }
        }

        processed
    }

    async fn process_gated(&self, record: FirmwareRecord) -> VersionStatus {
        let _permit = match self.gate.acquire().await {
            Ok(p) => p,
            // Never closed
            Err(_) => return VersionStatus::Skipped,
        };

        match self.process(&record).await {
            Ok(status) => status,
            Err(e) => {
                error!("[{} {}] {e}", record.identifier, record.version);
                VersionStatus::Skipped
            }
        }
    }

    /// Run all stages for a single version. The caller is responsible for
    /// holding a concurrency permit.
    pub async fn process(&self, record: &FirmwareRecord) -> Result<VersionStatus, PipelineError> {
        let device_dir = self.device_dir(&record.identifier);
        let metadata = device_dir.join(DEVICE_METADATA);

        if self.ledger.is_ignored(&metadata, &record.version).await? {
            info!("[{} {}] Skipping ignored version", record.identifier, record.version);
            return Ok(VersionStatus::Skipped);
        } else if self.ledger.is_processed(&metadata, &record.version).await? {
            info!("[{} {}] Skipping processed version", record.identifier, record.version);
            return Ok(VersionStatus::Skipped);
        }

        info!("[{} {}] Processing build {}", record.identifier, record.version, record.build_id);
        let start = Instant::now();

        let version_dir = device_dir.join(&record.version);
        fs::create_dir_all(&version_dir).await
            .map_err(|e| PipelineError::Io(version_dir.clone(), e))?;
        clean_stale(&version_dir, &record.container_name()).await?;

        let container = self.downloader.fetch(record, &version_dir).await?;

        let outcome = self.extractor.extract(&ExtractJob {
            container: &container,
            output: &version_dir,
            record,
            metadata: &metadata,
        }).await?;

        let bundles = collect_bundles(&version_dir, outcome).await?;
        if bundles.is_empty() {
            warn!("[{} {}] No carrier bundles found", record.identifier, record.version);
        }

        let archives = package_bundles(&bundles).await;

        // The archives replace the directories
        for bundle in &bundles {
            delete_dir_if_exists(bundle).await
                .map_err(|e| PipelineError::Io(bundle.clone(), e))?;
        }

        let archives = archives?;

        self.ledger.record_bundles(&version_dir.join(VERSION_METADATA), archives).await?;
        self.ledger.record_processed(&metadata, ProcessedRecord {
            version: record.version.clone(),
            buildid: record.build_id.clone(),
            downloaded_at: Utc::now(),
            processing_time_sec: start.elapsed().as_secs_f64(),
        }).await?;

        info!("[{} {}] Processed {} bundles in {:.1}s",
              record.identifier, record.version, bundles.len(), start.elapsed().as_secs_f64());

        Ok(VersionStatus::Processed)
    }
}

/// Delete leftovers of an interrupted run from a version directory. The
/// container, extracted disk images and the version metadata are kept.
async fn clean_stale(version_dir: &Path, container_name: &str) -> Result<(), PipelineError> {
    let io_err = |e| PipelineError::Io(version_dir.to_owned(), e);
    let mut entries = fs::read_dir(version_dir).await.map_err(io_err)?;

    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if name == container_name
            || name == VERSION_METADATA
            || RESUMABLE_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            continue;
        }

        let path = entry.path();
        debug!("Removing stale path: {path:?}");

        let result = if entry.file_type().await.map_err(io_err)?.is_dir() {
            delete_dir_if_exists(&path).await
        } else {
            delete_if_exists(&path).await
        };
        result.map_err(|e| PipelineError::Io(path, e))?;
    }

    Ok(())
}
