//! Extraction of carrier bundles from a firmware container.
//!
//! The container is a zip file whose largest entry is the root filesystem disk
//! image. The image may be AEA encrypted, in which case the key is pulled out
//! of the container and the image decrypted first. Images from old firmware
//! use a legacy encryption scheme that is only detected when the archive tool
//! refuses to open the image. Those are decrypted in place and the archive
//! step is retried once.

use std::{
    fs::File,
    io::{self, Read, Stderr, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};
use progresslib::{ProgressBar, ProgressDrawMode};
use thiserror::Error;
use tokio::{fs, task};
use walkdir::WalkDir;
use zip::{result::ZipError, ZipArchive};

use crate::{
    catalog::FirmwareRecord,
    file::{delete_dir_if_exists, delete_if_exists, delete_if_exists_sync, strip_extension},
    ledger::{Ledger, LedgerError},
    tools::{AeaTool, ArchiveTool, LegacyDecryptor, ToolError},
};

/// Directory holding the carrier bundles, relative to the filesystem root.
pub const CARRIER_BUNDLES_DIR: &str = "System/Library/Carrier Bundles";

const IMAGE_SUFFIX: &str = ".dmg";
const ENCRYPTED_IMAGE_SUFFIX: &str = ".dmg.aea";
const ENCRYPTED_EXT: &str = "aea";
const KEY_EXT: &str = "pem";

/// Number of times legacy decryption is attempted for one image.
const MAX_LEGACY_ATTEMPTS: u8 = 1;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Firmware container has no disk image (largest entry: {0:?})")]
    Unextractable(String),
    #[error("No decryption key found in {0:?}")]
    NoKeyFound(PathBuf),
    #[error("Key extraction failed: {0}")]
    KeyExtractionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("Legacy decryption failed: {0}")]
    LegacyDecryptionFailed(String),
    #[error("Failed to read firmware container: {0}")]
    Zip(#[from] ZipError),
    #[error("I/O error on {0:?}: {1}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Failed to record ignored version: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Extraction task failed: {0}")]
    Join(#[from] task::JoinError),
}

/// Layout information about the extracted filesystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExtractionOutcome {
    /// Whether the filesystem root is wrapped in a top-level directory inside
    /// the image, ie. bundles live under `*/System/...` instead of
    /// `System/...`.
    pub has_parent: bool,
}

/// Inputs for extracting one firmware version.
#[derive(Clone, Copy, Debug)]
pub struct ExtractJob<'a> {
    /// Downloaded firmware container
    pub container: &'a Path,
    /// Version working directory. Bundles are extracted here.
    pub output: &'a Path,
    pub record: &'a FirmwareRecord,
    /// Device metadata file that receives the version if it is unprocessable
    pub metadata: &'a Path,
}

/// Largest entry of a firmware container.
#[derive(Debug)]
struct PayloadEntry {
    index: usize,
    name: String,
    size: u64,
}

#[derive(Debug)]
enum Stage {
    LocatePayload,
    Decrypt(PathBuf),
    Probe(PathBuf),
    Extract {
        image: PathBuf,
        has_parent: bool,
    },
    LegacyDecrypt(PathBuf),
}

/// Deletes the registered files when dropped, whichever way extraction ends.
#[derive(Debug, Default)]
struct Cleanup {
    paths: Vec<PathBuf>,
}

impl Cleanup {
    fn add(&mut self, path: &Path) {
        self.paths.push(path.to_owned());
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        for path in &self.paths {
            debug!("Cleaning up: {path:?}");

            if let Err(e) = delete_if_exists_sync(path) {
                warn!("Failed to clean up {path:?}: {e}");
            }
        }
    }
}

/// 7-Zip pattern selecting the carrier bundle directories.
pub fn bundle_pattern(has_parent: bool) -> String {
    format!("{}{CARRIER_BUNDLES_DIR}/*", if has_parent { "*/" } else { "" })
}

/// Determine from an image listing whether the filesystem is wrapped in a
/// parent directory.
fn has_parent_dir(paths: &[String]) -> bool {
    let at_root = paths.iter().any(|p| p == "System" || p.starts_with("System/"));
    let nested = paths.iter().any(|p| p.contains("/System/") || p.ends_with("/System"));

    !at_root && nested
}

/// Find the largest entry in a firmware container.
fn find_largest_entry(container: &Path) -> Result<Option<PayloadEntry>, ExtractError> {
    let file = File::open(container)
        .map_err(|e| ExtractError::Io(container.to_owned(), e))?;
    let mut zip = ZipArchive::new(file)?;
    let mut largest: Option<PayloadEntry> = None;

    for index in 0..zip.len() {
        let entry = zip.by_index(index)?;

        if largest.as_ref().map_or(true, |l| entry.size() > l.size) {
            largest = Some(PayloadEntry {
                index,
                name: entry.name().to_owned(),
                size: entry.size(),
            });
        }
    }

    Ok(largest)
}

/// Copy a container entry to `target`, reporting progress.
fn copy_entry(
    container: &Path,
    index: usize,
    target: &Path,
    mut bar: ProgressBar<Stderr>,
) -> Result<(), ExtractError> {
    let file = File::open(container)
        .map_err(|e| ExtractError::Io(container.to_owned(), e))?;
    let mut zip = ZipArchive::new(file)?;
    let mut entry = zip.by_index(index)?;
    let mut output = File::create(target)
        .map_err(|e| ExtractError::Io(target.to_owned(), e))?;
    let mut buf = vec![0u8; 1024 * 1024];

    loop {
        let n = match entry.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ExtractError::Io(container.to_owned(), e)),
        };

        output.write_all(&buf[..n])
            .map_err(|e| ExtractError::Io(target.to_owned(), e))?;
        let _ = bar.advance(n as u64);
    }

    output.flush()
        .map_err(|e| ExtractError::Io(target.to_owned(), e))
}

/// Pick the key artifact for `image` from the files in `directory`. The key
/// for `foo.dmg.aea` is `foo.dmg.aea.pem`. If there is no exact match, any key
/// is used.
fn find_key(directory: &Path, image: &Path) -> Result<PathBuf, ExtractError> {
    let mut keys: Vec<PathBuf> = WalkDir::new(directory)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map_or(false, |e| e == KEY_EXT))
        .collect();

    let image_name = image.file_name();

    if let Some(i) = keys.iter().position(|k| k.file_stem() == image_name) {
        let key = keys.swap_remove(i);
        info!("Found matching key: {key:?}");
        return Ok(key);
    }

    if keys.is_empty() {
        return Err(ExtractError::NoKeyFound(directory.to_owned()));
    }

    let key = keys.swap_remove(0);
    warn!("No key matches {image_name:?}, using {key:?}");
    Ok(key)
}

/// Extracts carrier bundles from firmware containers using external tools.
#[derive(Clone)]
pub struct Extractor {
    archive: Arc<dyn ArchiveTool>,
    aea: Arc<dyn AeaTool>,
    legacy: Arc<dyn LegacyDecryptor>,
    ledger: Arc<Ledger>,
    progress: ProgressDrawMode,
}

impl Extractor {
    pub fn new(
        archive: Arc<dyn ArchiveTool>,
        aea: Arc<dyn AeaTool>,
        legacy: Arc<dyn LegacyDecryptor>,
        ledger: Arc<Ledger>,
    ) -> Self {
        Self {
            archive,
            aea,
            legacy,
            ledger,
            progress: ProgressDrawMode::Append,
        }
    }

    /// Set how payload extraction progress is drawn on stderr.
    pub fn progress(mut self, mode: ProgressDrawMode) -> Self {
        self.progress = mode;
        self
    }

    /// Extract the carrier bundle directories of a firmware container into
    /// the job's output directory.
    ///
    /// The container and every intermediate disk image are deleted before
    /// this returns, regardless of the result. If the container holds no disk
    /// image, the output directory is deleted, the version is recorded as
    /// ignored, and [`ExtractError::Unextractable`] is returned.
    pub async fn extract(&self, job: &ExtractJob<'_>) -> Result<ExtractionOutcome, ExtractError> {
        let mut cleanup = Cleanup::default();
        cleanup.add(job.container);

        let mut stage = Stage::LocatePayload;
        let mut legacy_attempts = 0u8;

        loop {
            debug!("[{}] Extraction stage: {:?}", job.record.version, stage);

            stage = match stage {
                Stage::LocatePayload => {
                    let image = self.extract_payload(job, &mut cleanup).await?;

                    if image.extension().map_or(false, |e| e == ENCRYPTED_EXT) {
                        Stage::Decrypt(image)
                    } else {
                        Stage::Probe(image)
                    }
                }
                Stage::Decrypt(encrypted) => {
                    let decrypted = strip_extension(&encrypted, ENCRYPTED_EXT)
                        .unwrap_or_else(|| encrypted.clone());
                    cleanup.add(&decrypted);

                    self.decrypt_payload(job, &encrypted).await?;
                    Stage::Probe(decrypted)
                }
                Stage::Probe(image) => match self.archive.list(&image).await {
                    Ok(paths) => {
                        let has_parent = has_parent_dir(&paths);
                        debug!("Filesystem has parent directory: {has_parent}");
                        Stage::Extract { image, has_parent }
                    }
                    Err(e) => Self::after_archive_failure(e, image, &mut legacy_attempts)?,
                },
                Stage::Extract { image, has_parent } => {
                    info!("Extracting bundles from {image:?}");

                    let pattern = bundle_pattern(has_parent);
                    match self.archive.extract(&image, job.output, &pattern).await {
                        Ok(()) => return Ok(ExtractionOutcome { has_parent }),
                        Err(e) => Self::after_archive_failure(e, image, &mut legacy_attempts)?,
                    }
                }
                Stage::LegacyDecrypt(image) => {
                    info!("Decrypting {image:?} with legacy key for {} ({})",
                          job.record.identifier, job.record.build_id);

                    self.legacy.decrypt(&job.record.identifier, &job.record.build_id, &image)
                        .await
                        .map_err(|e| ExtractError::LegacyDecryptionFailed(e.diagnostics()))?;

                    // Only the archive step is repeated
                    Stage::Probe(image)
                }
            };
        }
    }

    /// Decide what to do after the archive tool failed on `image`.
    fn after_archive_failure(
        error: ToolError,
        image: PathBuf,
        legacy_attempts: &mut u8,
    ) -> Result<Stage, ExtractError> {
        if error.is_legacy_image() && *legacy_attempts < MAX_LEGACY_ATTEMPTS {
            *legacy_attempts += 1;
            warn!("Archive tool cannot open {image:?}, trying legacy decryption");
            Ok(Stage::LegacyDecrypt(image))
        } else {
            Err(ExtractError::ExtractionFailed(error.diagnostics()))
        }
    }

    /// Mark the version as unprocessable.
    async fn ignore(&self, job: &ExtractJob<'_>) -> Result<(), ExtractError> {
        delete_dir_if_exists(job.output).await
            .map_err(|e| ExtractError::Io(job.output.to_owned(), e))?;
        self.ledger.record_ignored(job.metadata, &job.record.version).await?;
        Ok(())
    }

    /// Locate the disk image in the container and extract it to the output
    /// directory, unless a copy of the same size already exists there. The
    /// target is registered with `cleanup` before anything is written to it.
    async fn extract_payload(
        &self,
        job: &ExtractJob<'_>,
        cleanup: &mut Cleanup,
    ) -> Result<PathBuf, ExtractError> {
        info!("Looking for the disk image in {:?}", job.container);

        let container = job.container.to_owned();
        let entry = task::spawn_blocking(move || find_largest_entry(&container)).await??;

        let entry = match entry {
            Some(e) if e.name.ends_with(IMAGE_SUFFIX) || e.name.ends_with(ENCRYPTED_IMAGE_SUFFIX) => e,
            other => {
                let name = other.map(|e| e.name).unwrap_or_default();
                warn!("No disk image in {:?} (largest entry: {name:?}), ignoring {}",
                      job.container, job.record.version);

                self.ignore(job).await?;
                return Err(ExtractError::Unextractable(name));
            }
        };

        debug!("Largest entry: {} ({} bytes)", entry.name, entry.size);

        let file_name = Path::new(&entry.name)
            .file_name()
            .ok_or_else(|| ExtractError::Unextractable(entry.name.clone()))?;
        let target = job.output.join(file_name);
        cleanup.add(&target);

        match fs::metadata(&target).await {
            Ok(m) if m.len() == entry.size => {
                info!("Disk image already extracted: {target:?}");
                return Ok(target);
            }
            _ => {}
        }

        info!("Extracting {} to {:?}", entry.name, job.output);

        let mut bar = ProgressBar::new(io::stderr(), entry.name.clone(), Some(entry.size));
        bar.set_mode(Some(self.progress));

        let container = job.container.to_owned();
        let target_clone = target.clone();
        task::spawn_blocking(move || copy_entry(&container, entry.index, &target_clone, bar)).await??;

        Ok(target)
    }

    /// Decrypt an AEA image. The decrypted image is written next to it with
    /// the `.aea` extension removed. The encrypted image and the key artifacts
    /// are deleted afterwards, whether decryption succeeded or not.
    async fn decrypt_payload(&self, job: &ExtractJob<'_>, encrypted: &Path) -> Result<(), ExtractError> {
        info!("Decrypting {encrypted:?}");

        let keys_dir = tempfile::Builder::new()
            .prefix(".keys")
            .tempdir_in(job.output)
            .map_err(|e| ExtractError::Io(job.output.to_owned(), e))?;

        let result = async {
            self.aea.extract_keys(job.container, keys_dir.path()).await
                .map_err(|e| ExtractError::KeyExtractionFailed(e.diagnostics()))?;

            let key = find_key(keys_dir.path(), encrypted)?;

            self.aea.decrypt(&key, encrypted, job.output).await
                .map_err(|e| ExtractError::DecryptionFailed(e.diagnostics()))
        }.await;

        if let Err(e) = delete_if_exists(encrypted).await {
            warn!("Failed to delete {encrypted:?}: {e}");
        }
        if let Err(e) = keys_dir.close() {
            warn!("Failed to delete key directory: {e}");
        }

        result
    }
}
