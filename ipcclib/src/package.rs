use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf, StripPrefixError},
};

use chrono::Utc;
use log::{debug, info};
use thiserror::Error;
use tokio::task;
use walkdir::WalkDir;

use crate::{
    hash::{self, HashError, HashKind},
    ledger::BundleArchive,
};

const ARCHIVE_EXT: &str = "tar";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("Not a bundle directory: {0:?}")]
    InvalidBundle(PathBuf),
    #[error("Failed to archive {0:?}: {1}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Failed to walk {0:?}: {1}")]
    Walk(PathBuf, #[source] walkdir::Error),
    #[error("Path outside of bundle: {0}")]
    StripPrefix(#[from] StripPrefixError),
    #[error("Failed to hash archive: {0}")]
    Hash(#[from] HashError),
    #[error("Packaging task failed: {0}")]
    Join(#[from] task::JoinError),
}

/// Write a tarball of `source` to `writer`, with `source`'s own name as the
/// top-level entry. Entries are sorted and headers carry no timestamps or
/// ownership so that identical trees produce identical archives.
fn write_tarball<W: Write>(writer: W, source: &Path, name: &Path) -> Result<W, PackageError> {
    let mut builder = tar::Builder::new(writer);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    // The tar crate does not sort directory listings
    let walk = WalkDir::new(source).sort_by(|a, b| a.file_name().cmp(b.file_name()));

    for entry in walk {
        let entry = entry.map_err(|e| PackageError::Walk(source.to_owned(), e))?;
        let path = entry.path();
        let archive_path = name.join(path.strip_prefix(source)?);

        debug!("Adding {path:?} as {archive_path:?}");
        builder.append_path_with_name(path, &archive_path)
            .map_err(|e| PackageError::Io(path.to_owned(), e))?;
    }

    builder.into_inner().map_err(|e| PackageError::Io(source.to_owned(), e))
}

fn package_blocking(bundle: &Path) -> Result<BundleArchive, PackageError> {
    let name = bundle.file_name()
        .ok_or_else(|| PackageError::InvalidBundle(bundle.to_owned()))?;
    if !bundle.is_dir() {
        return Err(PackageError::InvalidBundle(bundle.to_owned()));
    }

    let tar_path = bundle.with_extension(ARCHIVE_EXT);
    let file = File::create(&tar_path)
        .map_err(|e| PackageError::Io(tar_path.clone(), e))?;

    let mut writer = write_tarball(BufWriter::new(file), bundle, Path::new(name))?;
    writer.flush().map_err(|e| PackageError::Io(tar_path.clone(), e))?;
    let file = writer.into_inner().map_err(|e| PackageError::Io(tar_path.clone(), e.into_error()))?;
    file.sync_all().map_err(|e| PackageError::Io(tar_path.clone(), e))?;

    let file_size = file.metadata()
        .map_err(|e| PackageError::Io(tar_path.clone(), e))?
        .len();
    let sha1 = hash::file_digest(&tar_path, HashKind::Sha1)?;

    let tar_file = tar_path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let bundle_name = Path::new(&tar_file)
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(BundleArchive {
        bundle_name,
        tar_file,
        sha1,
        file_size,
        created_at: Utc::now(),
    })
}

/// Archive one bundle directory to a tarball next to it and describe the
/// result. `Foo.bundle` is archived as `Foo.tar` with `Foo.bundle` as the
/// top-level entry.
pub async fn package_bundle(bundle: &Path) -> Result<BundleArchive, PackageError> {
    let bundle = bundle.to_owned();
    let archive = task::spawn_blocking(move || package_blocking(&bundle)).await??;

    info!("Packaged {} ({} bytes, SHA-1 {})", archive.tar_file, archive.file_size, archive.sha1);
    Ok(archive)
}

/// Archive every bundle directory. Stops at the first failure.
pub async fn package_bundles(bundles: &[PathBuf]) -> Result<Vec<BundleArchive>, PackageError> {
    let mut archives = Vec::with_capacity(bundles.len());

    for bundle in bundles {
        archives.push(package_bundle(bundle).await?);
    }

    Ok(archives)
}
