//! Discovery of carrier bundles in an extracted filesystem tree.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::task;
use walkdir::WalkDir;

use crate::extract::{ExtractionOutcome, CARRIER_BUNDLES_DIR};

const BUNDLE_EXT: &str = "bundle";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("I/O error on {0:?}: {1}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Failed to walk {0:?}: {1}")]
    Walk(PathBuf, #[source] walkdir::Error),
    #[error("Bundle discovery task failed: {0}")]
    Join(#[from] task::JoinError),
}

/// Filesystem roots in `version_dir` that may contain the carrier bundles
/// directory. If the image has a parent directory, any subdirectory that is
/// not itself a bundle qualifies.
fn filesystem_roots(version_dir: &Path, has_parent: bool) -> Result<Vec<PathBuf>, BundleError> {
    if !has_parent {
        return Ok(vec![version_dir.to_owned()]);
    }

    let mut roots = vec![];

    for entry in fs::read_dir(version_dir).map_err(|e| BundleError::Io(version_dir.to_owned(), e))? {
        let entry = entry.map_err(|e| BundleError::Io(version_dir.to_owned(), e))?;
        let path = entry.path();

        if path.is_dir() && path.extension().map_or(true, |e| e != BUNDLE_EXT) {
            roots.push(path);
        }
    }

    roots.sort();
    Ok(roots)
}

fn collect_blocking(version_dir: &Path, has_parent: bool) -> Result<Vec<PathBuf>, BundleError> {
    let mut bundles = vec![];

    for root in filesystem_roots(version_dir, has_parent)? {
        let carrier_dir = root.join(CARRIER_BUNDLES_DIR);
        if !carrier_dir.is_dir() {
            debug!("No carrier bundles in {root:?}");
            continue;
        }

        // <platform>/<name>.bundle
        let walk = WalkDir::new(&carrier_dir)
            .min_depth(2)
            .max_depth(2)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()));

        for entry in walk {
            let entry = entry.map_err(|e| BundleError::Walk(carrier_dir.clone(), e))?;
            let path = entry.path();

            if !entry.file_type().is_dir()
                || path.extension().map_or(true, |e| e != BUNDLE_EXT) {
                debug!("Skipping non-bundle: {path:?}");
                continue;
            }

            let target = version_dir.join(entry.file_name());
            if target.exists() {
                warn!("Duplicate bundle name, keeping the first: {path:?}");
                continue;
            }

            fs::rename(path, &target).map_err(|e| BundleError::Io(path.to_owned(), e))?;
            bundles.push(target);
        }

        // Only the bundles are kept from the extracted tree
        let extracted = if has_parent { root } else { root.join("System") };
        fs::remove_dir_all(&extracted).map_err(|e| BundleError::Io(extracted.clone(), e))?;
    }

    bundles.sort();
    Ok(bundles)
}

/// Move every carrier bundle extracted into `version_dir` to the top level of
/// `version_dir` and delete the rest of the extracted tree. Returns the paths
/// of the moved bundles, sorted.
pub async fn collect_bundles(
    version_dir: &Path,
    outcome: ExtractionOutcome,
) -> Result<Vec<PathBuf>, BundleError> {
    let version_dir = version_dir.to_owned();
    let bundles = task::spawn_blocking(move || {
        collect_blocking(&version_dir, outcome.has_parent)
    }).await??;

    info!("Found {} carrier bundles", bundles.len());
    Ok(bundles)
}
