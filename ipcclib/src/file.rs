use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
};

use log::trace;
use tokio::fs;

/// Extension of the temporary sibling used by [`write_atomic`].
pub const TEMP_EXT: &str = concat!(env!("CARGO_PKG_NAME"), "_temp");

/// Delete a file, but don't error out if the path doesn't exist.
pub async fn delete_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Recursively delete a directory, but don't error out if the path doesn't
/// exist.
pub async fn delete_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Blocking version of [`delete_if_exists`] for use in destructors.
pub fn delete_if_exists_sync(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Add an extension to a file path.
pub fn add_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Remove the last extension from a path if it matches `ext`.
pub fn strip_extension(path: &Path, ext: &str) -> Option<PathBuf> {
    if path.extension() == Some(OsStr::new(ext)) {
        Some(path.with_extension(""))
    } else {
        None
    }
}

/// Replace the contents of a file by writing to a temporary sibling and then
/// renaming it over the destination. Readers see either the old or the new
/// contents, never a partial write.
pub async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let temp_path = add_extension(path, TEMP_EXT);
    trace!("Writing {} bytes to {:?} via {:?}", data.len(), path, temp_path);

    let result = async {
        let mut file = fs::File::create(&temp_path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, data).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, path).await
    }.await;

    if result.is_err() {
        let _ = delete_if_exists(&temp_path).await;
    }

    result
}
