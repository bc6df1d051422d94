use std::{
    fmt,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use log::debug;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::task;

use crate::catalog::FirmwareRecord;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Failed to read {0:?}: {1}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Hashing task failed: {0}")]
    Join(#[from] task::JoinError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashKind {
    Sha1,
    Md5,
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1 => f.write_str("SHA-1"),
            Self::Md5 => f.write_str("MD5"),
        }
    }
}

enum Hasher {
    Sha1(Sha1),
    Md5(md5::Context),
}

impl Hasher {
    fn new(kind: HashKind) -> Self {
        match kind {
            HashKind::Sha1 => Self::Sha1(Sha1::new()),
            HashKind::Md5 => Self::Md5(md5::Context::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Md5(h) => h.consume(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Md5(h) => format!("{:x}", h.compute()),
        }
    }
}

/// Compute the lowercase hex digest of a file. This blocks and should be run
/// via [`task::spawn_blocking`] from async code.
pub fn file_digest(path: &Path, kind: HashKind) -> Result<String, HashError> {
    let mut file = File::open(path)
        .map_err(|e| HashError::Io(path.to_owned(), e))?;
    let mut hasher = Hasher::new(kind);
    let mut buf = vec![0u8; 1024 * 1024];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(HashError::Io(path.to_owned(), e)),
        };
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize_hex())
}

/// Async wrapper around [`file_digest`].
pub async fn file_digest_async(path: &Path, kind: HashKind) -> Result<String, HashError> {
    let path = path.to_owned();
    task::spawn_blocking(move || file_digest(&path, kind)).await?
}

/// Check whether a file matches any of the reference checksums supplied by the
/// catalog. Returns `false` if the catalog supplied no usable checksum, since
/// the file cannot be verified in that case.
pub async fn matches_any(path: &Path, record: &FirmwareRecord) -> Result<bool, HashError> {
    let references = record.reference_hashes();
    if references.is_empty() {
        debug!("No reference checksum for {}", record.version);
        return Ok(false);
    }

    for (kind, expected) in references {
        let actual = file_digest_async(path, kind).await?;
        debug!("{kind} of {path:?}: {actual} (expected: {expected})");

        if actual.eq_ignore_ascii_case(expected) {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::testutil::firmware;

    #[test]
    fn test_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(file_digest(&path, HashKind::Sha1).unwrap(),
                   "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(file_digest(&path, HashKind::Md5).unwrap(),
                   "900150983cd24fb0d6963f7d28e17f72");

        assert_matches!(file_digest(&dir.path().join("missing"), HashKind::Sha1),
                        Err(HashError::Io(_, _)));
    }

    #[tokio::test]
    async fn test_matches_any() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();

        let mut record = firmware("iPhone1,1", "1.0");
        assert!(!matches_any(&path, &record).await.unwrap());

        // Either checksum is enough
        record.sha1sum = Some("0000".to_owned());
        record.md5sum = Some("900150983CD24FB0D6963F7D28E17F72".to_owned());
        assert!(matches_any(&path, &record).await.unwrap());

        record.md5sum = None;
        assert!(!matches_any(&path, &record).await.unwrap());

        record.sha1sum = Some("a9993e364706816aba3e25717850c26c9cd0d89d".to_owned());
        assert!(matches_any(&path, &record).await.unwrap());
    }
}
