//! Fixtures and stand-ins for the external tools, shared by the unit tests.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{
    catalog::FirmwareRecord,
    extract::CARRIER_BUNDLES_DIR,
    tools::{AeaTool, ArchiveTool, LegacyDecryptor, ToolError, LEGACY_IMAGE_DIAGNOSTIC},
};

/// Bundles created by [`FakeArchive::extract`].
pub const FAKE_BUNDLES: [&str; 2] = ["ATT_US.bundle", "Verizon_US.bundle"];

/// Wrapper directory used when the fake filesystem has a parent directory.
pub const FAKE_PARENT: &str = "root";

/// Prefix written by [`FakeLegacy`] to mark an image as decrypted.
const LEGACY_MARKER: &[u8] = b"decrypted:";

pub fn firmware(identifier: &str, version: &str) -> FirmwareRecord {
    firmware_at(identifier, version, &format!("http://localhost/{identifier}-{version}.ipsw"))
}

pub fn firmware_at(identifier: &str, version: &str, url: &str) -> FirmwareRecord {
    FirmwareRecord {
        identifier: identifier.to_owned(),
        version: version.to_owned(),
        build_id: format!("{version}B"),
        url: url.to_owned(),
        sha1sum: None,
        md5sum: None,
        filesize: None,
        releasedate: None,
    }
}

/// Build a firmware container holding the given entries.
pub fn container_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);

    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data.as_bytes()).unwrap();
    }

    zip.finish().unwrap().into_inner()
}

fn tool_failure(message: &str) -> ToolError {
    #[cfg(unix)]
    let status = {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(2 << 8)
    };
    #[cfg(windows)]
    let status = {
        use std::os::windows::process::ExitStatusExt;
        ExitStatus::from_raw(2)
    };

    ToolError::Failed {
        program: "fake".into(),
        status,
        stderr: message.to_owned(),
    }
}

/// [`ArchiveTool`] that creates a small carrier bundle tree instead of reading
/// the image.
#[derive(Debug, Default)]
pub struct FakeArchive {
    /// Put the filesystem under [`FAKE_PARENT`]
    pub has_parent: bool,
    /// Refuse to open images not decrypted by [`FakeLegacy`]
    pub legacy_encrypted: bool,
    /// Fail every listing with a generic error
    pub broken: bool,
    /// Time spent in each extraction
    pub delay: Duration,

    pub images: Mutex<Vec<PathBuf>>,
    pub image_contents: Mutex<Vec<Vec<u8>>>,
    pub patterns: Mutex<Vec<String>>,
    pub extract_calls: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl FakeArchive {
    fn root(&self) -> String {
        if self.has_parent {
            format!("{FAKE_PARENT}/")
        } else {
            String::new()
        }
    }
}

#[async_trait]
impl ArchiveTool for FakeArchive {
    async fn list(&self, image: &Path) -> Result<Vec<String>, ToolError> {
        let data = fs::read(image).map_err(|e| tool_failure(&e.to_string()))?;
        self.images.lock().unwrap().push(image.to_owned());
        self.image_contents.lock().unwrap().push(data.clone());

        if self.broken {
            return Err(tool_failure("ERROR: Data Error : 090-1.dmg"));
        } else if self.legacy_encrypted && !data.starts_with(LEGACY_MARKER) {
            return Err(tool_failure(&format!("ERROR: {image:?}\n{LEGACY_IMAGE_DIAGNOSTIC}")));
        }

        let root = self.root();
        let mut paths = vec![
            format!("{root}System"),
            format!("{root}System/Library"),
            format!("{root}System/Library/Carrier Bundles"),
            format!("{root}usr"),
        ];
        if self.has_parent {
            paths.insert(0, FAKE_PARENT.to_owned());
        }

        Ok(paths)
    }

    async fn extract(&self, _image: &Path, output: &Path, pattern: &str) -> Result<(), ToolError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        self.patterns.lock().unwrap().push(pattern.to_owned());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let platform_dir = output.join(self.root())
            .join(CARRIER_BUNDLES_DIR)
            .join("iPhone");

        for bundle in FAKE_BUNDLES {
            let dir = platform_dir.join(bundle);
            fs::create_dir_all(dir.join("en.lproj")).unwrap();
            fs::write(dir.join("Info.plist"), bundle.as_bytes()).unwrap();
            fs::write(dir.join("en.lproj").join("InfoPlist.strings"), b"strings").unwrap();
        }

        Ok(())
    }
}

/// [`AeaTool`] that writes one key per encrypted container entry and
/// "decrypts" by copying.
#[derive(Debug, Default)]
pub struct FakeAea {
    /// Produce no key artifacts
    pub no_keys: AtomicBool,
    /// Fail after writing the key artifacts
    pub fail_keys: AtomicBool,
    /// Fail after writing part of the decrypted image
    pub fail_decrypt: AtomicBool,
    pub keys_calls: AtomicUsize,
    pub used_keys: Mutex<Vec<String>>,
}

#[async_trait]
impl AeaTool for FakeAea {
    async fn extract_keys(&self, container: &Path, output: &Path) -> Result<(), ToolError> {
        self.keys_calls.fetch_add(1, Ordering::SeqCst);

        let dir = output.join("21E236__iPhone14,2");
        fs::create_dir_all(&dir).unwrap();

        if self.no_keys.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Sorts before the real key, so only an exact match picks the latter
        fs::write(dir.join("000-decoy.dmg.aea.pem"), b"decoy").unwrap();

        let zip = ZipArchive::new(File::open(container).unwrap()).unwrap();
        for name in zip.file_names().filter(|n| n.ends_with(".aea")) {
            fs::write(dir.join(format!("{name}.pem")), b"key").unwrap();
        }

        if self.fail_keys.load(Ordering::SeqCst) {
            return Err(tool_failure("failed to parse FCS keys"));
        }

        Ok(())
    }

    async fn decrypt(&self, key: &Path, image: &Path, output: &Path) -> Result<(), ToolError> {
        let key_name = key.file_name().unwrap().to_string_lossy().into_owned();
        self.used_keys.lock().unwrap().push(key_name);

        let stem = image.file_stem().unwrap();

        if self.fail_decrypt.load(Ordering::SeqCst) {
            fs::write(output.join(stem), b"partial").unwrap();
            return Err(tool_failure("aea: invalid key"));
        }

        let data = fs::read(image).unwrap();
        fs::write(output.join(stem), data).unwrap();

        Ok(())
    }
}

/// [`LegacyDecryptor`] that marks images so that [`FakeArchive`] accepts them.
#[derive(Debug, Default)]
pub struct FakeLegacy {
    /// Leave the image untouched
    pub ineffective: AtomicBool,
    /// Fail without touching the image
    pub broken: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl LegacyDecryptor for FakeLegacy {
    async fn decrypt(&self, _identifier: &str, _build_id: &str, image: &Path) -> Result<(), ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.broken.load(Ordering::SeqCst) {
            return Err(tool_failure("no key for this build"));
        }

        if !self.ineffective.load(Ordering::SeqCst) {
            let mut data = LEGACY_MARKER.to_vec();
            data.extend(fs::read(image).unwrap());
            fs::write(image, data).unwrap();
        }

        Ok(())
    }
}
