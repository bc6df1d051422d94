//! External programs used to take firmware images apart. Each capability is a
//! trait so that the extraction pipeline can be driven without the real tools.

use std::{
    ffi::{OsStr, OsString},
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Output, Stdio},
};

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::process::Command;

/// Diagnostic printed by 7-Zip when a disk image is encrypted with the legacy
/// scheme.
pub const LEGACY_IMAGE_DIAGNOSTIC: &str = "Cannot open the file as [Dmg] archive";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to run {0:?}: {1}")]
    Spawn(OsString, #[source] io::Error),
    #[error("{program:?} exited with {status}: {stderr}")]
    Failed {
        program: OsString,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{0}")]
    Unavailable(String),
}

impl ToolError {
    /// Diagnostic output of the tool, if it ran.
    pub fn diagnostics(&self) -> String {
        match self {
            Self::Failed { stderr, .. } => stderr.clone(),
            e => e.to_string(),
        }
    }

    /// Whether the failure means the image needs legacy decryption before it
    /// can be read.
    pub fn is_legacy_image(&self) -> bool {
        matches!(self, Self::Failed { stderr, .. } if stderr.contains(LEGACY_IMAGE_DIAGNOSTIC))
    }
}

/// Run a command to completion, capturing its output. A non-zero exit status
/// is returned as [`ToolError::Failed`].
pub async fn run(command: &mut Command) -> Result<Output, ToolError> {
    let program = command.as_std().get_program().to_owned();
    debug!("Running: {:?}", command.as_std());

    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ToolError::Spawn(program.clone(), e))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!("{program:?} stdout: {stdout}");
    debug!("{program:?} stderr: {stderr}");

    if !output.status.success() {
        // 7-Zip reports some errors on stdout
        let diagnostics = if stderr.trim().is_empty() { stdout } else { stderr };

        return Err(ToolError::Failed {
            program,
            status: output.status,
            stderr: diagnostics.into_owned(),
        });
    }

    Ok(output)
}

/// Archive tool capable of reading disk images.
#[async_trait]
pub trait ArchiveTool: Send + Sync {
    /// List the paths of all entries in an image.
    async fn list(&self, image: &Path) -> Result<Vec<String>, ToolError>;

    /// Extract the entries matching `pattern` into `output`. Existing files
    /// are kept.
    async fn extract(&self, image: &Path, output: &Path, pattern: &str) -> Result<(), ToolError>;
}

/// Tool for the encrypted (AEA) image format.
#[async_trait]
pub trait AeaTool: Send + Sync {
    /// Extract the per-image key artifacts (`*.pem`) for a firmware container
    /// into `output`.
    async fn extract_keys(&self, container: &Path, output: &Path) -> Result<(), ToolError>;

    /// Decrypt `image` with `key`. The decrypted image is written to `output`
    /// with the encrypted extension removed.
    async fn decrypt(&self, key: &Path, image: &Path, output: &Path) -> Result<(), ToolError>;
}

/// Decryptor for images using the legacy per-build key scheme.
#[async_trait]
pub trait LegacyDecryptor: Send + Sync {
    /// Decrypt `image` in place.
    async fn decrypt(&self, identifier: &str, build_id: &str, image: &Path) -> Result<(), ToolError>;
}

/// [`ArchiveTool`] backed by the `7z` executable.
#[derive(Clone, Debug)]
pub struct SevenZip {
    program: PathBuf,
}

impl SevenZip {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }
}

impl Default for SevenZip {
    fn default() -> Self {
        Self::new("7z")
    }
}

/// Parse the `Path = ` lines of `7z l -slt` output.
fn parse_slt_paths(output: &str) -> Vec<String> {
    output.lines()
        .filter_map(|l| l.strip_prefix("Path = "))
        .map(|p| p.replace('\\', "/"))
        .collect()
}

#[async_trait]
impl ArchiveTool for SevenZip {
    async fn list(&self, image: &Path) -> Result<Vec<String>, ToolError> {
        let output = run(Command::new(&self.program)
            .args(["l", "-ba", "-slt"])
            .arg(image)).await?;

        Ok(parse_slt_paths(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn extract(&self, image: &Path, output: &Path, pattern: &str) -> Result<(), ToolError> {
        let mut out_arg = OsString::from("-o");
        out_arg.push(output);

        run(Command::new(&self.program)
            .arg("x")
            .arg(image)
            .arg(out_arg)
            // Skip existing files, no progress, assume yes
            .args(["-aos", "-bd", "-y"])
            .arg(pattern)).await?;

        Ok(())
    }
}

/// [`AeaTool`] backed by the `ipsw` executable.
#[derive(Clone, Debug)]
pub struct Ipsw {
    program: PathBuf,
}

impl Ipsw {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }
}

impl Default for Ipsw {
    fn default() -> Self {
        Self::new("ipsw")
    }
}

#[async_trait]
impl AeaTool for Ipsw {
    async fn extract_keys(&self, container: &Path, output: &Path) -> Result<(), ToolError> {
        run(Command::new(&self.program)
            .args(["extract", "--fcs-key"])
            .arg(container)
            .arg("--output")
            .arg(output)).await?;

        Ok(())
    }

    async fn decrypt(&self, key: &Path, image: &Path, output: &Path) -> Result<(), ToolError> {
        run(Command::new(&self.program)
            .args(["fw", "aea", "--pem"])
            .arg(key)
            .arg(image)
            .arg("--output")
            .arg(output)).await?;

        Ok(())
    }
}

/// [`LegacyDecryptor`] that delegates to an external program invoked as
/// `<program> <identifier> <build id> <image>`. If no program is configured,
/// every call fails with [`ToolError::Unavailable`].
#[derive(Clone, Debug, Default)]
pub struct CommandLegacyDecryptor {
    program: Option<PathBuf>,
}

impl CommandLegacyDecryptor {
    pub fn new(program: Option<PathBuf>) -> Self {
        Self { program }
    }
}

#[async_trait]
impl LegacyDecryptor for CommandLegacyDecryptor {
    async fn decrypt(&self, identifier: &str, build_id: &str, image: &Path) -> Result<(), ToolError> {
        let program = self.program.as_ref().ok_or_else(|| ToolError::Unavailable(
            "No legacy decryptor is configured".to_owned()))?;

        run(Command::new(program)
            .args([OsStr::new(identifier), OsStr::new(build_id)])
            .arg(image)).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_parse_slt_paths() {
        let output = "\
Path = 090-12345-001.dmg
Type = Dmg

Path = System
Folder = +

Path = System/Library/Carrier Bundles
Folder = +
";
        assert_eq!(parse_slt_paths(output), [
            "090-12345-001.dmg",
            "System",
            "System/Library/Carrier Bundles",
        ]);
    }

    #[tokio::test]
    async fn test_legacy_unconfigured() {
        let result = CommandLegacyDecryptor::default()
            .decrypt("iPhone1,1", "1A543a", Path::new("x.dmg")).await;
        assert_matches!(result, Err(ToolError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run() {
        let output = run(Command::new("sh").args(["-c", "echo hi"])).await.unwrap();
        assert_eq!(output.stdout, b"hi\n");

        let result = run(Command::new("sh")
            .args(["-c", &format!("echo '{LEGACY_IMAGE_DIAGNOSTIC}' >&2; exit 2")])).await;
        let err = result.unwrap_err();
        assert!(err.is_legacy_image());
        assert!(err.diagnostics().contains("[Dmg]"));

        let result = run(&mut Command::new("/nonexistent/ipccdl-tool")).await;
        assert_matches!(result, Err(ToolError::Spawn(_, _)));
    }
}
