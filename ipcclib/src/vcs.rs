//! Git integration for keeping the output directory in a repository. Each
//! device directory is committed separately after it gains new versions.

use std::{
    io,
    path::{Path, PathBuf},
};

use log::{debug, info};
use thiserror::Error;
use tokio::process::Command;

use crate::{
    file::delete_dir_if_exists,
    tools::{self, ToolError},
};

const GIT: &str = "git";

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("Git command failed: {0}")]
    Git(#[from] ToolError),
    #[error("Failed to delete {0:?}: {1}")]
    Io(PathBuf, #[source] io::Error),
}

/// Git working tree containing the per-device output directories.
#[derive(Clone, Debug)]
pub struct Git {
    work_tree: PathBuf,
    remote: Option<String>,
    branch: Option<String>,
}

impl Git {
    pub fn new(work_tree: impl Into<PathBuf>) -> Self {
        Self {
            work_tree: work_tree.into(),
            remote: None,
            branch: None,
        }
    }

    /// Push to `remote` instead of the branch's upstream.
    pub fn remote(mut self, remote: Option<String>) -> Self {
        self.remote = remote;
        self
    }

    /// Push `branch` instead of the current branch. Only used together with
    /// [`Self::remote`].
    pub fn branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(GIT);
        command.current_dir(&self.work_tree);
        command
    }

    /// Restore the committed state of a device directory, so that the
    /// metadata from earlier runs is present. A device that was never
    /// committed is not an error.
    pub async fn restore(&self, identifier: &str) -> Result<(), VcsError> {
        let result = tools::run(self.command()
            .args(["checkout", "HEAD", "--", identifier])).await;

        match result {
            Ok(_) => {
                info!("Restored {identifier} from git");
                Ok(())
            }
            Err(ToolError::Failed { stderr, .. }) => {
                debug!("Nothing to restore for {identifier}: {}", stderr.trim());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Commit the device directory and push it.
    pub async fn snapshot(&self, identifier: &str) -> Result<(), VcsError> {
        tools::run(self.command().args(["add", "--", identifier])).await?;

        let message = format!("{identifier}: update carrier bundles");
        tools::run(self.command().args(["commit", "-m", message.as_str()])).await?;

        let mut push = self.command();
        push.arg("push");
        if let Some(remote) = &self.remote {
            push.arg(remote);
            if let Some(branch) = &self.branch {
                push.arg(branch);
            }
        }
        tools::run(&mut push).await?;

        info!("Committed and pushed {identifier}");
        Ok(())
    }

    /// Delete the device directory from the working tree.
    pub async fn discard(&self, identifier: &str) -> Result<(), VcsError> {
        let path = self.device_path(identifier);
        delete_dir_if_exists(&path).await
            .map_err(|e| VcsError::Io(path.clone(), e))?;

        info!("Nothing new for {identifier}, discarded {path:?}");
        Ok(())
    }

    fn device_path(&self, identifier: &str) -> PathBuf {
        self.work_tree.join(Path::new(identifier))
    }
}
