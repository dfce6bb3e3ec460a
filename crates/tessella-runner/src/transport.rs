//! The remote-transport collaborator interface.
//!
//! Transports are assumed to implement their own retry, backoff, and
//! connection locking; the runner never retries a transport call itself. The
//! [`LocalhostTransport`] implementation backs the `sudo`-impersonation
//! cluster backend, where the scheduler shares a filesystem with the server,
//! and doubles as the transport used in tests.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Blocking-style file and command transport towards an execution host.
///
/// All operations resolve once the remote side has completed them.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Runs a shell command on the execution host, returning its stdout.
    ///
    /// A non-zero exit status is an error.
    async fn run_command(&self, command: &str) -> Result<String>;

    /// Copies a local file to the execution host.
    async fn send_file(&self, local: &Path, remote: &Path) -> Result<()>;

    /// Copies a file from the execution host to a local path.
    async fn fetch_file(&self, remote: &Path, local: &Path) -> Result<()>;

    /// Returns `true` if the path exists on the execution host.
    async fn remote_exists(&self, path: &Path) -> Result<bool>;

    /// Creates a directory on the execution host.
    async fn mkdir(&self, path: &Path, parents: bool) -> Result<()>;

    /// Removes a folder on the execution host.
    ///
    /// The folder must be located under `safe_root`; this guards against a
    /// malformed path deleting data outside the runner's working area.
    async fn remove_folder(&self, path: &Path, safe_root: &Path) -> Result<()>;
}

/// Validates that `path` is an absolute, traversal-free path under
/// `safe_root`.
pub(crate) fn check_safe_root(path: &Path, safe_root: &Path) -> Result<()> {
    if !path.is_absolute() || !safe_root.is_absolute() {
        bail!(
            "refusing to remove `{path}`: both the folder and the safe root must be absolute",
            path = path.display(),
        );
    }
    let traverses = path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir));
    if traverses || !path.starts_with(safe_root) {
        bail!(
            "refusing to remove `{path}`: not contained in the safe root `{root}`",
            path = path.display(),
            root = safe_root.display(),
        );
    }
    Ok(())
}

/// A transport whose "remote" side is the local host.
///
/// Used by the `sudo`-impersonation backend where the scheduler is reachable
/// from the server itself and both sides see the same filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalhostTransport;

#[async_trait]
impl Transport for LocalhostTransport {
    async fn run_command(&self, command: &str) -> Result<String> {
        debug!(%command, "running local command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .with_context(|| format!("failed to spawn command `{command}`"))?;
        if !output.status.success() {
            bail!(
                "command `{command}` exited with status {status}: {stderr}",
                status = output.status,
                stderr = String::from_utf8_lossy(&output.stderr).trim_end(),
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn send_file(&self, local: &Path, remote: &Path) -> Result<()> {
        tokio::fs::copy(local, remote).await.with_context(|| {
            format!(
                "failed to copy `{local}` to `{remote}`",
                local = local.display(),
                remote = remote.display(),
            )
        })?;
        Ok(())
    }

    async fn fetch_file(&self, remote: &Path, local: &Path) -> Result<()> {
        self.send_file(remote, local).await
    }

    async fn remote_exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await.unwrap_or(false))
    }

    async fn mkdir(&self, path: &Path, parents: bool) -> Result<()> {
        let result = if parents {
            tokio::fs::create_dir_all(path).await
        } else {
            tokio::fs::create_dir(path).await
        };
        result.with_context(|| format!("failed to create directory `{}`", path.display()))
    }

    async fn remove_folder(&self, path: &Path, safe_root: &Path) -> Result<()> {
        check_safe_root(path, safe_root)?;
        tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("failed to remove folder `{}`", path.display()))
    }
}
