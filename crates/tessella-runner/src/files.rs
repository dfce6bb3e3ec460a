//! Computed filesystem layout for task invocations.
//!
//! Nothing in this module is persisted: every path is derived from the
//! workflow task's order, its name, and an optional per-invocation component
//! identifier. The directory layout for one workflow task is:
//!
//! ```text
//! <workdir>/
//! ├─ 3_illumination_correction/           # one subfolder per workflow task
//! │  ├─ 3_illumination_correction__g1-args.json      # task arguments
//! │  ├─ 3_illumination_correction__g1-metadiff.json  # optional task output
//! │  ├─ 3_illumination_correction__g1-log.txt        # captured stdio
//! │  ├─ 3_illumination_correction__g1-input.json     # serialized call blob
//! │  ├─ 3_illumination_correction__g1-outcome.json   # serialized outcome blob
//! │  ├─ batch-000000.sh                   # one submission script per job
//! │  ├─ batch-000000-slurm-%j.out         # job stdout (`%j` = job id)
//! │  ├─ batch-000000-slurm-%j.err         # job stderr
//! ```
//!
//! When a remote working directory is configured, the remote layout mirrors
//! the local one relative to the respective working directories, so a job
//! archive can be moved between hosts unambiguously.

use std::path::Path;
use std::path::PathBuf;

/// Replaces every character outside `[A-Za-z0-9_-]` with an underscore.
///
/// Task names and component identifiers are user controlled (a component is
/// typically a Zarr image URL) and must be made safe for use in file names.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// The computed file paths for one task invocation.
///
/// All invocations of the same workflow task share one subfolder; the
/// per-invocation component only varies the file name prefix within it. This
/// is what allows a compound or parallel job to be packaged as a single
/// archive per batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFiles {
    /// The local subfolder holding every artifact of the workflow task.
    subfolder: PathBuf,
    /// The remote counterpart of [`subfolder`][Self::subfolder], if the
    /// runner uses a remote working directory.
    remote_subfolder: Option<PathBuf>,
    /// The file name prefix for this invocation's artifacts.
    prefix: String,
}

impl TaskFiles {
    /// Computes the file paths for one invocation of a workflow task.
    ///
    /// `component` distinguishes invocations of the same task within a
    /// parallel execution; when absent, the prefix is the subfolder name
    /// itself.
    pub fn new(
        workdir: &Path,
        remote_workdir: Option<&Path>,
        task_order: u32,
        task_name: &str,
        component: Option<&str>,
    ) -> Self {
        let folder_name = format!("{task_order}_{name}", name = sanitize(task_name));
        let prefix = match component {
            Some(component) => {
                format!("{folder_name}__{component}", component = sanitize(component))
            }
            None => folder_name.clone(),
        };

        Self {
            subfolder: workdir.join(&folder_name),
            remote_subfolder: remote_workdir.map(|w| w.join(&folder_name)),
            prefix,
        }
    }

    /// Gets the local subfolder for the workflow task.
    pub fn subfolder(&self) -> &Path {
        &self.subfolder
    }

    /// Gets the remote subfolder for the workflow task, if any.
    pub fn remote_subfolder(&self) -> Option<&Path> {
        self.remote_subfolder.as_deref()
    }

    /// Gets the file name prefix for this invocation.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Gets the local path of the task arguments file.
    pub fn args_json(&self) -> PathBuf {
        self.subfolder.join(format!("{}-args.json", self.prefix))
    }

    /// Gets the local path of the optional metadata-diff output file.
    pub fn metadiff_json(&self) -> PathBuf {
        self.subfolder.join(format!("{}-metadiff.json", self.prefix))
    }

    /// Gets the local path of the captured stdout/stderr log.
    pub fn log_file(&self) -> PathBuf {
        self.subfolder.join(format!("{}-log.txt", self.prefix))
    }

    /// Gets the local path of the serialized call blob read by the worker.
    pub fn input_blob(&self) -> PathBuf {
        self.subfolder.join(format!("{}-input.json", self.prefix))
    }

    /// Gets the local path of the serialized outcome blob written by the
    /// worker.
    ///
    /// The existence of this file doubles as the completion sentinel for
    /// backends that watch the filesystem.
    pub fn outcome_blob(&self) -> PathBuf {
        self.subfolder.join(format!("{}-outcome.json", self.prefix))
    }

    /// Translates a local path within the subfolder into its remote
    /// counterpart.
    ///
    /// Returns `None` if no remote working directory is configured.
    pub fn to_remote(&self, local: &Path) -> Option<PathBuf> {
        let remote = self.remote_subfolder.as_deref()?;
        let relative = local
            .strip_prefix(&self.subfolder)
            .expect("path should be within the task subfolder");
        Some(remote.join(relative))
    }
}
