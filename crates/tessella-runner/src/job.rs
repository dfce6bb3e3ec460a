//! The scheduler-job handle grouping a batch of task invocations.

use std::path::Path;
use std::path::PathBuf;

use crate::error::JobDiagnostics;
use crate::error::RunnerError;
use crate::task::TaskInvocation;
use crate::task::validate_single_subfolder;

/// The placeholder the scheduler substitutes with the concrete job id in
/// output and error paths.
const JOB_ID_PLACEHOLDER: &str = "%j";

/// One scheduler submission unit containing a batch of task invocations.
///
/// A job is created at prepare time with its scheduler id unset; the id is
/// assigned exactly once at submit time, which also resolves the
/// [`JOB_ID_PLACEHOLDER`] in the stdout and stderr paths.
#[derive(Debug, Clone)]
pub(crate) struct SlurmJob {
    /// The locally-unique label of the job.
    label: String,
    /// The ordered invocations contained in the job.
    invocations: Vec<TaskInvocation>,
    /// The scheduler job id; `None` until submission succeeds.
    slurm_id: Option<u64>,
    /// The local path of the submission script.
    script: PathBuf,
    /// The local path of the job's stdout file.
    stdout: PathBuf,
    /// The local path of the job's stderr file.
    stderr: PathBuf,
}

impl SlurmJob {
    /// Creates a job from a non-empty batch of invocations sharing one
    /// subfolder.
    ///
    /// Violations of either requirement are programming-invariant errors.
    pub fn new(label: impl Into<String>, invocations: Vec<TaskInvocation>) -> Result<Self, RunnerError> {
        let label = label.into();
        if invocations.is_empty() {
            return Err(RunnerError::validation(format!(
                "job `{label}` must contain at least one invocation",
            )));
        }
        validate_single_subfolder(&invocations)?;

        let subfolder = invocations[0].files().subfolder().to_path_buf();
        Ok(Self {
            script: subfolder.join(format!("{label}.sh")),
            stdout: subfolder.join(format!("{label}-slurm-{JOB_ID_PLACEHOLDER}.out")),
            stderr: subfolder.join(format!("{label}-slurm-{JOB_ID_PLACEHOLDER}.err")),
            label,
            invocations,
            slurm_id: None,
        })
    }

    /// Gets the locally-unique label of the job.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Gets the invocations contained in the job.
    pub fn invocations(&self) -> &[TaskInvocation] {
        &self.invocations
    }

    /// Gets the local subfolder the job executes in.
    pub fn subfolder(&self) -> &Path {
        self.invocations[0].files().subfolder()
    }

    /// Gets the remote subfolder the job executes in, if any.
    pub fn remote_subfolder(&self) -> Option<&Path> {
        self.invocations[0].files().remote_subfolder()
    }

    /// Gets the scheduler job id, if the job has been submitted.
    pub fn slurm_id(&self) -> Option<u64> {
        self.slurm_id
    }

    /// Gets the local path of the submission script.
    pub fn script(&self) -> &Path {
        &self.script
    }

    /// Gets the remote path of the submission script, if a remote working
    /// directory is configured.
    pub fn remote_script(&self) -> Option<PathBuf> {
        self.invocations[0].files().to_remote(&self.script)
    }

    /// Gets the local path of the job's stdout file.
    ///
    /// Contains the [`JOB_ID_PLACEHOLDER`] until the job is submitted.
    pub fn stdout(&self) -> &Path {
        &self.stdout
    }

    /// Gets the local path of the job's stderr file.
    ///
    /// Contains the [`JOB_ID_PLACEHOLDER`] until the job is submitted.
    pub fn stderr(&self) -> &Path {
        &self.stderr
    }

    /// Gets the remote counterpart of the stdout path, if any.
    pub fn remote_stdout(&self) -> Option<PathBuf> {
        self.invocations[0].files().to_remote(&self.stdout)
    }

    /// Gets the remote counterpart of the stderr path, if any.
    pub fn remote_stderr(&self) -> Option<PathBuf> {
        self.invocations[0].files().to_remote(&self.stderr)
    }

    /// Assigns the scheduler job id, resolving the placeholder in the stdout
    /// and stderr paths.
    ///
    /// # Panics
    ///
    /// Panics if an id was already assigned; a job is submitted exactly once.
    pub fn assign_id(&mut self, id: u64) {
        assert!(
            self.slurm_id.is_none(),
            "job `{label}` was already submitted",
            label = self.label,
        );
        self.slurm_id = Some(id);
        let resolve = |path: &Path| {
            PathBuf::from(
                path.to_string_lossy()
                    .replace(JOB_ID_PLACEHOLDER, &id.to_string()),
            )
        };
        self.stdout = resolve(&self.stdout);
        self.stderr = resolve(&self.stderr);
    }

    /// Gets the local outcome-blob path expected for each contained
    /// invocation, in invocation order.
    pub fn expected_outcomes(&self) -> Vec<PathBuf> {
        self.invocations
            .iter()
            .map(|invocation| invocation.files().outcome_blob())
            .collect()
    }

    /// Gets the diagnostic paths attached to job-level failures.
    pub fn diagnostics(&self) -> JobDiagnostics {
        JobDiagnostics {
            script: self.script.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }
}
