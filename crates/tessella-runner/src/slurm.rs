//! The SLURM scheduler client.
//!
//! All scheduler interaction goes through a [`Transport`], so the same client
//! serves both cluster backends: the `sudo`-impersonation backend pairs it
//! with a localhost transport and a `sudo -u` command prefix, while the SSH
//! backend pairs it with an SSH transport and no prefix.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use regex::Regex;
use tracing::debug;
use tracing::info;

use crate::transport::Transport;

/// Matches the job id in the human-readable `sbatch` acknowledgement.
static SBATCH_OUTPUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Submitted batch job (\d+)").expect("regex should compile")
});

/// SLURM job states that mean the job is still queued or running.
///
/// A reported state outside this set, or a job id absent from the query
/// response altogether, means the job has reached a terminal state.
const ACTIVE_STATES: &[&str] = &[
    "PENDING",
    "RUNNING",
    "CONFIGURING",
    "COMPLETING",
    "SUSPENDED",
    "RESIZING",
    "REQUEUED",
    "REQUEUE_FED",
    "REQUEUE_HOLD",
];

/// Parses the job id from the output of `sbatch`.
///
/// Both the human-readable acknowledgement and the bare numeric output of
/// `sbatch --parsable` are accepted. An unparsable output is fatal: it means
/// the scheduler integration itself is broken, not that a transient fault
/// occurred, so callers must not retry.
pub(crate) fn parse_sbatch_output(output: &str) -> Result<u64> {
    let trimmed = output.trim();
    if let Ok(id) = trimmed.parse::<u64>() {
        return Ok(id);
    }
    if let Some(captures) = SBATCH_OUTPUT.captures(trimmed) {
        return captures[1]
            .parse::<u64>()
            .context("sbatch reported a job id that does not fit in 64 bits");
    }
    bail!("cannot parse a job id out of the sbatch output: `{trimmed}`");
}

/// Parses a `squeue --noheader --format='%i %T'` response into a map from job
/// id to reported state.
///
/// Malformed lines are skipped: the scheduler occasionally interleaves
/// warnings with the tabular output.
pub(crate) fn parse_squeue_output(output: &str) -> HashMap<u64, String> {
    let mut states = HashMap::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(id), Some(state)) = (fields.next(), fields.next()) else {
            continue;
        };
        // Array job ids ("123_4") are reported under their base id.
        let base = id.split('_').next().unwrap_or(id);
        if let Ok(id) = base.parse::<u64>() {
            states.insert(id, state.to_string());
        }
    }
    states
}

/// Returns `true` if a reported SLURM state is terminal.
pub(crate) fn is_terminal_state(state: &str) -> bool {
    !ACTIVE_STATES.contains(&state)
}

/// A client for submitting, querying, and cancelling SLURM jobs.
#[derive(Debug)]
pub struct SlurmClient<T: Transport> {
    /// The transport commands are issued through.
    transport: Arc<T>,
    /// The user to impersonate with `sudo -u`, if any.
    impersonate: Option<String>,
}

impl<T: Transport> SlurmClient<T> {
    /// Creates a client issuing scheduler commands through the given
    /// transport, optionally impersonating another user.
    pub fn new(transport: Arc<T>, impersonate: Option<String>) -> Self {
        Self {
            transport,
            impersonate,
        }
    }

    /// Wraps a scheduler command with the impersonation prefix, if any.
    fn wrap(&self, command: String) -> String {
        match &self.impersonate {
            Some(user) => format!("sudo --non-interactive -u {user} {command}"),
            None => command,
        }
    }

    /// Submits the script at the given path, returning the scheduler job id.
    pub async fn submit(&self, script: &Path) -> Result<u64> {
        let command = self.wrap(format!("sbatch {}", script.display()));
        let output = self
            .transport
            .run_command(&command)
            .await
            .context("failed to run the sbatch command")?;
        let id = parse_sbatch_output(&output)?;
        info!(id, script = %script.display(), "submitted batch job");
        Ok(id)
    }

    /// Queries the states of the given jobs.
    ///
    /// Jobs the scheduler no longer knows about are absent from the returned
    /// map; old job records are evicted, so absence usually means completion.
    pub async fn query(&self, ids: &[u64]) -> Result<HashMap<u64, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let command = self.wrap(format!(
            "squeue --noheader --format='%i %T' --states=all --jobs={joined}",
        ));
        let output = self.transport.run_command(&command).await?;
        let states = parse_squeue_output(&output);
        debug!(queried = ids.len(), reported = states.len(), "queried job states");
        Ok(states)
    }

    /// Cancels the given jobs in one bulk command.
    pub async fn cancel(&self, ids: &[u64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let joined = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let command = self.wrap(format!("scancel {joined}"));
        self.transport
            .run_command(&command)
            .await
            .context("failed to run the scancel command")?;
        info!(count = ids.len(), "cancelled outstanding jobs");
        Ok(())
    }
}
