//! Write-once result cells and the live-jobs table.
//!
//! The table is the only concurrently-mutated in-memory structure of the
//! runner. It has exactly two mutation points: insert at submit time and pop
//! at completion or shutdown time, both under one lock. Popping an entry is
//! what makes completion exactly-once: whichever of the polling engine or the
//! shutdown path removes the entry first owns its resolution.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use crate::error::RunnerError;
use crate::job::SlurmJob;

/// The terminal result of one task invocation.
pub(crate) type UnitResult = Result<Option<Value>, RunnerError>;

/// The terminal results of every invocation of one job, in invocation order.
pub(crate) type JobOutcome = Vec<UnitResult>;

/// The resolving half of a pending result.
///
/// A cell is bound 1:1 to a job and is resolved exactly once; a second
/// resolution attempt is a logged no-op, never a panic, since completion and
/// shutdown may race benignly.
#[derive(Debug)]
pub(crate) struct ResultCell {
    /// The label of the job the cell is bound to.
    label: String,
    /// The number of invocations the outcome must cover.
    units: usize,
    /// The sender, present until the first resolution.
    slot: Mutex<Option<oneshot::Sender<JobOutcome>>>,
}

impl ResultCell {
    /// Creates a cell for a job with `units` invocations, returning the
    /// resolving half and the awaiting half.
    pub fn new(label: impl Into<String>, units: usize) -> (Self, ResultHandle) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                label: label.into(),
                units,
                slot: Mutex::new(Some(tx)),
            },
            ResultHandle { rx, units },
        )
    }

    /// Resolves the cell with the given outcome.
    ///
    /// If the cell was already resolved or cancelled, the outcome is dropped
    /// with a log message.
    pub fn resolve(&self, outcome: JobOutcome) {
        debug_assert_eq!(
            outcome.len(),
            self.units,
            "outcome must cover every invocation",
        );
        let sender = self.slot.lock().expect("lock should not be poisoned").take();
        match sender {
            Some(sender) => {
                if sender.send(outcome).is_err() {
                    debug!(
                        label = self.label,
                        "job outcome dropped: the submitting side is gone",
                    );
                }
            }
            None => {
                warn!(
                    label = self.label,
                    "ignoring second resolution of an already-resolved result",
                );
            }
        }
    }

    /// Resolves every unit of the cell with a clone of the given error.
    pub fn resolve_all_with(&self, error: RunnerError) {
        let outcome: JobOutcome = (0..self.units).map(|_| Err(error.clone())).collect();
        self.resolve(outcome);
    }
}

/// The awaiting half of a pending result.
#[derive(Debug)]
pub(crate) struct ResultHandle {
    /// The receiver resolved by the paired [`ResultCell`].
    rx: oneshot::Receiver<JobOutcome>,
    /// The number of invocations the outcome covers.
    units: usize,
}

impl ResultHandle {
    /// Waits for the paired cell to be resolved.
    ///
    /// Every reachable cell is resolved before the runner's table is cleared,
    /// so a dropped sender can only mean the runner was torn down without a
    /// proper shutdown; that case is reported as a shutdown cancellation.
    pub async fn wait(self) -> JobOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => vec![
                Err(RunnerError::shutdown(
                    "the runner was dropped before the job completed",
                ));
                self.units
            ],
        }
    }
}

/// A sentinel snapshot of one waiting job, consumed by the polling engine.
#[derive(Debug, Clone)]
pub struct WaitEntry {
    /// The scheduler job id being awaited.
    pub job_id: u64,
    /// The local outcome files whose joint existence signals completion.
    pub sentinels: Vec<PathBuf>,
    /// When the job was registered with the table.
    pub registered_at: Instant,
}

/// A submitted job together with its pending-result cell.
#[derive(Debug)]
pub(crate) struct SubmittedJob {
    /// The submitted job.
    pub job: SlurmJob,
    /// The cell resolved when the job completes.
    pub cell: ResultCell,
    /// When the job was inserted into the table.
    pub registered_at: Instant,
}

/// The table of submitted jobs awaiting completion, keyed by scheduler job
/// id.
#[derive(Debug, Default)]
pub(crate) struct JobTable {
    /// The submitted jobs, keyed by scheduler job id.
    jobs: Mutex<HashMap<u64, SubmittedJob>>,
}

impl JobTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a submitted job under its scheduler id.
    pub fn insert(&self, id: u64, entry: SubmittedJob) {
        let mut jobs = self.jobs.lock().expect("lock should not be poisoned");
        if let Some(previous) = jobs.insert(id, entry) {
            // Scheduler ids are unique; a collision means the scheduler
            // integration is broken. Resolve the evicted entry rather than
            // abandoning it.
            warn!(id, "duplicate scheduler job id in the live-jobs table");
            previous.cell.resolve_all_with(RunnerError::job_execution(format!(
                "scheduler returned duplicate job id {id}",
            )));
        }
    }

    /// Removes and returns the job with the given scheduler id.
    pub fn pop(&self, id: u64) -> Option<SubmittedJob> {
        self.jobs
            .lock()
            .expect("lock should not be poisoned")
            .remove(&id)
    }

    /// Removes and returns every job in the table.
    pub fn pop_all(&self) -> Vec<SubmittedJob> {
        self.jobs
            .lock()
            .expect("lock should not be poisoned")
            .drain()
            .map(|(_, entry)| entry)
            .collect()
    }

    /// Takes a sentinel snapshot of every waiting job.
    pub fn wait_entries(&self) -> Vec<WaitEntry> {
        self.jobs
            .lock()
            .expect("lock should not be poisoned")
            .iter()
            .map(|(id, entry)| WaitEntry {
                job_id: *id,
                sentinels: entry.job.expected_outcomes(),
                registered_at: entry.registered_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn cell_resolves_exactly_once() {
        let (cell, handle) = ResultCell::new("batch-000000", 1);
        cell.resolve(vec![Ok(Some(serde_json::json!(1)))]);
        // The second resolution is a logged no-op.
        cell.resolve(vec![Ok(Some(serde_json::json!(2)))]);

        let outcome = handle.wait().await;
        assert_eq!(outcome.len(), 1);
        assert_eq!(outcome[0].as_ref().unwrap(), &Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn concurrent_resolutions_yield_one_outcome() {
        let (cell, handle) = ResultCell::new("batch-000001", 1);
        let cell = Arc::new(cell);

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16u64 {
            let cell = cell.clone();
            tasks.spawn(async move {
                cell.resolve(vec![Ok(Some(serde_json::json!(i)))]);
            });
        }
        while tasks.join_next().await.is_some() {}

        // Exactly one of the sixteen attempts is observable.
        let outcome = handle.wait().await;
        assert_eq!(outcome.len(), 1);
        assert!(outcome[0].is_ok());
    }

    #[tokio::test]
    async fn cancellation_covers_every_unit() {
        let (cell, handle) = ResultCell::new("batch-000002", 3);
        cell.resolve_all_with(RunnerError::shutdown("draining"));

        let outcome = handle.wait().await;
        assert_eq!(outcome.len(), 3);
        assert!(
            outcome
                .iter()
                .all(|r| matches!(r, Err(e) if e.is_shutdown())),
        );
    }

    #[tokio::test]
    async fn resolving_after_the_receiver_is_gone_does_not_panic() {
        let (cell, handle) = ResultCell::new("batch-000003", 1);
        drop(handle);
        cell.resolve(vec![Ok(None)]);
    }

    #[test]
    fn pop_is_exactly_once() {
        let table = JobTable::new();
        let (cell, _handle) = ResultCell::new("batch-000004", 1);
        let job = SlurmJob::new(
            "batch-000004",
            vec![crate::task::TaskInvocation::new(
                "task",
                serde_json::Map::new(),
                crate::files::TaskFiles::new(std::path::Path::new("/wd"), None, 0, "t", None),
                1,
            )],
        )
        .unwrap();
        table.insert(
            9,
            SubmittedJob {
                job,
                cell,
                registered_at: Instant::now(),
            },
        );

        let entries = table.wait_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id, 9);
        assert!(table.pop(9).is_some());
        assert!(table.pop(9).is_none());
        assert!(table.wait_entries().is_empty());
    }
}
