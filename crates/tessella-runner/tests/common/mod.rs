//! Shared test doubles for the integration suite.
//!
//! The fake scheduler intercepts `sbatch`, `squeue`, and `scancel` commands
//! while delegating everything else (archive packing, file moves) to the
//! real localhost transport, so staging and artifact collection run against
//! a real filesystem.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tessella_runner::HistoryUnitId;
use tessella_runner::LocalhostTransport;
use tessella_runner::RunnerConfig;
use tessella_runner::StatusTracker;
use tessella_runner::Transport;
use tessella_runner::UnitStatus;
use tessella_runner::command::UnitOutcome;

/// A status tracker recording every update it receives.
#[derive(Default)]
pub struct RecordingTracker {
    /// The updates, in arrival order.
    updates: Mutex<Vec<(HistoryUnitId, UnitStatus)>>,
}

impl RecordingTracker {
    /// Gets the latest recorded status per unit.
    pub fn statuses(&self) -> HashMap<HistoryUnitId, UnitStatus> {
        self.updates.lock().unwrap().iter().copied().collect()
    }

    /// Gets the total number of updates received.
    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

#[async_trait]
impl StatusTracker for RecordingTracker {
    async fn update_status(&self, unit: HistoryUnitId, status: UnitStatus) -> Result<()> {
        self.updates.lock().unwrap().push((unit, status));
        Ok(())
    }
}

/// The shared state behind a [`FakeSlurm`] handle.
#[derive(Default)]
struct FakeSlurmState {
    /// The next scheduler job id to hand out.
    next_id: AtomicU64,
    /// The submitted jobs, as `(id, full sbatch command)` pairs.
    submitted: Mutex<Vec<(u64, String)>>,
    /// The reported state per job id.
    states: Mutex<HashMap<u64, String>>,
    /// Every id passed to `scancel`, in arrival order.
    cancelled: Mutex<Vec<u64>>,
    /// The number of `squeue` invocations so far.
    queries: AtomicUsize,
    /// When set, every `squeue` invocation fails.
    queries_failing: AtomicBool,
}

/// A transport that fakes the SLURM command-line tools.
///
/// Clones share state, so a test can keep one handle while the runner owns
/// another.
#[derive(Default, Clone)]
pub struct FakeSlurm {
    /// Handles every non-scheduler command and all file operations.
    delegate: LocalhostTransport,
    /// The scheduler state shared between clones.
    state: Arc<FakeSlurmState>,
}

impl FakeSlurm {
    /// Creates a fake scheduler whose first job id is `first_id`.
    pub fn starting_at(first_id: u64) -> Self {
        let fake = Self::default();
        fake.state.next_id.store(first_id, Ordering::Relaxed);
        fake
    }

    /// Gets the submitted jobs, as `(id, full sbatch command)` pairs.
    pub fn submitted(&self) -> Vec<(u64, String)> {
        self.state.submitted.lock().unwrap().clone()
    }

    /// Overrides the reported state of a job.
    pub fn set_state(&self, id: u64, state: &str) {
        self.state
            .states
            .lock()
            .unwrap()
            .insert(id, state.to_string());
    }

    /// Gets every id passed to `scancel` so far.
    pub fn cancelled(&self) -> Vec<u64> {
        self.state.cancelled.lock().unwrap().clone()
    }

    /// Removes a job from the reported queue, as a scheduler evicting the
    /// record of an old job would.
    pub fn forget(&self, id: u64) {
        self.state.states.lock().unwrap().remove(&id);
    }

    /// Makes every subsequent `squeue` invocation fail (or succeed again).
    pub fn fail_queries(&self, fail: bool) {
        self.state.queries_failing.store(fail, Ordering::SeqCst);
    }

    /// Gets the number of `squeue` invocations so far, failed ones included.
    pub fn query_count(&self) -> usize {
        self.state.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeSlurm {
    async fn run_command(&self, command: &str) -> Result<String> {
        if command.contains("sbatch") {
            let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
            self.state
                .submitted
                .lock()
                .unwrap()
                .push((id, command.to_string()));
            self.state
                .states
                .lock()
                .unwrap()
                .insert(id, "PENDING".to_string());
            return Ok(format!("Submitted batch job {id}\n"));
        }
        if command.contains("squeue") {
            self.state.queries.fetch_add(1, Ordering::SeqCst);
            if self.state.queries_failing.load(Ordering::SeqCst) {
                anyhow::bail!("squeue: error: Socket timed out on send/recv operation");
            }
            let states = self.state.states.lock().unwrap();
            let mut lines = String::new();
            for (id, state) in states.iter() {
                lines.push_str(&format!("{id} {state}\n"));
            }
            return Ok(lines);
        }
        if command.contains("scancel") {
            let mut cancelled = self.state.cancelled.lock().unwrap();
            for token in command.split_whitespace().skip(1) {
                if let Ok(id) = token.parse::<u64>() {
                    cancelled.push(id);
                }
            }
            return Ok(String::new());
        }
        self.delegate.run_command(command).await
    }

    async fn send_file(&self, local: &Path, remote: &Path) -> Result<()> {
        self.delegate.send_file(local, remote).await
    }

    async fn fetch_file(&self, remote: &Path, local: &Path) -> Result<()> {
        self.delegate.fetch_file(remote, local).await
    }

    async fn remote_exists(&self, path: &Path) -> Result<bool> {
        self.delegate.remote_exists(path).await
    }

    async fn mkdir(&self, path: &Path, parents: bool) -> Result<()> {
        self.delegate.mkdir(path, parents).await
    }

    async fn remove_folder(&self, path: &Path, safe_root: &Path) -> Result<()> {
        self.delegate.remove_folder(path, safe_root).await
    }
}

/// A fake scheduler that parks every `sbatch` until a permit is granted.
///
/// Lets a test hold a submission mid-flight while driving the runner from
/// the outside.
#[derive(Clone)]
pub struct GatedSlurm {
    /// The gated scheduler.
    inner: FakeSlurm,
    /// Permits consumed by `sbatch` invocations.
    gate: Arc<tokio::sync::Semaphore>,
    /// The number of `sbatch` invocations that reached the gate.
    attempts: Arc<AtomicUsize>,
}

impl GatedSlurm {
    /// Wraps a fake scheduler; the gate starts closed.
    pub fn new(inner: FakeSlurm) -> Self {
        Self {
            inner,
            gate: Arc::new(tokio::sync::Semaphore::new(0)),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Lets one parked `sbatch` through.
    pub fn release_one(&self) {
        self.gate.add_permits(1);
    }

    /// Gets the number of `sbatch` invocations that reached the gate.
    pub fn sbatch_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for GatedSlurm {
    async fn run_command(&self, command: &str) -> Result<String> {
        if command.contains("sbatch") {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await?.forget();
        }
        self.inner.run_command(command).await
    }

    async fn send_file(&self, local: &Path, remote: &Path) -> Result<()> {
        self.inner.send_file(local, remote).await
    }

    async fn fetch_file(&self, remote: &Path, local: &Path) -> Result<()> {
        self.inner.fetch_file(remote, local).await
    }

    async fn remote_exists(&self, path: &Path) -> Result<bool> {
        self.inner.remote_exists(path).await
    }

    async fn mkdir(&self, path: &Path, parents: bool) -> Result<()> {
        self.inner.mkdir(path, parents).await
    }

    async fn remove_folder(&self, path: &Path, safe_root: &Path) -> Result<()> {
        self.inner.remove_folder(path, safe_root).await
    }
}

/// Returns a configuration with intervals short enough for tests.
pub fn fast_config() -> RunnerConfig {
    RunnerConfig {
        tick_interval_secs: 0.02,
        status_poll_interval_secs: 0.02,
        missing_output_grace_secs: 0.02,
        absence_grace_secs: 60.0,
        ..Default::default()
    }
}

/// Polls `condition` until it holds or the timeout elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Writes an outcome blob the way a worker does: staged, then renamed into
/// place, since the blob's existence is the completion signal.
fn write_outcome(path: &Path, outcome: &UnitOutcome) {
    let staging = path.with_extension("json.partial");
    std::fs::write(&staging, serde_json::to_string(outcome).unwrap()).unwrap();
    std::fs::rename(&staging, path).unwrap();
}

/// Writes a successful outcome blob carrying the given metadata diff.
pub fn write_success_outcome(path: &Path, metadiff: Option<Value>) {
    write_outcome(path, &UnitOutcome::Success { metadiff });
}

/// Writes a task-failure outcome blob.
pub fn write_failure_outcome(path: &Path, message: &str) {
    write_outcome(
        path,
        &UnitOutcome::task_failure(message, Some("Traceback: boom".to_string())),
    );
}
