//! End-to-end tests of the SLURM backend against a fake scheduler.
//!
//! The fake intercepts the scheduler command-line tools but performs real
//! filesystem work, so staging, sentinel watching, artifact collection, and
//! shutdown draining all run the production code paths.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tokio::time::timeout;

use tessella_runner::MultisubmitRequest;
use tessella_runner::ResourceBudget;
use tessella_runner::RunnerConfig;
use tessella_runner::RunnerError;
use tessella_runner::SlurmDirectives;
use tessella_runner::SlurmRunner;
use tessella_runner::SubmitRequest;
use tessella_runner::TaskFiles;
use tessella_runner::TaskType;
use tessella_runner::UnitStatus;
use tessella_runner::WorkflowRunner;
use tessella_runner::command::UnitInput;

use common::FakeSlurm;
use common::GatedSlurm;
use common::RecordingTracker;
use common::fast_config;
use common::wait_until;
use common::write_failure_outcome;
use common::write_success_outcome;

/// The timeout wrapped around every await that depends on the polling loop.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a runner over a fake scheduler in the given working directory.
fn runner_in(
    workdir: &Path,
    remote_workdir: Option<&Path>,
) -> (Arc<SlurmRunner<FakeSlurm>>, FakeSlurm, Arc<RecordingTracker>) {
    runner_with_config(fast_config(), workdir, remote_workdir)
}

/// Builds a runner over a fake scheduler with a custom configuration.
fn runner_with_config(
    config: RunnerConfig,
    workdir: &Path,
    remote_workdir: Option<&Path>,
) -> (Arc<SlurmRunner<FakeSlurm>>, FakeSlurm, Arc<RecordingTracker>) {
    let fake = FakeSlurm::starting_at(100);
    let tracker = Arc::new(RecordingTracker::default());
    let runner = SlurmRunner::new(
        config,
        SlurmDirectives::default(),
        tracker.clone(),
        fake.clone(),
        None,
        workdir.to_path_buf(),
        remote_workdir.map(Path::to_path_buf),
    )
    .expect("runner should build");
    (Arc::new(runner), fake, tracker)
}

/// Builds a parameter map from a JSON object literal.
fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

/// Builds a parallel request over the given components.
fn parallel_request(
    workdir: &Path,
    components: &[&str],
    first_unit: u64,
) -> (MultisubmitRequest, Vec<TaskFiles>) {
    let files_list: Vec<TaskFiles> = components
        .iter()
        .map(|c| TaskFiles::new(workdir, None, 2, "segmentation", Some(*c)))
        .collect();
    let request = MultisubmitRequest {
        command_line: "python /opt/tasks/segmentation.py".to_string(),
        task_type: TaskType::Parallel,
        list_parameters: components
            .iter()
            .map(|c| object(json!({ "zarr_url": c })))
            .collect(),
        history_units: (first_unit..first_unit + components.len() as u64).collect(),
        files_list: files_list.clone(),
        budget: ResourceBudget::default(),
    };
    (request, files_list)
}

/// Builds a single non-parallel request.
fn single_request(files: TaskFiles, history_unit: u64) -> SubmitRequest {
    SubmitRequest {
        command_line: "python /opt/tasks/projection.py".to_string(),
        parameters: object(json!({ "zarr_urls": ["/plate.zarr/A/01/0"] })),
        history_unit,
        task_type: TaskType::NonParallel,
        files,
        budget: ResourceBudget::default(),
    }
}

#[tokio::test]
async fn parallel_units_resolve_via_file_sentinels() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, fake, tracker) = runner_in(dir.path(), None);
    let (request, files_list) = parallel_request(dir.path(), &["a", "b", "c"], 20);

    let task = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.multisubmit(request).await })
    };

    // The default budget packs all three units into one job.
    assert!(wait_until(TEST_TIMEOUT, || fake.submitted().len() == 1).await);
    let (_, command) = fake.submitted().remove(0);
    assert!(command.contains("sbatch"), "command: {command}");

    // Simulate the workers: one outcome blob per unit.
    for (index, files) in files_list.iter().enumerate() {
        write_success_outcome(&files.outcome_blob(), Some(json!({ "index": index })));
    }

    let outcome = timeout(TEST_TIMEOUT, task)
        .await
        .expect("multisubmit should resolve")
        .unwrap()
        .expect("multisubmit should succeed");
    assert_eq!(outcome.results.len(), 3);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.results.get(&1), Some(&Some(json!({ "index": 1 }))));

    let statuses = tracker.statuses();
    assert!(
        (20..23).all(|u| statuses.get(&u) == Some(&UnitStatus::Done)),
        "statuses: {statuses:?}",
    );
    assert_eq!(tracker.update_count(), 3);

    // The arguments files survive resolution; the call blobs do not.
    assert!(files_list[0].args_json().exists());
    assert!(!files_list[0].input_blob().exists());

    runner.shutdown().await;
    assert!(fake.cancelled().is_empty(), "nothing left to cancel");
}

#[tokio::test]
async fn task_failures_are_isolated_per_unit() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, fake, tracker) = runner_in(dir.path(), None);
    let (request, files_list) = parallel_request(dir.path(), &["a", "b"], 40);

    let task = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.multisubmit(request).await })
    };
    assert!(wait_until(TEST_TIMEOUT, || fake.submitted().len() == 1).await);

    write_success_outcome(&files_list[0].outcome_blob(), None);
    write_failure_outcome(&files_list[1].outcome_blob(), "segmentation blew up");

    let outcome = timeout(TEST_TIMEOUT, task)
        .await
        .expect("multisubmit should resolve")
        .unwrap()
        .expect("multisubmit itself should succeed");
    assert_eq!(outcome.results.get(&0), Some(&None));
    match outcome.errors.get(&1) {
        Some(RunnerError::TaskExecution { message, traceback }) => {
            assert!(message.contains("segmentation blew up"), "message: {message}");
            assert_eq!(traceback.as_deref(), Some("Traceback: boom"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let statuses = tracker.statuses();
    assert_eq!(statuses.get(&40), Some(&UnitStatus::Done));
    assert_eq!(statuses.get(&41), Some(&UnitStatus::Failed));

    runner.shutdown().await;
}

#[tokio::test]
async fn missing_outcome_after_grace_is_a_job_execution_error() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, fake, tracker) = runner_in(dir.path(), None);
    let files = TaskFiles::new(dir.path(), None, 0, "projection", None);

    let task = {
        let runner = runner.clone();
        let request = single_request(files, 7);
        tokio::spawn(async move { runner.submit(request).await })
    };
    assert!(wait_until(TEST_TIMEOUT, || fake.submitted().len() == 1).await);

    // The scheduler declares the job finished, but no worker ever wrote an
    // outcome blob.
    let (id, _) = fake.submitted().remove(0);
    fake.set_state(id, "FAILED");

    let err = timeout(TEST_TIMEOUT, task)
        .await
        .expect("submit should resolve")
        .unwrap()
        .expect_err("the unit should fail");
    match &err {
        RunnerError::JobExecution {
            message,
            diagnostics: Some(diagnostics),
        } => {
            assert!(message.contains("never appeared"), "message: {message}");
            assert!(diagnostics.script.exists(), "the script should be kept");
            assert!(
                diagnostics.stdout.to_string_lossy().contains(&id.to_string()),
                "the job id placeholder should be resolved: {diagnostics}",
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(tracker.statuses().get(&7), Some(&UnitStatus::Failed));

    runner.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_pending_jobs_and_rejects_new_submissions() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, fake, tracker) = runner_in(dir.path(), None);
    let (request, _) = parallel_request(dir.path(), &["a", "b"], 60);

    let task = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.multisubmit(request).await })
    };
    assert!(wait_until(TEST_TIMEOUT, || fake.submitted().len() == 1).await);
    let (id, _) = fake.submitted().remove(0);

    runner.shutdown().await;
    // A second shutdown is a no-op.
    runner.shutdown().await;

    let outcome = timeout(TEST_TIMEOUT, task)
        .await
        .expect("multisubmit should resolve")
        .unwrap()
        .expect("draining reports per-unit errors, not a call-level error");
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.errors.len(), 2);
    assert!(
        outcome.errors.values().all(RunnerError::is_shutdown),
        "errors: {:?}",
        outcome.errors,
    );
    assert_eq!(fake.cancelled(), vec![id]);

    let statuses = tracker.statuses();
    assert!((60..62).all(|u| statuses.get(&u) == Some(&UnitStatus::Failed)));

    // New submissions are rejected without contacting the scheduler.
    let files = TaskFiles::new(dir.path(), None, 3, "late", None);
    let err = runner
        .submit(single_request(files, 63))
        .await
        .expect_err("submission after shutdown should fail");
    assert!(err.is_shutdown(), "unexpected error: {err}");
    assert_eq!(fake.submitted().len(), 1);
}

#[tokio::test]
async fn submission_racing_shutdown_is_still_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeSlurm::starting_at(100);
    let gated = GatedSlurm::new(fake.clone());
    let tracker = Arc::new(RecordingTracker::default());
    let runner = Arc::new(
        SlurmRunner::new(
            fast_config(),
            SlurmDirectives::default(),
            tracker.clone(),
            gated.clone(),
            None,
            dir.path().to_path_buf(),
            None,
        )
        .expect("runner should build"),
    );

    let files = TaskFiles::new(dir.path(), None, 0, "projection", None);
    let task = {
        let runner = runner.clone();
        let request = single_request(files, 17);
        tokio::spawn(async move { runner.submit(request).await })
    };
    // The submission has passed the accepting check and is parked inside
    // `sbatch`.
    assert!(wait_until(TEST_TIMEOUT, || gated.sbatch_attempts() == 1).await);

    // Shutdown drains an empty table; the parked submission lands after.
    runner.shutdown().await;
    gated.release_one();

    let err = timeout(TEST_TIMEOUT, task)
        .await
        .expect("the pending result must resolve even when racing shutdown")
        .unwrap()
        .expect_err("the unit should be cancelled");
    assert!(err.is_shutdown(), "unexpected error: {err}");
    assert_eq!(fake.cancelled(), vec![100]);
    assert_eq!(tracker.statuses().get(&17), Some(&UnitStatus::Failed));
}

#[tokio::test]
async fn job_absent_from_the_queue_is_treated_as_finished() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunnerConfig {
        absence_grace_secs: 0.05,
        ..fast_config()
    };
    let (runner, fake, tracker) = runner_with_config(config, dir.path(), None);
    let files = TaskFiles::new(dir.path(), None, 0, "projection", None);

    let task = {
        let runner = runner.clone();
        let request = single_request(files, 11);
        tokio::spawn(async move { runner.submit(request).await })
    };
    assert!(wait_until(TEST_TIMEOUT, || fake.submitted().len() == 1).await);

    // The scheduler evicts the job's record without it ever reporting a
    // terminal state, and no worker wrote an outcome blob.
    let (id, _) = fake.submitted().remove(0);
    fake.forget(id);

    let err = timeout(TEST_TIMEOUT, task)
        .await
        .expect("absence past the grace period should complete the job")
        .unwrap()
        .expect_err("the unit should fail for its missing outcome");
    match &err {
        RunnerError::JobExecution { message, .. } => {
            assert!(message.contains("never appeared"), "message: {message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(tracker.statuses().get(&11), Some(&UnitStatus::Failed));

    runner.shutdown().await;
}

#[tokio::test]
async fn failed_status_queries_keep_the_job_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, fake, tracker) = runner_in(dir.path(), None);
    fake.fail_queries(true);
    let (request, files_list) = parallel_request(dir.path(), &["a"], 30);

    let task = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.multisubmit(request).await })
    };
    assert!(wait_until(TEST_TIMEOUT, || fake.submitted().len() == 1).await);

    // The query keeps failing and keeps being retried; the job stays in the
    // wait set instead of erroring out.
    let seen = fake.query_count();
    assert!(wait_until(TEST_TIMEOUT, || fake.query_count() >= seen + 3).await);
    assert!(!task.is_finished(), "the job must survive failed queries");

    // The sentinel path still completes it once the worker writes its blob.
    write_success_outcome(&files_list[0].outcome_blob(), Some(json!({ "ok": true })));
    let outcome = timeout(TEST_TIMEOUT, task)
        .await
        .expect("multisubmit should resolve")
        .unwrap()
        .expect("multisubmit should succeed");
    assert_eq!(outcome.results.get(&0), Some(&Some(json!({ "ok": true }))));
    assert!(outcome.errors.is_empty());
    assert_eq!(tracker.statuses().get(&30), Some(&UnitStatus::Done));

    runner.shutdown().await;
}

#[tokio::test]
async fn sentinel_file_requests_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, fake, _tracker) = runner_in(dir.path(), None);
    let (request, _) = parallel_request(dir.path(), &["a"], 80);

    let task = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.multisubmit(request).await })
    };
    assert!(wait_until(TEST_TIMEOUT, || fake.submitted().len() == 1).await);
    let (id, _) = fake.submitted().remove(0);

    // Another process requests shutdown by touching the sentinel file.
    std::fs::write(dir.path().join(".tessella-shutdown"), "").unwrap();

    let outcome = timeout(TEST_TIMEOUT, task)
        .await
        .expect("multisubmit should resolve")
        .unwrap()
        .expect("draining reports per-unit errors, not a call-level error");
    assert!(outcome.errors.values().all(RunnerError::is_shutdown));
    assert_eq!(fake.cancelled(), vec![id]);

    let files = TaskFiles::new(dir.path(), None, 4, "late", None);
    let err = runner
        .submit(single_request(files, 81))
        .await
        .expect_err("submission after a sentinel shutdown should fail");
    assert!(err.is_shutdown(), "unexpected error: {err}");
}

#[tokio::test]
async fn remote_staging_round_trips_artifacts() {
    let local = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let (runner, fake, tracker) = runner_in(local.path(), Some(remote.path()));

    let files = TaskFiles::new(local.path(), Some(remote.path()), 0, "convert", None);
    let request = SubmitRequest {
        command_line: "python /opt/tasks/convert.py".to_string(),
        parameters: object(json!({ "image_dir": "/data/acquisition" })),
        history_unit: 5,
        task_type: TaskType::ConverterNonParallel,
        files: files.clone(),
        budget: ResourceBudget::default(),
    };
    let task = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.submit(request).await })
    };
    assert!(wait_until(TEST_TIMEOUT, || fake.submitted().len() == 1).await);

    // The payload was unpacked on the "remote" side and the submitted script
    // path is the remote one.
    let (id, command) = fake.submitted().remove(0);
    let remote_subfolder = files.remote_subfolder().unwrap();
    assert!(command.contains(remote.path().to_str().unwrap()), "command: {command}");
    assert!(remote_subfolder.join("batch-000000.sh").exists());
    let blob = files.to_remote(&files.input_blob()).unwrap();
    let input: UnitInput =
        serde_json::from_str(&std::fs::read_to_string(&blob).unwrap()).unwrap();
    assert!(input.args_file.starts_with(remote_subfolder));

    // Simulate the remote worker, then let the scheduler report completion.
    write_success_outcome(
        &files.to_remote(&files.outcome_blob()).unwrap(),
        Some(json!({ "converted": 96 })),
    );
    fake.set_state(id, "COMPLETED");

    let result = timeout(TEST_TIMEOUT, task)
        .await
        .expect("submit should resolve")
        .unwrap()
        .expect("the unit should succeed");
    assert_eq!(result, Some(json!({ "converted": 96 })));
    assert_eq!(tracker.statuses().get(&5), Some(&UnitStatus::Done));

    runner.shutdown().await;
}

#[tokio::test]
async fn batching_splits_units_across_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, fake, tracker) = runner_in(dir.path(), None);

    // A one-CPU-per-job budget forces one unit per job.
    let budget = ResourceBudget {
        target_cpus_per_job: 1,
        max_cpus_per_job: 1,
        ..Default::default()
    };
    let components = ["a", "b", "c", "d"];
    let (mut request, files_list) = parallel_request(dir.path(), &components, 10);
    request.budget = budget;

    let task = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.multisubmit(request).await })
    };
    assert!(wait_until(TEST_TIMEOUT, || fake.submitted().len() == 4).await);

    for files in &files_list {
        write_success_outcome(&files.outcome_blob(), None);
    }

    let outcome = timeout(TEST_TIMEOUT, task)
        .await
        .expect("multisubmit should resolve")
        .unwrap()
        .expect("multisubmit should succeed");
    assert_eq!(outcome.results.len(), 4);
    assert!(outcome.errors.is_empty());
    assert_eq!(tracker.update_count(), 4);

    runner.shutdown().await;
}

#[tokio::test]
async fn empty_multisubmit_contacts_no_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, fake, tracker) = runner_in(dir.path(), None);

    let outcome = runner
        .multisubmit(MultisubmitRequest {
            command_line: "task".to_string(),
            task_type: TaskType::Parallel,
            list_parameters: Vec::new(),
            history_units: Vec::new(),
            files_list: Vec::new(),
            budget: ResourceBudget::default(),
        })
        .await
        .expect("an empty multisubmit is a no-op");

    assert!(outcome.results.is_empty());
    assert!(outcome.errors.is_empty());
    assert!(fake.submitted().is_empty());
    assert_eq!(tracker.update_count(), 0);

    runner.shutdown().await;
}

#[tokio::test]
async fn duplicate_components_are_rejected_before_submission() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, fake, tracker) = runner_in(dir.path(), None);
    let (request, _) = parallel_request(dir.path(), &["same", "same"], 90);

    let err = runner
        .multisubmit(request)
        .await
        .expect_err("duplicate components should be rejected");
    assert!(err.is_validation(), "unexpected error: {err}");
    assert!(fake.submitted().is_empty());
    assert_eq!(tracker.update_count(), 0);

    runner.shutdown().await;
}
