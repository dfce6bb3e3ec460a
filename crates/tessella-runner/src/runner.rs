//! Implementation of the workflow-task runners.
//!
//! A runner is the public submission surface used by the workflow executor:
//! it accepts a task invocation (or a list of parallel invocations), places
//! the underlying executable locally or on a cluster, and reports terminal
//! outcomes to the status-tracking collaborator. Placement-specific
//! behaviour lives in the [`local`] and [`slurm`] backends; this module owns
//! the shared contract and its validation rules.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Map;
use serde_json::Value;

use crate::batch::ResourceBudget;
use crate::error::RunnerError;
use crate::files::TaskFiles;
use crate::status::UnitStatus;
use crate::task::HistoryUnitId;
use crate::task::TaskType;
use crate::task::validate_element_parameters;
use crate::task::validate_submit_parameters;
use crate::task::validate_unique_components;

pub mod local;
pub mod slurm;

/// A request to run one task invocation.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// The fully-qualified command line of the task executable.
    pub command_line: String,
    /// The task parameters.
    pub parameters: Map<String, Value>,
    /// The history unit tracking this unit of work.
    pub history_unit: HistoryUnitId,
    /// The execution shape of the task.
    pub task_type: TaskType,
    /// The computed file paths of the invocation.
    pub files: TaskFiles,
    /// The resource-budget policy for the submission.
    pub budget: ResourceBudget,
}

/// A request to run one task over a list of parallel invocations.
#[derive(Debug, Clone)]
pub struct MultisubmitRequest {
    /// The fully-qualified command line of the task executable.
    pub command_line: String,
    /// The execution shape of the task.
    pub task_type: TaskType,
    /// One parameter map per invocation.
    pub list_parameters: Vec<Map<String, Value>>,
    /// One history unit per invocation.
    pub history_units: Vec<HistoryUnitId>,
    /// One computed file bundle per invocation.
    pub files_list: Vec<TaskFiles>,
    /// The resource-budget policy for the submission.
    pub budget: ResourceBudget,
}

/// The per-index outcome of a [`MultisubmitRequest`].
///
/// Every input index appears in exactly one of the two maps.
#[derive(Debug, Default, Clone)]
pub struct MultiOutcome {
    /// Successful results by input index.
    pub results: BTreeMap<usize, Option<Value>>,
    /// Terminal errors by input index.
    pub errors: BTreeMap<usize, RunnerError>,
}

/// A placement backend accepting workflow-task submissions.
///
/// Both operations are synchronous from the caller's perspective: the future
/// resolves only once every contained unit of work has reached a terminal
/// outcome (or the runner shut down).
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Runs one task invocation to completion.
    ///
    /// Validation failures are returned before any job is prepared and
    /// before any status update; any later failure marks the unit `FAILED`.
    async fn submit(&self, request: SubmitRequest) -> Result<Option<Value>, RunnerError>;

    /// Runs one task over a list of parallel invocations.
    ///
    /// An empty request returns immediately with empty maps, creating no job
    /// and touching no status. Unit statuses are updated in job-completion
    /// order, independent of sibling units in the same batch.
    async fn multisubmit(&self, request: MultisubmitRequest)
    -> Result<MultiOutcome, RunnerError>;

    /// Shuts the runner down.
    ///
    /// Stops accepting submissions, resolves every pending result with a
    /// shutdown error, cancels outstanding scheduler jobs, and joins the
    /// polling loop. Idempotent.
    async fn shutdown(&self);
}

/// Validates a single-invocation request.
pub(crate) fn validate_submit(request: &SubmitRequest) -> Result<(), RunnerError> {
    validate_submit_parameters(request.task_type, &request.parameters)
}

/// Validates a parallel request, returning the per-element component
/// identifiers.
pub(crate) fn validate_multisubmit(
    request: &MultisubmitRequest,
) -> Result<Vec<String>, RunnerError> {
    if !matches!(
        request.task_type,
        TaskType::Parallel | TaskType::Compound | TaskType::ConverterCompound,
    ) {
        return Err(RunnerError::validation(format!(
            "`multisubmit` cannot be used with task type `{task_type}`",
            task_type = request.task_type,
        )));
    }

    if request.list_parameters.len() != request.history_units.len()
        || request.list_parameters.len() != request.files_list.len()
    {
        return Err(RunnerError::validation(format!(
            "`multisubmit` requires equally long inputs; got {parameters} parameter maps, \
             {units} history units, and {files} file bundles",
            parameters = request.list_parameters.len(),
            units = request.history_units.len(),
            files = request.files_list.len(),
        )));
    }

    // All invocations of one parallel submission execute one workflow task,
    // so they must resolve to a single subfolder.
    if let Some(first) = request.files_list.first()
        && let Some(other) = request
            .files_list
            .iter()
            .find(|files| files.subfolder() != first.subfolder())
    {
        return Err(RunnerError::validation(format!(
            "invocations of one batch must share a single subfolder; found both `{first}` and \
             `{other}`",
            first = first.subfolder().display(),
            other = other.subfolder().display(),
        )));
    }

    let components = request
        .list_parameters
        .iter()
        .enumerate()
        .map(|(index, parameters)| validate_element_parameters(index, parameters))
        .collect::<Result<Vec<_>, _>>()?;

    if request.task_type == TaskType::Parallel {
        validate_unique_components(&components)?;
    }

    Ok(components)
}

/// Maps a unit's terminal result to the status to record, if any.
///
/// A successful compound submission records nothing for the outer unit: only
/// the parallel-phase sub-units of a compound task are ever marked `DONE`.
/// Failures are always recorded.
pub(crate) fn terminal_status(task_type: TaskType, succeeded: bool) -> Option<UnitStatus> {
    match (succeeded, task_type.is_compound()) {
        (true, true) => None,
        (true, false) => Some(UnitStatus::Done),
        (false, _) => Some(UnitStatus::Failed),
    }
}

/// Serializes a task's parameters to its arguments file.
pub(crate) fn write_args(
    files: &TaskFiles,
    parameters: &Map<String, Value>,
) -> Result<(), RunnerError> {
    let contents = serde_json::to_string_pretty(&Value::Object(parameters.clone()))
        .map_err(|e| RunnerError::submission(format!("failed to serialize task arguments: {e}")))?;
    std::fs::write(files.args_json(), contents).map_err(|e| {
        RunnerError::submission(format!(
            "failed to write the arguments file `{path}`: {e}",
            path = files.args_json().display(),
        ))
    })
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use serde_json::json;

    use super::*;

    /// Builds a parallel request over the given component ids.
    fn parallel_request(components: &[&str]) -> MultisubmitRequest {
        let workdir = Path::new("/wd");
        MultisubmitRequest {
            command_line: "task".to_string(),
            task_type: TaskType::Parallel,
            list_parameters: components
                .iter()
                .map(|c| match json!({ "zarr_url": c }) {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                })
                .collect(),
            history_units: (0..components.len() as u64).collect(),
            files_list: components
                .iter()
                .map(|c| TaskFiles::new(workdir, None, 0, "task", Some(*c)))
                .collect(),
            budget: ResourceBudget::default(),
        }
    }

    #[test]
    fn length_mismatch_is_a_validation_error() {
        let mut request = parallel_request(&["a", "b"]);
        request.history_units.pop();
        let err = validate_multisubmit(&request).expect_err("should reject");
        assert!(err.is_validation(), "unexpected error: {err}");
    }

    #[test]
    fn duplicate_parallel_components_are_rejected() {
        let request = parallel_request(&["a", "a"]);
        let err = validate_multisubmit(&request).expect_err("should reject");
        assert!(err.to_string().contains("non-unique"), "unexpected: {err}");
    }

    #[test]
    fn compound_elements_may_repeat_components() {
        let mut request = parallel_request(&["a", "a"]);
        request.task_type = TaskType::Compound;
        validate_multisubmit(&request).expect("compound phases may revisit an image");
    }

    #[test]
    fn multisubmit_rejects_non_parallel_types() {
        let mut request = parallel_request(&["a"]);
        request.task_type = TaskType::NonParallel;
        let err = validate_multisubmit(&request).expect_err("should reject");
        assert!(err.is_validation(), "unexpected error: {err}");
    }

    #[test]
    fn mixed_subfolders_are_rejected() {
        let mut request = parallel_request(&["a", "b"]);
        request.files_list[1] = TaskFiles::new(Path::new("/wd"), None, 1, "other", Some("b"));
        let err = validate_multisubmit(&request).expect_err("should reject");
        assert!(err.is_validation(), "unexpected error: {err}");
    }
}
