//! Task invocations and parameter-shape validation.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::RunnerError;
use crate::files::TaskFiles;

/// The parameter key carrying the list of Zarr URLs a non-parallel task
/// operates on.
///
/// Non-converter tasks receive the batch of images to process under this key;
/// converter tasks create images and must not receive it.
pub const BATCH_KEY: &str = "zarr_urls";

/// The parameter key carrying the single Zarr URL one parallel invocation
/// operates on.
///
/// Within one `multisubmit` of parallel type, the values under this key
/// identify the units of work and must be pairwise unique.
pub const COMPONENT_KEY: &str = "zarr_url";

/// An identifier of the external history unit tracking one logical unit of
/// work.
pub type HistoryUnitId = u64;

/// The execution shape of a workflow task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// A task invoked once over a batch of images.
    NonParallel,
    /// A task invoked once per image.
    Parallel,
    /// A non-parallel initialisation phase followed by a parallel phase.
    Compound,
    /// A converter task invoked once; creates images rather than reading
    /// them.
    ConverterNonParallel,
    /// A converter compound task.
    ConverterCompound,
}

impl TaskType {
    /// Returns `true` for converter task types.
    pub fn is_converter(self) -> bool {
        matches!(self, Self::ConverterNonParallel | Self::ConverterCompound)
    }

    /// Returns `true` for compound task types.
    ///
    /// The outer history unit of a compound task is never marked `DONE` by
    /// the runner; only its parallel-phase sub-units are.
    pub fn is_compound(self) -> bool {
        matches!(self, Self::Compound | Self::ConverterCompound)
    }

    /// Gets the lowercase name of the task type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NonParallel => "non_parallel",
            Self::Parallel => "parallel",
            Self::Compound => "compound",
            Self::ConverterNonParallel => "converter_non_parallel",
            Self::ConverterCompound => "converter_compound",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical execution of a task against one set of parameters.
///
/// Invocations are immutable once constructed and are owned by the submission
/// layer until their result is resolved.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    /// The stable label of the invocation (the file prefix of its artifacts).
    label: String,
    /// The fully-qualified command line that invokes the task executable.
    ///
    /// This is produced by the packaging collaborator and treated as opaque.
    command_line: String,
    /// The task parameters, serialized to the arguments file at prepare time.
    parameters: Map<String, Value>,
    /// The computed file paths of the invocation.
    files: TaskFiles,
    /// The history unit tracking this unit of work.
    history_unit: HistoryUnitId,
}

impl TaskInvocation {
    /// Creates a new task invocation.
    pub fn new(
        command_line: impl Into<String>,
        parameters: Map<String, Value>,
        files: TaskFiles,
        history_unit: HistoryUnitId,
    ) -> Self {
        Self {
            label: files.prefix().to_string(),
            command_line: command_line.into(),
            parameters,
            files,
            history_unit,
        }
    }

    /// Gets the stable label of the invocation.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Gets the command line that invokes the task executable.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Gets the task parameters.
    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    /// Gets the computed file paths of the invocation.
    pub fn files(&self) -> &TaskFiles {
        &self.files
    }

    /// Gets the history unit tracking this unit of work.
    pub fn history_unit(&self) -> HistoryUnitId {
        self.history_unit
    }
}

/// Validates the parameter shape of a single (non-parallel) submission.
///
/// Non-converter types require the [`BATCH_KEY`] to be present; converter
/// types require it to be absent, as converter tasks create images instead of
/// reading them. The parallel task type cannot be submitted as a single
/// invocation at all.
pub fn validate_submit_parameters(
    task_type: TaskType,
    parameters: &Map<String, Value>,
) -> Result<(), RunnerError> {
    if task_type == TaskType::Parallel {
        return Err(RunnerError::validation(
            "`submit` cannot be used with the parallel task type; use `multisubmit`",
        ));
    }

    if task_type.is_converter() {
        if parameters.contains_key(BATCH_KEY) {
            return Err(RunnerError::validation(format!(
                "parameters for task type `{task_type}` must not contain the `{BATCH_KEY}` key",
            )));
        }
    } else if !parameters.contains_key(BATCH_KEY) {
        return Err(RunnerError::validation(format!(
            "parameters for task type `{task_type}` must contain the `{BATCH_KEY}` key",
        )));
    }

    Ok(())
}

/// Validates the parameters of one element of a parallel submission.
///
/// Every element must carry a string-valued [`COMPONENT_KEY`] identifying the
/// image it operates on.
pub fn validate_element_parameters(
    index: usize,
    parameters: &Map<String, Value>,
) -> Result<String, RunnerError> {
    match parameters.get(COMPONENT_KEY) {
        Some(Value::String(url)) => Ok(url.clone()),
        Some(_) => Err(RunnerError::validation(format!(
            "element {index}: the `{COMPONENT_KEY}` parameter must be a string",
        ))),
        None => Err(RunnerError::validation(format!(
            "element {index}: parameters must contain the `{COMPONENT_KEY}` key",
        ))),
    }
}

/// Validates that the component identifiers of a parallel submission are
/// pairwise unique.
///
/// `components` is the list of [`COMPONENT_KEY`] values in element order.
pub fn validate_unique_components(components: &[String]) -> Result<(), RunnerError> {
    let mut seen = std::collections::HashSet::with_capacity(components.len());
    for component in components {
        if !seen.insert(component.as_str()) {
            return Err(RunnerError::validation(format!(
                "non-unique component identifier `{component}` in parallel submission",
            )));
        }
    }
    Ok(())
}

/// Validates that every invocation of a batch resolves to the same subfolder.
///
/// A compound or parallel job executes one workflow task at a time, so a
/// batch spanning more than one subfolder is a programming-invariant
/// violation.
pub fn validate_single_subfolder(invocations: &[TaskInvocation]) -> Result<(), RunnerError> {
    let mut subfolders = invocations
        .iter()
        .map(|invocation| invocation.files().subfolder());
    let Some(first) = subfolders.next() else {
        return Ok(());
    };
    if let Some(other) = subfolders.find(|s| *s != first) {
        return Err(RunnerError::validation(format!(
            "invocations of one batch must share a single subfolder; found both `{first}` and \
             `{other}`",
            first = first.display(),
            other = other.display(),
        )));
    }
    Ok(())
}
