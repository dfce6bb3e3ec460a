//! Job submission and completion tracking for scientific image-processing
//! workflows.
//!
//! The crate places workflow task invocations either directly on the server
//! host or on a SLURM cluster, batching many logical units of work into a
//! bounded number of scheduler jobs. Submission is synchronous from the
//! caller's perspective: [`WorkflowRunner::submit`] and
//! [`WorkflowRunner::multisubmit`] resolve once every contained unit has
//! reached a terminal outcome, while a background polling loop watches the
//! scheduler and the filesystem for completions without busy-waiting.
//!
//! Guarantees upheld across all backends:
//!
//! * every unit of work reaches exactly one terminal outcome, even across
//!   partial failures and shutdown;
//! * terminal statuses are reported to the [`StatusTracker`] collaborator at
//!   most once per unit;
//! * shutdown drains every pending result and cancels outstanding scheduler
//!   jobs before returning.

pub mod batch;
pub mod command;
pub mod config;
pub mod error;
pub mod files;
mod job;
mod pending;
pub mod poll;
mod resolve;
pub mod runner;
mod script;
pub mod slurm;
pub mod status;
pub mod task;
pub mod transport;

pub use batch::ResourceBudget;
pub use config::RunnerConfig;
pub use config::SlurmDirectives;
pub use error::JobDiagnostics;
pub use error::RunnerError;
pub use files::TaskFiles;
pub use pending::WaitEntry;
pub use runner::MultiOutcome;
pub use runner::MultisubmitRequest;
pub use runner::SubmitRequest;
pub use runner::WorkflowRunner;
pub use runner::local::LocalRunner;
pub use runner::slurm::SlurmRunner;
pub use status::StatusTracker;
pub use status::UnitStatus;
pub use task::HistoryUnitId;
pub use task::TaskType;
pub use transport::LocalhostTransport;
pub use transport::Transport;
