//! The per-unit worker entrypoint.
//!
//! One worker process runs on the execution host for each task unit of a
//! batch: it reads the serialized call blob, executes the task executable,
//! and writes the serialized outcome blob. Every failure mode that can be
//! captured is reported through the outcome blob rather than the exit
//! status, since the submitting side reads outcomes, not exit codes; a
//! non-zero exit is reserved for the one failure that cannot be reported
//! that way (an unwritable outcome file).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use tessella_runner::command::UnitInput;
use tessella_runner::command::UnitOutcome;
use tessella_runner::command::execute_unit;

/// Runs one workflow task unit from a serialized call blob.
#[derive(Parser)]
#[command(name = "tessella-unit-worker", version, about)]
struct Args {
    /// The path of the serialized call blob describing the unit.
    #[arg(long)]
    input: PathBuf,

    /// The path the serialized outcome blob is written to.
    ///
    /// The existence of this file signals completion to the submitting side.
    #[arg(long)]
    output: PathBuf,
}

/// Reads and parses the call blob.
fn read_input(path: &PathBuf) -> Result<UnitInput, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read the call blob `{}`: {e}", path.display()))?;
    serde_json::from_str(&contents)
        .map_err(|e| format!("failed to parse the call blob `{}`: {e}", path.display()))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let outcome = match read_input(&args.input) {
        Ok(input) => execute_unit(&input).await,
        Err(message) => UnitOutcome::job_failure(message),
    };

    let serialized = match serde_json::to_string_pretty(&outcome) {
        Ok(serialized) => serialized,
        Err(e) => {
            error!("failed to serialize the unit outcome: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The outcome file's existence is the completion signal, so it must
    // appear fully written: write to a sibling and rename into place.
    let staging = args.output.with_extension("json.partial");
    if let Err(e) = std::fs::write(&staging, serialized)
        .and_then(|_| std::fs::rename(&staging, &args.output))
    {
        error!(
            "failed to write the outcome blob `{path}`: {e}",
            path = args.output.display(),
        );
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
