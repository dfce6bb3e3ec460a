//! Rendering of scheduler submission scripts.
//!
//! One script is rendered per job: a `#SBATCH` directive header followed by
//! one backgrounded worker invocation per contained task unit and a trailing
//! `wait`, so all units of the batch fan out concurrently and are joined
//! together.

use std::path::Path;

use crate::batch::BatchingPlan;
use crate::batch::ResourceBudget;
use crate::config::SlurmDirectives;
use crate::job::SlurmJob;

/// Quotes a path for safe inclusion in a shell script.
fn quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    shlex::try_quote(&raw)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| raw.into_owned())
}

/// Renders the submission script for a job.
///
/// The resource directives are derived from the per-task budget and the
/// batching plan: the job reserves `parallel_tasks_per_job` concurrent task
/// slots, each with the per-task CPU and memory reservation. The stdout and
/// stderr paths still carry the scheduler's `%j` placeholder at render time;
/// the scheduler resolves it, and the job handle mirrors that resolution once
/// the id is known.
pub(crate) fn render(
    job: &SlurmJob,
    budget: &ResourceBudget,
    plan: &BatchingPlan,
    directives: &SlurmDirectives,
    worker_command: &str,
) -> String {
    let parallel = plan.parallel_tasks_per_job.min(job.invocations().len()).max(1);
    let mem_mb = (budget.mem_per_task.as_u64() as f64 * parallel as f64 / bytesize::MIB as f64)
        .ceil() as u64;

    // Directives refer to the filesystem of the host the scheduler runs on.
    let workdir = job.remote_subfolder().unwrap_or_else(|| job.subfolder());
    let stdout = job
        .remote_stdout()
        .unwrap_or_else(|| job.stdout().to_path_buf());
    let stderr = job
        .remote_stderr()
        .unwrap_or_else(|| job.stderr().to_path_buf());

    let mut script = String::from("#!/bin/bash\n");
    if let Some(partition) = &directives.partition {
        script.push_str(&format!("#SBATCH --partition={partition}\n"));
    }
    if let Some(account) = &directives.account {
        script.push_str(&format!("#SBATCH --account={account}\n"));
    }
    if let Some(time_limit) = &directives.time_limit {
        script.push_str(&format!("#SBATCH --time={time_limit}\n"));
    }
    script.push_str(&format!("#SBATCH --job-name={label}\n", label = job.label()));
    script.push_str(&format!("#SBATCH --ntasks={parallel}\n"));
    script.push_str(&format!(
        "#SBATCH --cpus-per-task={cpus}\n",
        cpus = budget.cpus_per_task,
    ));
    script.push_str(&format!("#SBATCH --mem={mem_mb}M\n"));
    // The scheduler reads directive values literally, without shell quote
    // removal; quoting here would end up inside the output file names.
    script.push_str(&format!("#SBATCH --out={path}\n", path = stdout.display()));
    script.push_str(&format!("#SBATCH --err={path}\n", path = stderr.display()));
    script.push_str(&format!("#SBATCH -D {path}\n", path = workdir.display()));
    for extra in &directives.extra {
        script.push_str(&format!("#SBATCH {extra}\n"));
    }

    script.push('\n');

    // Fan out one worker per invocation, then join them all.
    for invocation in job.invocations() {
        let files = invocation.files();
        let input = files.to_remote(&files.input_blob()).unwrap_or_else(|| files.input_blob());
        let output = files
            .to_remote(&files.outcome_blob())
            .unwrap_or_else(|| files.outcome_blob());
        script.push_str(&format!(
            "{worker_command} --input {input} --output {output} &\n",
            input = quote(&input),
            output = quote(&output),
        ));
    }
    script.push_str("wait\n");

    script
}
