//! Grouping of parallel task invocations into a bounded number of jobs.
//!
//! The batcher is a pure function over a [`ResourceBudget`]: it computes how
//! many invocations to pack into each scheduler job and how many of them may
//! run concurrently within that job. The heuristic favours hitting the
//! target job count without exceeding per-job CPU and memory budgets; it
//! makes no claim of optimality.

use anyhow::Result;
use anyhow::bail;
use bytesize::ByteSize;
use serde::Deserialize;
use serde::Serialize;

/// Returns the default CPU reservation per task.
fn default_cpus_per_task() -> u32 {
    1
}

/// Returns the default memory reservation per task.
fn default_mem_per_task() -> ByteSize {
    ByteSize::gib(4)
}

/// Returns the default target number of CPUs per job.
fn default_target_cpus_per_job() -> u32 {
    8
}

/// Returns the default maximum number of CPUs per job.
fn default_max_cpus_per_job() -> u32 {
    16
}

/// Returns the default target memory per job.
fn default_target_mem_per_job() -> ByteSize {
    ByteSize::gib(32)
}

/// Returns the default maximum memory per job.
fn default_max_mem_per_job() -> ByteSize {
    ByteSize::gib(64)
}

/// Returns the default target number of jobs.
fn default_target_num_jobs() -> u32 {
    100
}

/// Returns the default maximum number of jobs.
fn default_max_num_jobs() -> u32 {
    200
}

/// The resource-budget policy used to group invocations into jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ResourceBudget {
    /// The CPU reservation for one task invocation.
    #[serde(default = "default_cpus_per_task")]
    pub cpus_per_task: u32,
    /// The memory reservation for one task invocation.
    #[serde(default = "default_mem_per_task")]
    pub mem_per_task: ByteSize,
    /// The number of CPUs per job to aim for.
    #[serde(default = "default_target_cpus_per_job")]
    pub target_cpus_per_job: u32,
    /// The number of CPUs per job that must not be exceeded.
    #[serde(default = "default_max_cpus_per_job")]
    pub max_cpus_per_job: u32,
    /// The memory per job to aim for.
    #[serde(default = "default_target_mem_per_job")]
    pub target_mem_per_job: ByteSize,
    /// The memory per job that must not be exceeded.
    #[serde(default = "default_max_mem_per_job")]
    pub max_mem_per_job: ByteSize,
    /// The number of jobs to aim for.
    #[serde(default = "default_target_num_jobs")]
    pub target_num_jobs: u32,
    /// The number of jobs that must not be exceeded.
    #[serde(default = "default_max_num_jobs")]
    pub max_num_jobs: u32,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            cpus_per_task: default_cpus_per_task(),
            mem_per_task: default_mem_per_task(),
            target_cpus_per_job: default_target_cpus_per_job(),
            max_cpus_per_job: default_max_cpus_per_job(),
            target_mem_per_job: default_target_mem_per_job(),
            max_mem_per_job: default_max_mem_per_job(),
            target_num_jobs: default_target_num_jobs(),
            max_num_jobs: default_max_num_jobs(),
        }
    }
}

impl ResourceBudget {
    /// Validates the budget.
    pub fn validate(&self) -> Result<()> {
        if self.cpus_per_task == 0 {
            bail!("`cpus_per_task` must be greater than zero");
        }
        if self.mem_per_task.as_u64() == 0 {
            bail!("`mem_per_task` must be greater than zero");
        }
        if self.target_cpus_per_job == 0 || self.target_num_jobs == 0 {
            bail!("per-job targets must be greater than zero");
        }
        if self.target_mem_per_job.as_u64() == 0 {
            bail!("`target_mem_per_job` must be greater than zero");
        }
        if self.max_cpus_per_job < self.target_cpus_per_job {
            bail!("`max_cpus_per_job` cannot be less than `target_cpus_per_job`");
        }
        if self.max_mem_per_job < self.target_mem_per_job {
            bail!("`max_mem_per_job` cannot be less than `target_mem_per_job`");
        }
        if self.max_num_jobs < self.target_num_jobs {
            bail!("`max_num_jobs` cannot be less than `target_num_jobs`");
        }
        Ok(())
    }
}

/// The computed grouping for a set of parallel invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchingPlan {
    /// The number of invocations packed into each job; the last job of a
    /// partition may contain fewer.
    pub tasks_per_job: usize,
    /// The number of invocations that run concurrently within one job.
    pub parallel_tasks_per_job: usize,
}

/// Computes the grouping of `n` parallel invocations under the given budget.
///
/// The per-job parallelism starts from what the target CPU and memory budgets
/// allow and is shrunk if it would exceed the hard per-job limits; the chunk
/// size then grows beyond the parallelism to approach the target number of
/// jobs, and again to respect the maximum number of jobs. Both results have
/// an integer floor of one.
///
/// Returns an error if the budget is invalid or `n` is zero; callers are
/// expected to short-circuit empty submissions before batching.
pub fn compute_batching(n: usize, budget: &ResourceBudget) -> Result<BatchingPlan> {
    budget.validate()?;
    if n == 0 {
        bail!("cannot compute a batching plan for zero invocations");
    }

    let cpus = u64::from(budget.cpus_per_task);
    let mem = budget.mem_per_task.as_u64();

    // Parallelism allowed by the soft (target) budgets.
    let by_cpu = u64::from(budget.target_cpus_per_job) / cpus;
    let by_mem = budget.target_mem_per_job.as_u64() / mem;
    let mut parallel = by_cpu.min(by_mem).max(1);

    // Shrink if the hard per-job limits would be exceeded.
    if parallel * cpus > u64::from(budget.max_cpus_per_job) {
        parallel = (u64::from(budget.max_cpus_per_job) / cpus).max(1);
    }
    if parallel * mem > budget.max_mem_per_job.as_u64() {
        parallel = (budget.max_mem_per_job.as_u64() / mem).max(1);
    }

    let parallel = (parallel as usize).min(n);

    // Grow the chunk size to approach the target job count, then clamp to the
    // hard job-count limit.
    let mut tasks_per_job = parallel;
    if n.div_ceil(tasks_per_job) > budget.target_num_jobs as usize {
        tasks_per_job = n.div_ceil(budget.target_num_jobs as usize);
    }
    if n.div_ceil(tasks_per_job) > budget.max_num_jobs as usize {
        tasks_per_job = n.div_ceil(budget.max_num_jobs as usize);
    }

    Ok(BatchingPlan {
        tasks_per_job,
        parallel_tasks_per_job: parallel,
    })
}

/// Partitions `items` into consecutive chunks of at most `tasks_per_job`
/// elements, preserving order.
///
/// # Panics
///
/// Panics if `tasks_per_job` is zero.
pub fn partition<T>(items: Vec<T>, tasks_per_job: usize) -> Vec<Vec<T>> {
    assert!(tasks_per_job > 0, "chunk size must be greater than zero");

    let mut chunks = Vec::with_capacity(items.len().div_ceil(tasks_per_job.max(1)));
    let mut chunk = Vec::with_capacity(tasks_per_job.min(items.len()));
    for item in items {
        chunk.push(item);
        if chunk.len() == tasks_per_job {
            chunks.push(std::mem::replace(
                &mut chunk,
                Vec::with_capacity(tasks_per_job),
            ));
        }
    }
    if !chunk.is_empty() {
        chunks.push(chunk);
    }
    chunks
}
