//! Implementation of runner configuration.
//!
//! All tunables are passed explicitly at runner construction time; there is
//! no ambient global settings object. Configuration structs are serializable
//! so a server can persist and round-trip them.

use std::time::Duration;

use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

/// The default interval, in seconds, between polling ticks.
pub const DEFAULT_TICK_INTERVAL_SECS: f64 = 1.0;

/// The default interval, in seconds, between scheduler status queries.
///
/// Status queries are substantially more expensive than a polling tick, so
/// they run on their own, longer interval.
pub const DEFAULT_STATUS_POLL_INTERVAL_SECS: f64 = 30.0;

/// The default grace interval, in seconds, before a missing output artifact of
/// a declared-finished job is treated as an infrastructure failure.
pub const DEFAULT_MISSING_OUTPUT_GRACE_SECS: f64 = 5.0;

/// The default grace interval, in seconds, before a job id absent from a
/// scheduler status query is treated as finished.
///
/// Schedulers evict records of old jobs, so absence usually means completion;
/// the grace interval protects very recently submitted jobs that may not be
/// visible to the queue yet.
pub const DEFAULT_ABSENCE_GRACE_SECS: f64 = 60.0;

/// The default file name of the shutdown sentinel, relative to the runner's
/// local working directory.
pub const DEFAULT_SHUTDOWN_SENTINEL: &str = ".tessella-shutdown";

/// The default command used to execute one task unit on an execution host.
pub const DEFAULT_WORKER_COMMAND: &str = "tessella-unit-worker";

/// Returns the default tick interval in seconds.
fn default_tick_interval_secs() -> f64 {
    DEFAULT_TICK_INTERVAL_SECS
}

/// Returns the default status poll interval in seconds.
fn default_status_poll_interval_secs() -> f64 {
    DEFAULT_STATUS_POLL_INTERVAL_SECS
}

/// Returns the default missing-output grace interval in seconds.
fn default_missing_output_grace_secs() -> f64 {
    DEFAULT_MISSING_OUTPUT_GRACE_SECS
}

/// Returns the default scheduler-absence grace interval in seconds.
fn default_absence_grace_secs() -> f64 {
    DEFAULT_ABSENCE_GRACE_SECS
}

/// Returns the default shutdown sentinel file name.
fn default_shutdown_sentinel() -> String {
    DEFAULT_SHUTDOWN_SENTINEL.to_string()
}

/// Returns the default worker command.
fn default_worker_command() -> String {
    DEFAULT_WORKER_COMMAND.to_string()
}

/// Configuration shared by every runner backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct RunnerConfig {
    /// The interval, in seconds, between polling ticks.
    ///
    /// This bounds how quickly the runner reacts to output-file sentinels and
    /// shutdown requests; it is deliberately decoupled from
    /// [`status_poll_interval_secs`][Self::status_poll_interval_secs].
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: f64,
    /// The interval, in seconds, between scheduler status queries.
    #[serde(default = "default_status_poll_interval_secs")]
    pub status_poll_interval_secs: f64,
    /// The grace interval, in seconds, before a missing output artifact of a
    /// declared-finished job is treated as an infrastructure failure.
    #[serde(default = "default_missing_output_grace_secs")]
    pub missing_output_grace_secs: f64,
    /// The grace interval, in seconds, before a job id absent from a status
    /// query is treated as finished.
    #[serde(default = "default_absence_grace_secs")]
    pub absence_grace_secs: f64,
    /// The file name of the shutdown sentinel, relative to the runner's local
    /// working directory.
    ///
    /// The sentinel gives processes other than the one owning the runner a
    /// way to request shutdown.
    #[serde(default = "default_shutdown_sentinel")]
    pub shutdown_sentinel: String,
    /// The command used to execute one task unit on an execution host.
    #[serde(default = "default_worker_command")]
    pub worker_command: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            status_poll_interval_secs: default_status_poll_interval_secs(),
            missing_output_grace_secs: default_missing_output_grace_secs(),
            absence_grace_secs: default_absence_grace_secs(),
            shutdown_sentinel: default_shutdown_sentinel(),
            worker_command: default_worker_command(),
        }
    }
}

impl RunnerConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs <= 0.0 {
            bail!("`tick_interval_secs` must be greater than zero");
        }
        if self.status_poll_interval_secs < self.tick_interval_secs {
            bail!("`status_poll_interval_secs` cannot be less than `tick_interval_secs`");
        }
        if self.missing_output_grace_secs < 0.0 {
            bail!("`missing_output_grace_secs` cannot be negative");
        }
        if self.absence_grace_secs < 0.0 {
            bail!("`absence_grace_secs` cannot be negative");
        }
        if self.shutdown_sentinel.is_empty() {
            bail!("`shutdown_sentinel` cannot be empty");
        }
        if self.worker_command.is_empty() {
            bail!("`worker_command` cannot be empty");
        }
        Ok(())
    }

    /// Gets the tick interval as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.tick_interval_secs)
    }

    /// Gets the status poll interval as a [`Duration`].
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.status_poll_interval_secs)
    }

    /// Gets the missing-output grace interval as a [`Duration`].
    pub fn missing_output_grace(&self) -> Duration {
        Duration::from_secs_f64(self.missing_output_grace_secs)
    }

    /// Gets the scheduler-absence grace interval as a [`Duration`].
    pub fn absence_grace(&self) -> Duration {
        Duration::from_secs_f64(self.absence_grace_secs)
    }

    /// Gets the number of polling ticks between scheduler status queries.
    ///
    /// This is always at least one, so that a status query is scheduled even
    /// if the two intervals are configured equal.
    pub fn status_poll_every_ticks(&self) -> u64 {
        ((self.status_poll_interval_secs / self.tick_interval_secs) as u64).max(1)
    }
}

/// Scheduler directives rendered into the header of a submission script.
///
/// The directive syntax itself is owned by the [`script`](crate::script)
/// module; this struct only carries the user-facing knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SlurmDirectives {
    /// The partition to submit jobs to.
    ///
    /// If `None`, the cluster's default partition is used.
    #[serde(default)]
    pub partition: Option<String>,
    /// The account to charge jobs to.
    #[serde(default)]
    pub account: Option<String>,
    /// The time limit for each job (e.g. `01:30:00`).
    #[serde(default)]
    pub time_limit: Option<String>,
    /// Additional raw directive lines appended verbatim to the script header,
    /// without the directive prefix (e.g. `--constraint=intel`).
    #[serde(default)]
    pub extra: Vec<String>,
}
