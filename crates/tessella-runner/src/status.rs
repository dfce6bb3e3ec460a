//! The status-tracking collaborator interface.
//!
//! The runner reports terminal per-unit outcomes to an external history
//! store through this narrow contract. Updates are made at most twice per
//! unit: once if submission itself fails, and once at terminal resolution.
//! Failures updating status are not retried by the runner; they propagate to
//! the caller.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::task::HistoryUnitId;

/// The terminal status of one history unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UnitStatus {
    /// The unit of work completed successfully.
    Done,
    /// The unit of work failed terminally.
    Failed,
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => f.write_str("DONE"),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

/// The external collaborator recording terminal unit statuses.
#[async_trait]
pub trait StatusTracker: Send + Sync + 'static {
    /// Records the terminal status of one history unit.
    async fn update_status(&self, unit: HistoryUnitId, status: UnitStatus) -> Result<()>;

    /// Records the terminal status of several history units at once.
    async fn bulk_update_status(&self, units: &[HistoryUnitId], status: UnitStatus) -> Result<()> {
        for unit in units {
            self.update_status(*unit, status).await?;
        }
        Ok(())
    }
}
