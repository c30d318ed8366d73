//! Run records: one row per firing of a schedule.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RunId, ScheduleId};

/// Conversation kind stamped on runs created by the scheduler.
pub const CONVERSATION_KIND_SCHEDULED: &str = "scheduled";

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    /// Transient: the run is being evaluated before execution starts.
    Prechecking,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl RunStatus {
    /// Terminal statuses: the run will never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::Skipped)
    }

    /// Statuses that block new runs of the same schedule.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Prechecking)
    }

    /// The three terminal statuses, in store-filter order.
    pub const TERMINAL: [RunStatus; 3] =
        [RunStatus::Succeeded, RunStatus::Failed, RunStatus::Skipped];
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Prechecking => write!(f, "prechecking"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "prechecking" => Ok(RunStatus::Prechecking),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "skipped" => Ok(RunStatus::Skipped),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One firing of a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub schedule_id: ScheduleId,
    /// The slot instant this run belongs to: the schedule's `next_run_at`
    /// at the moment the run was created.
    pub scheduled_for: DateTime<Utc>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub conversation_id: Option<String>,
    pub conversation_kind: String,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(id: RunId, schedule_id: ScheduleId, scheduled_for: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id,
            schedule_id,
            scheduled_for,
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            error_message: None,
            conversation_id: None,
            conversation_kind: CONVERSATION_KIND_SCHEDULED.to_string(),
            lease_owner: None,
            lease_until: None,
            created_at: now,
            updated_at: now,
        }
    }
}
