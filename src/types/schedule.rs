//! Schedule definitions persisted in the scheduler store.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RunStatus, ScheduleId};

/// Hard deadline applied to a run when the schedule does not set one.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// How a schedule decides when it is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Fires on a 5-field cron expression evaluated in the schedule's timezone.
    #[default]
    Cron,
    /// Fires every `interval_seconds` after the previous run.
    Interval,
    /// Fires only when `next_run_at` is set explicitly (run-now, SDK).
    Adhoc,
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleKind::Cron => write!(f, "cron"),
            ScheduleKind::Interval => write!(f, "interval"),
            ScheduleKind::Adhoc => write!(f, "adhoc"),
        }
    }
}

impl std::str::FromStr for ScheduleKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(ScheduleKind::Cron),
            "interval" => Ok(ScheduleKind::Interval),
            "adhoc" => Ok(ScheduleKind::Adhoc),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }
}

/// Conversation visibility for runs of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(format!("unknown visibility: {other}")),
        }
    }
}

/// A recurring or one-shot task definition persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    /// Human label, also used as the conversation title.
    pub name: String,
    /// External agent identifier handed to the chat collaborator.
    pub agent_ref: String,
    pub model_override: Option<String>,
    pub enabled: bool,
    pub kind: ScheduleKind,
    pub cron_expr: Option<String>,
    pub interval_seconds: Option<u64>,
    /// IANA zone name; missing or invalid falls back to UTC.
    pub timezone: Option<String>,
    /// Activation window: inclusive start, exclusive end.
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    /// Per-run hard deadline in seconds; 0 means the 20-minute default.
    pub timeout_seconds: u64,
    pub task_prompt: Option<String>,
    pub task_prompt_uri: Option<String>,
    pub visibility: Visibility,
    pub created_by_user_id: Option<String>,
    /// Reference to user credentials for out-of-band auth. Redacted in logs.
    pub user_cred_url: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Create a new schedule definition with sensible defaults.
    pub fn new(name: impl Into<String>, agent_ref: impl Into<String>, kind: ScheduleKind) -> Self {
        let now = Utc::now();
        Self {
            id: ScheduleId::new(),
            name: name.into(),
            agent_ref: agent_ref.into(),
            model_override: None,
            enabled: true,
            kind,
            cron_expr: None,
            interval_seconds: None,
            timezone: None,
            start_at: None,
            end_at: None,
            timeout_seconds: 0,
            task_prompt: None,
            task_prompt_uri: None,
            visibility: Visibility::default(),
            created_by_user_id: None,
            user_cred_url: None,
            next_run_at: None,
            last_run_at: None,
            last_status: None,
            last_error: None,
            lease_owner: None,
            lease_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The run deadline for this schedule; 0 maps to the 20-minute default.
    pub fn effective_timeout(&self) -> Duration {
        if self.timeout_seconds == 0 {
            DEFAULT_RUN_TIMEOUT
        } else {
            Duration::from_secs(self.timeout_seconds)
        }
    }

    /// Resolved evaluation timezone. Missing or invalid names fall back to UTC.
    pub fn evaluation_timezone(&self) -> chrono_tz::Tz {
        self.timezone
            .as_deref()
            .and_then(|name| name.parse::<chrono_tz::Tz>().ok())
            .unwrap_or(chrono_tz::UTC)
    }
}
