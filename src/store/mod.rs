//! Store contract for schedules and runs.
//!
//! All mutation flows through mask-based patches; lease fields move only
//! through the atomic compare-and-swap primitives. Multiple scheduler
//! instances may share one store, so every lease operation must be a
//! single-statement conditional update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cron::CronSpec;
use crate::types::{
    Run, RunId, RunPatch, RunStatus, Schedule, ScheduleId, ScheduleKind, SchedulePatch,
    StoreError, Violation,
};

mod sqlite;

pub use sqlite::SqliteSchedulerStore;

/// Filter for run lookups.
#[derive(Debug, Clone)]
pub struct RunQuery {
    pub schedule_id: ScheduleId,
    /// Exact slot match when set.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Exclude runs whose status is in this list.
    pub status_not_in: Vec<RunStatus>,
}

impl RunQuery {
    pub fn for_schedule(schedule_id: ScheduleId) -> Self {
        Self {
            schedule_id,
            scheduled_for: None,
            status_not_in: Vec::new(),
        }
    }

    pub fn with_slot(mut self, slot: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(slot);
        self
    }

    /// Keep only runs that have not reached a terminal status.
    pub fn excluding_terminal(mut self) -> Self {
        self.status_not_in = RunStatus::TERMINAL.to_vec();
        self
    }
}

/// Persistence contract consumed by the scheduler engine.
///
/// Lease claim semantics (both levels): the update succeeds iff the current
/// lease is absent, expired (strict `lease_until < now`), or already held by
/// `owner`; owner and expiry are written in one statement. Release clears
/// the lease only when `owner` still holds it.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    async fn get_schedule(&self, id: &ScheduleId) -> Result<Option<Schedule>, StoreError>;

    /// Background-execution view: every schedule, no privacy filter.
    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError>;

    /// Privacy-scoped view for user-facing callers: public schedules plus
    /// the caller's own private ones. Never used by the due engine.
    async fn list_schedules_for_user(&self, user_id: &str) -> Result<Vec<Schedule>, StoreError>;

    /// Validated insert-or-replace of a full schedule row.
    async fn put_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;

    /// Masked partial update; stamps `updated_at`.
    async fn patch_schedule(&self, patch: &SchedulePatch) -> Result<(), StoreError>;

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>, StoreError>;

    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<Run>, StoreError>;

    async fn find_run_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Run>, StoreError>;

    /// Masked upsert: inserts when the run id is unknown (stamping
    /// `created_at` and defaulting `conversation_kind`), updates otherwise.
    /// Always stamps `updated_at`.
    async fn patch_run(&self, patch: &RunPatch) -> Result<(), StoreError>;

    async fn try_claim_schedule(
        &self,
        id: &ScheduleId,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn release_schedule_lease(
        &self,
        id: &ScheduleId,
        owner: &str,
    ) -> Result<bool, StoreError>;

    async fn try_claim_run(
        &self,
        id: &RunId,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn release_run_lease(&self, id: &RunId, owner: &str) -> Result<bool, StoreError>;
}

/// Structural checks applied before a schedule row is written.
pub fn validate_schedule(schedule: &Schedule) -> Vec<Violation> {
    let mut violations = Vec::new();
    if schedule.name.trim().is_empty() {
        violations.push(Violation::new("name", "required"));
    }
    if schedule.agent_ref.trim().is_empty() {
        violations.push(Violation::new("agent_ref", "required"));
    }
    match schedule.kind {
        ScheduleKind::Cron => {
            match schedule.cron_expr.as_deref() {
                Some(expr) => {
                    if let Err(err) = CronSpec::parse(expr) {
                        violations.push(Violation::new("cron_expr", err.to_string()));
                    }
                }
                None => violations.push(Violation::new("cron_expr", "required for cron schedules")),
            }
            if schedule.interval_seconds.is_some() {
                violations.push(Violation::new(
                    "interval_seconds",
                    "must be absent for cron schedules",
                ));
            }
        }
        ScheduleKind::Interval => {
            match schedule.interval_seconds {
                Some(secs) if secs > 0 => {}
                Some(_) => violations.push(Violation::new("interval_seconds", "must be positive")),
                None => violations.push(Violation::new(
                    "interval_seconds",
                    "required for interval schedules",
                )),
            }
            if schedule.cron_expr.is_some() {
                violations.push(Violation::new(
                    "cron_expr",
                    "must be absent for interval schedules",
                ));
            }
        }
        ScheduleKind::Adhoc => {
            if schedule.cron_expr.is_some() || schedule.interval_seconds.is_some() {
                violations.push(Violation::new(
                    "schedule_type",
                    "adhoc schedules carry neither cron_expr nor interval_seconds",
                ));
            }
        }
    }
    violations
}

/// Structural checks applied when a run patch inserts a new row.
pub fn validate_run_insert(patch: &RunPatch) -> Vec<Violation> {
    let mut violations = Vec::new();
    if patch.schedule_id.is_none() {
        violations.push(Violation::new("schedule_id", "required on insert"));
    }
    if patch.scheduled_for.value().is_none() {
        violations.push(Violation::new("scheduled_for", "required on insert"));
    }
    violations
}
