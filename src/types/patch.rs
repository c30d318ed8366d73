//! Mask-based partial updates.
//!
//! A patch carries a three-state [`Field`] per mutable column so that
//! "leave untouched" and "write NULL" stay distinguishable all the way to
//! the store. Unmasked fields are never overwritten.

use chrono::{DateTime, Utc};

use super::{RunId, RunStatus, ScheduleId};

/// Three-state field used by patch carriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field<T> {
    /// Not part of the patch; the stored value stays as-is.
    Keep,
    /// Explicitly clear the stored value (write NULL).
    Clear,
    /// Write this value.
    Set(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Keep
    }
}

impl<T> Field<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Field::Keep)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Set(v) => Some(v),
            _ => None,
        }
    }

    /// Collapse to the value a masked write would leave behind.
    pub fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            Field::Keep => current,
            Field::Clear => None,
            Field::Set(v) => Some(v),
        }
    }
}

impl<T> From<Option<T>> for Field<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Field::Set(v),
            None => Field::Keep,
        }
    }
}

/// Partial update of a schedule row. Lease fields are deliberately absent:
/// they only move through the compare-and-swap primitives.
#[derive(Debug, Clone, Default)]
pub struct SchedulePatch {
    pub id: ScheduleId,
    pub enabled: Field<bool>,
    pub next_run_at: Field<DateTime<Utc>>,
    pub last_run_at: Field<DateTime<Utc>>,
    pub last_status: Field<RunStatus>,
    pub last_error: Field<String>,
    pub created_by_user_id: Field<String>,
}

impl SchedulePatch {
    pub fn for_schedule(id: ScheduleId) -> Self {
        Self { id, ..Self::default() }
    }

    /// True when no field beyond the id is masked in.
    pub fn is_empty(&self) -> bool {
        self.enabled.is_keep()
            && self.next_run_at.is_keep()
            && self.last_run_at.is_keep()
            && self.last_status.is_keep()
            && self.last_error.is_keep()
            && self.created_by_user_id.is_keep()
    }
}

/// Partial update of a run row. Applied as an upsert: unknown ids insert,
/// known ids update. Lease fields move only through compare-and-swap.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub id: RunId,
    /// Required on insert; ignored on update.
    pub schedule_id: Option<ScheduleId>,
    pub status: Field<RunStatus>,
    pub scheduled_for: Field<DateTime<Utc>>,
    pub started_at: Field<DateTime<Utc>>,
    pub completed_at: Field<DateTime<Utc>>,
    pub error_message: Field<String>,
    pub conversation_id: Field<String>,
    pub conversation_kind: Field<String>,
}

impl RunPatch {
    pub fn for_run(id: RunId) -> Self {
        Self { id, ..Self::default() }
    }
}
