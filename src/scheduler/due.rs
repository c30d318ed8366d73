//! The due-evaluation tick.
//!
//! One pass over every schedule: compute due-ness, claim the schedule
//! lease, inspect the slot's existing runs, then start, recover, or
//! advance. Any number of instances may tick concurrently against the same
//! store; the lease claim decides which one acts on a given schedule.

use chrono::{DateTime, Utc};

use crate::auth::ExecContext;
use crate::config::LEASE_GRACE;
use crate::cron::CronSpec;
use crate::store::RunQuery;
use crate::types::{
    Field, Run, RunPatch, RunStatus, Schedule, ScheduleKind, SchedulePatch, SchedulerError,
};

use super::executor::{self, RunDraft};
use super::SchedulerEngine;

/// Result of one `run_due` pass. The error, when present, aborted the tick;
/// `started` counts the runs launched before that point.
#[derive(Debug)]
pub struct TickReport {
    pub started: usize,
    pub error: Option<SchedulerError>,
}

/// Terminal outcome mirrored onto the schedule's `last_*` columns.
struct LastOutcome {
    status: RunStatus,
    error: Option<String>,
    last_run_at: Option<DateTime<Utc>>,
}

enum StaleRecovery {
    /// Another instance holds a live lease on the run and will finalise it.
    OwnedElsewhere,
    Recovered(LastOutcome),
}

impl SchedulerEngine {
    /// One tick over all schedules. A per-schedule failure aborts the pass
    /// and is reported alongside the number of runs already started; the
    /// watchdog retries on its next cadence.
    pub async fn run_due(&self) -> TickReport {
        let schedules = match self.store.list_schedules().await {
            Ok(schedules) => schedules,
            Err(err) => {
                return TickReport {
                    started: 0,
                    error: Some(err.into()),
                }
            }
        };

        let mut started = 0;
        for schedule in &schedules {
            match self.process_schedule(schedule).await {
                Ok(count) => started += count,
                Err(err) => {
                    tracing::error!(schedule = %schedule.id, error = %err, "tick aborted");
                    return TickReport {
                        started,
                        error: Some(err),
                    };
                }
            }
        }
        TickReport {
            started,
            error: None,
        }
    }

    async fn process_schedule(&self, schedule: &Schedule) -> Result<usize, SchedulerError> {
        let now = Utc::now();

        if !schedule.enabled {
            // Disabled schedules never start runs, but crashed watchers on
            // them still need recovery.
            self.recover_disabled_schedule(schedule, now).await?;
            return Ok(0);
        }

        // Act as the schedule's owner: conversation-visibility filters can
        // hide private runs from the default background identity.
        let ctx = match schedule
            .created_by_user_id
            .as_deref()
            .or(self.default_user_id.as_deref())
        {
            Some(user) => ExecContext::for_user(user),
            None => ExecContext::background(),
        };

        if let Some(start) = schedule.start_at {
            if now < start {
                return Ok(0);
            }
        }
        if let Some(end) = schedule.end_at {
            if now >= end {
                return Ok(0);
            }
        }

        if !self.is_due(schedule, now).await? {
            return Ok(0);
        }

        if !self
            .store
            .try_claim_schedule(&schedule.id, self.lease_owner(), self.lease.until(now))
            .await?
        {
            tracing::debug!(schedule = %schedule.id, "schedule lease held elsewhere, skipping");
            return Ok(0);
        }

        let result = self.process_claimed(schedule, &ctx, now).await;

        // Released on every exit path, success or error.
        if let Err(err) = self
            .store
            .release_schedule_lease(&schedule.id, self.lease_owner())
            .await
        {
            tracing::warn!(schedule = %schedule.id, error = %err, "failed to release schedule lease");
        }

        result
    }

    async fn is_due(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        match schedule.kind {
            ScheduleKind::Cron => {
                let expr = schedule.cron_expr.as_deref().ok_or_else(|| {
                    SchedulerError::Validation(format!(
                        "schedule {} has no cron expression",
                        schedule.id
                    ))
                })?;
                let spec = CronSpec::parse(expr)?;
                let tz = schedule.evaluation_timezone();
                let base = schedule.last_run_at.unwrap_or(schedule.created_at);
                let computed_next = spec
                    .next(base.with_timezone(&tz))
                    .map(|t| t.with_timezone(&Utc));
                let effective_next = schedule.next_run_at.or(computed_next);
                match effective_next {
                    Some(next) if now >= next => Ok(true),
                    Some(next) => {
                        if schedule.next_run_at.is_none() {
                            // Seed the cursor so readers see a stable value.
                            let mut patch = SchedulePatch::for_schedule(schedule.id);
                            patch.next_run_at = Field::Set(next);
                            self.store.patch_schedule(&patch).await?;
                        }
                        Ok(false)
                    }
                    None => Ok(false),
                }
            }
            ScheduleKind::Interval => {
                let secs = interval_seconds(schedule)?;
                let base = schedule.last_run_at.unwrap_or(schedule.created_at);
                Ok(now >= base + chrono::Duration::seconds(secs))
            }
            ScheduleKind::Adhoc => Ok(schedule.next_run_at.map(|next| now >= next).unwrap_or(false)),
        }
    }

    async fn process_claimed(
        &self,
        schedule: &Schedule,
        ctx: &ExecContext,
        now: DateTime<Utc>,
    ) -> Result<usize, SchedulerError> {
        // The slot this tick is filling: the stored cursor when present.
        let (slot, include_slot) = match schedule.next_run_at {
            Some(next) => (next, true),
            None => (now, false),
        };

        let mut runs: Vec<Run> = Vec::new();
        if include_slot {
            runs.extend(
                self.store
                    .list_runs(&RunQuery::for_schedule(schedule.id).with_slot(slot))
                    .await?,
            );
        }
        let open = self
            .store
            .list_runs(&RunQuery::for_schedule(schedule.id).excluding_terminal())
            .await?;
        for run in open {
            if !runs.iter().any(|r| r.id == run.id) {
                runs.push(run);
            }
        }

        // The slot may already have a terminal run, e.g. after a crash
        // between finalisation and the schedule advance. Never start a
        // second one; just bring the schedule forward.
        if let Some(done) = runs
            .iter()
            .find(|r| r.scheduled_for == slot && r.completed_at.is_some())
        {
            let outcome = LastOutcome {
                status: done.status,
                error: done.error_message.clone(),
                last_run_at: done
                    .started_at
                    .or(Some(done.scheduled_for))
                    .or(Some(done.created_at))
                    .or(done.completed_at),
            };
            self.advance_schedule(schedule, now, Some(outcome)).await?;
            return Ok(0);
        }

        for run in runs
            .iter()
            .filter(|r| r.status.is_active() && r.completed_at.is_none())
        {
            if self.run_is_stale(schedule, run, now) {
                match self.recover_stale_run(schedule, run, now).await? {
                    StaleRecovery::OwnedElsewhere => return Ok(0),
                    StaleRecovery::Recovered(outcome) => {
                        if include_slot && run.scheduled_for == slot {
                            // The stale run was this slot's attempt; the
                            // slot counts as processed.
                            self.advance_schedule(schedule, now, Some(outcome)).await?;
                            return Ok(0);
                        }
                        // An older slot's leftover: record the outcome but
                        // keep the cursor so this slot can still start.
                        self.patch_last_outcome(schedule, outcome).await?;
                        continue;
                    }
                }
            }

            // A live run blocks the schedule.
            if schedule.kind == ScheduleKind::Adhoc && schedule.next_run_at.is_some() {
                // Stop the tick from seeing the schedule as due while the
                // run is in flight.
                let mut patch = SchedulePatch::for_schedule(schedule.id);
                patch.next_run_at = Field::Clear;
                self.store.patch_schedule(&patch).await?;
            }
            return Ok(0);
        }

        // Reuse a pending run for this slot when one exists (crash replay),
        // preferring an exact slot match over any other pending run.
        let pending: Vec<&Run> = runs
            .iter()
            .filter(|r| r.status == RunStatus::Pending)
            .collect();
        let reuse = pending
            .iter()
            .find(|r| r.scheduled_for == slot)
            .or_else(|| pending.first());
        let run_id = reuse.map(|r| r.id).unwrap_or_default();

        let draft = RunDraft {
            id: Some(run_id),
            schedule_id: Some(schedule.id),
            status: Some(RunStatus::Pending),
            scheduled_for: Some(slot),
            conversation_kind: None,
        };
        executor::execute(self, draft, ctx.clone()).await?;

        // Advance the cursor; last_* is patched by the watcher on completion.
        self.advance_schedule(schedule, now, None).await?;
        Ok(1)
    }

    /// Stale recovery for a disabled schedule: finalise abandoned runs and
    /// mirror their outcome, but never move the cursor.
    async fn recover_disabled_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let open = self
            .store
            .list_runs(&RunQuery::for_schedule(schedule.id).excluding_terminal())
            .await?;
        for run in open
            .iter()
            .filter(|r| r.status.is_active() && r.completed_at.is_none())
        {
            if !self.run_is_stale(schedule, run, now) {
                continue;
            }
            match self.recover_stale_run(schedule, run, now).await? {
                StaleRecovery::OwnedElsewhere => {}
                StaleRecovery::Recovered(outcome) => {
                    self.patch_last_outcome(schedule, outcome).await?;
                }
            }
        }
        Ok(())
    }

    /// A running or prechecking run is stale when its lease expired more
    /// than the grace period ago, or, without a lease, when its deadline
    /// plus grace has passed.
    fn run_is_stale(&self, schedule: &Schedule, run: &Run, now: DateTime<Utc>) -> bool {
        let grace = chrono_grace();
        match run.lease_until {
            Some(until) => now > until + grace,
            None => {
                let start = run.started_at.unwrap_or(run.created_at);
                let timeout = chrono::Duration::from_std(schedule.effective_timeout())
                    .unwrap_or_else(|_| chrono::Duration::seconds(20 * 60));
                now > start + timeout + grace
            }
        }
    }

    async fn recover_stale_run(
        &self,
        schedule: &Schedule,
        run: &Run,
        now: DateTime<Utc>,
    ) -> Result<StaleRecovery, SchedulerError> {
        if !self
            .store
            .try_claim_run(&run.id, self.lease_owner(), self.lease.until(now))
            .await?
        {
            // A live lease re-appeared since the staleness check.
            return Ok(StaleRecovery::OwnedElsewhere);
        }

        if let Some(conversation_id) = &run.conversation_id {
            if let Err(err) = self.chat.cancel(conversation_id).await {
                tracing::warn!(
                    run = %run.id,
                    error = %err,
                    "best-effort cancel of stale conversation failed"
                );
            }
        }

        let message = stale_message(schedule, run, now);
        let mut patch = RunPatch::for_run(run.id);
        patch.status = Field::Set(RunStatus::Failed);
        patch.completed_at = Field::Set(now);
        patch.error_message = Field::Set(message.clone());
        self.store.patch_run(&patch).await?;

        if let Err(err) = self.store.release_run_lease(&run.id, self.lease_owner()).await {
            tracing::warn!(run = %run.id, error = %err, "failed to release recovered run lease");
        }

        tracing::warn!(run = %run.id, schedule = %schedule.id, %message, "recovered stale run");
        Ok(StaleRecovery::Recovered(LastOutcome {
            status: RunStatus::Failed,
            error: Some(message),
            last_run_at: run.started_at,
        }))
    }

    async fn patch_last_outcome(
        &self,
        schedule: &Schedule,
        outcome: LastOutcome,
    ) -> Result<(), SchedulerError> {
        let mut patch = SchedulePatch::for_schedule(schedule.id);
        apply_outcome(&mut patch, outcome);
        self.store.patch_schedule(&patch).await?;
        Ok(())
    }

    /// Move the cursor to the schedule's next slot, optionally mirroring a
    /// terminal outcome onto `last_*` in the same patch.
    async fn advance_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        outcome: Option<LastOutcome>,
    ) -> Result<(), SchedulerError> {
        let mut patch = SchedulePatch::for_schedule(schedule.id);
        if let Some(outcome) = outcome {
            apply_outcome(&mut patch, outcome);
        }
        patch.next_run_at = self.next_cursor(schedule, now)?;
        self.store.patch_schedule(&patch).await?;
        Ok(())
    }

    fn next_cursor(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<Field<DateTime<Utc>>, SchedulerError> {
        match schedule.kind {
            ScheduleKind::Cron => {
                let expr = schedule.cron_expr.as_deref().ok_or_else(|| {
                    SchedulerError::Validation(format!(
                        "schedule {} has no cron expression",
                        schedule.id
                    ))
                })?;
                let spec = CronSpec::parse(expr)?;
                let tz = schedule.evaluation_timezone();
                Ok(match spec.next(now.with_timezone(&tz)) {
                    Some(next) => Field::Set(next.with_timezone(&Utc)),
                    None => Field::Clear,
                })
            }
            ScheduleKind::Interval => {
                let secs = interval_seconds(schedule)?;
                Ok(Field::Set(now + chrono::Duration::seconds(secs)))
            }
            ScheduleKind::Adhoc => Ok(Field::Clear),
        }
    }
}

fn apply_outcome(patch: &mut SchedulePatch, outcome: LastOutcome) {
    patch.last_status = Field::Set(outcome.status);
    patch.last_error = match (outcome.status, outcome.error) {
        (RunStatus::Succeeded, _) | (_, None) => Field::Clear,
        (_, Some(message)) => Field::Set(message),
    };
    if let Some(at) = outcome.last_run_at {
        patch.last_run_at = Field::Set(at);
    }
}

fn interval_seconds(schedule: &Schedule) -> Result<i64, SchedulerError> {
    match schedule.interval_seconds {
        Some(secs) if secs > 0 => Ok(secs as i64),
        _ => Err(SchedulerError::Validation(format!(
            "schedule {} has no interval",
            schedule.id
        ))),
    }
}

fn stale_message(schedule: &Schedule, run: &Run, now: DateTime<Utc>) -> String {
    match run.lease_until {
        Some(until) => format!(
            "stale run: watcher lease expired at {} and was never renewed (observed at {})",
            until.to_rfc3339(),
            now.to_rfc3339()
        ),
        None => {
            let start = run.started_at.unwrap_or(run.created_at);
            format!(
                "stale run: no lease and deadline passed (started {}, timeout {})",
                start.to_rfc3339(),
                humantime::format_duration(schedule.effective_timeout())
            )
        }
    }
}

fn chrono_grace() -> chrono::Duration {
    chrono::Duration::from_std(LEASE_GRACE).unwrap_or_else(|_| chrono::Duration::seconds(15))
}
