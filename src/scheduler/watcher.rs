//! Per-run watcher: finalise exactly one run by observing its conversation.
//!
//! The watcher heartbeats the run lease, polls the conversation stage (with
//! a cheap "turn in progress" precheck when the backend offers one), and
//! writes the terminal status. It stops only when it loses the lease to
//! another owner, the conversation reaches a terminal stage, or its overall
//! timeout elapses. Cancellation of the request that started the run never
//! reaches it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;

use crate::chat::{is_running_stage, normalize_stage, terminal_status, ChatClient};
use crate::config::LeaseConfig;
use crate::store::SchedulerStore;
use crate::types::{Field, RunId, RunPatch, RunStatus, ScheduleId, SchedulePatch};

const POLL_PERIOD: Duration = Duration::from_secs(3);
const CALL_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub(crate) struct WatcherParams {
    pub run_id: RunId,
    pub schedule_id: ScheduleId,
    pub conversation_id: String,
    /// Resolved overall deadline (schedule timeout or the default).
    pub timeout: Duration,
    pub run_name: String,
    pub started_at: DateTime<Utc>,
}

pub(crate) async fn watch(
    store: Arc<dyn SchedulerStore>,
    chat: Arc<dyn ChatClient>,
    lease: LeaseConfig,
    params: WatcherParams,
) {
    let heartbeat_every = (lease.ttl / 2).max(POLL_PERIOD);

    match tokio::time::timeout(
        CALL_TIMEOUT,
        store.try_claim_run(&params.run_id, &lease.owner, lease.until(Utc::now())),
    )
    .await
    {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
            tracing::debug!(run = %params.run_id, "run lease held by another owner, watcher exiting");
            return;
        }
        Ok(Err(err)) => {
            tracing::warn!(run = %params.run_id, error = %err, "watcher could not claim run lease");
            return;
        }
        Err(_) => {
            tracing::warn!(run = %params.run_id, "run lease claim timed out, watcher exiting");
            return;
        }
    }

    // The deadline is the watcher's own: independent of whatever context
    // spawned it, so an ended request cannot orphan the run.
    let deadline = tokio::time::Instant::now() + params.timeout;
    let mut next_heartbeat = tokio::time::Instant::now() + heartbeat_every;
    let probe = chat.turn_probe();
    let mut ticker = tokio::time::interval(POLL_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                finalize_deadline(&store, &chat, &lease, &params).await;
                return;
            }
            _ = ticker.tick() => {
                if tokio::time::Instant::now() >= next_heartbeat {
                    match tokio::time::timeout(
                        CALL_TIMEOUT,
                        store.try_claim_run(&params.run_id, &lease.owner, lease.until(Utc::now())),
                    )
                    .await
                    {
                        Ok(Ok(true)) => {
                            next_heartbeat = tokio::time::Instant::now() + heartbeat_every;
                        }
                        Ok(Ok(false)) => {
                            // Another owner took over; it will finalise.
                            tracing::debug!(run = %params.run_id, "run lease lost, watcher exiting");
                            return;
                        }
                        Ok(Err(err)) => {
                            tracing::warn!(run = %params.run_id, error = %err, "heartbeat failed, retrying");
                            next_heartbeat = tokio::time::Instant::now() + POLL_PERIOD;
                        }
                        Err(_) => {
                            tracing::warn!(run = %params.run_id, "heartbeat timed out, retrying");
                            next_heartbeat = tokio::time::Instant::now() + POLL_PERIOD;
                        }
                    }
                }

                // Cheap precheck: while any turn is active or queued there
                // is no point fetching the transcript.
                if let Some(probe) = &probe {
                    if let Ok(Ok(true)) = tokio::time::timeout(
                        CALL_TIMEOUT,
                        probe.turn_in_progress(&params.conversation_id),
                    )
                    .await
                    {
                        continue;
                    }
                }

                let view = match tokio::time::timeout(
                    FETCH_TIMEOUT,
                    chat.get_conversation(&params.conversation_id, true),
                )
                .await
                {
                    Ok(Ok(view)) => view,
                    Ok(Err(err)) => {
                        tracing::debug!(run = %params.run_id, error = %err, "stage fetch failed, retrying");
                        continue;
                    }
                    Err(_) => {
                        tracing::debug!(run = %params.run_id, "stage fetch timed out, retrying");
                        continue;
                    }
                };

                let stage = normalize_stage(view.stage.as_deref().unwrap_or(""));
                if is_running_stage(&stage) {
                    continue;
                }
                let status = terminal_status(&stage);
                let error = (status != RunStatus::Succeeded)
                    .then(|| format!("conversation ended at stage {stage:?}"));
                finalize(&store, &lease, &params, status, error).await;
                return;
            }
        }
    }
}

/// Deadline branch: one last stage fetch decides between "still running,
/// abort it" and "actually finished, record that".
async fn finalize_deadline(
    store: &Arc<dyn SchedulerStore>,
    chat: &Arc<dyn ChatClient>,
    lease: &LeaseConfig,
    params: &WatcherParams,
) {
    let mut fetch_error: Option<String> = None;
    let stage = match tokio::time::timeout(
        FETCH_TIMEOUT,
        chat.get_conversation(&params.conversation_id, true),
    )
    .await
    {
        Ok(Ok(view)) => normalize_stage(view.stage.as_deref().unwrap_or("")),
        Ok(Err(err)) => {
            fetch_error = Some(err.to_string());
            String::new()
        }
        Err(_) => {
            fetch_error = Some(format!("final stage fetch timed out after {FETCH_TIMEOUT:?}"));
            String::new()
        }
    };

    if stage.is_empty() || is_running_stage(&stage) {
        match chat.cancel(&params.conversation_id).await {
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(run = %params.run_id, error = %err, "best-effort cancel at deadline failed");
            }
        }
        let mut message = format!(
            "conv. aborted at {stage:?} ({} timeout)",
            humantime::format_duration(params.timeout)
        );
        if let Some(err) = fetch_error {
            message.push_str("; ");
            message.push_str(&err);
        }
        tracing::warn!(run = %params.run_id, name = %params.run_name, %message, "run timed out");
        finalize(store, lease, params, RunStatus::Failed, Some(message)).await;
        return;
    }

    let status = terminal_status(&stage);
    let error = (status != RunStatus::Succeeded).then(|| {
        let mut message = format!("conversation ended at stage {stage:?}");
        if let Some(err) = fetch_error {
            message.push_str("; ");
            message.push_str(&err);
        }
        message
    });
    finalize(store, lease, params, status, error).await;
}

/// Write the terminal status, release the lease, and mirror the outcome
/// onto the schedule. Each write is bounded and best-effort beyond the run
/// patch: a half-applied finalisation is repaired by the next tick.
async fn finalize(
    store: &Arc<dyn SchedulerStore>,
    lease: &LeaseConfig,
    params: &WatcherParams,
    status: RunStatus,
    error: Option<String>,
) {
    let completed_at = Utc::now();

    let mut patch = RunPatch::for_run(params.run_id);
    patch.status = Field::Set(status);
    patch.completed_at = Field::Set(completed_at);
    patch.error_message = match &error {
        Some(message) => Field::Set(message.clone()),
        None => Field::Clear,
    };
    match tokio::time::timeout(CALL_TIMEOUT, store.patch_run(&patch)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::error!(run = %params.run_id, error = %err, "failed to finalize run");
        }
        Err(_) => {
            tracing::error!(run = %params.run_id, "run finalization timed out");
        }
    }

    match tokio::time::timeout(
        CALL_TIMEOUT,
        store.release_run_lease(&params.run_id, &lease.owner),
    )
    .await
    {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            tracing::warn!(run = %params.run_id, error = %err, "failed to release run lease");
        }
        Err(_) => {
            tracing::warn!(run = %params.run_id, "run lease release timed out");
        }
    }

    let mut sched_patch = SchedulePatch::for_schedule(params.schedule_id);
    sched_patch.last_status = Field::Set(status);
    sched_patch.last_run_at = Field::Set(completed_at);
    sched_patch.last_error = match &error {
        Some(message) => Field::Set(message.clone()),
        None => Field::Clear,
    };
    match tokio::time::timeout(CALL_TIMEOUT, store.patch_schedule(&sched_patch)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(
                schedule = %params.schedule_id,
                error = %err,
                "failed to patch schedule last-result"
            );
        }
        Err(_) => {
            tracing::warn!(schedule = %params.schedule_id, "schedule last-result patch timed out");
        }
    }

    tracing::info!(
        run = %params.run_id,
        name = %params.run_name,
        %status,
        elapsed = ?(completed_at - params.started_at).to_std().unwrap_or_default(),
        "run finalized"
    );
}
