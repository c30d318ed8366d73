//! Run executor: turn a drafted run into a live conversation.
//!
//! Order matters here. The run row is persisted before any conversation
//! side-effect, so a crash at any later step leaves a `pending`/`running`
//! row that stale recovery will finalise. The conversation is always fresh;
//! runs never share one.

use chrono::Utc;

use crate::auth::{self, ExecContext};
use crate::chat::{ConversationLink, NewConversation, PostMessage};
use crate::secrets::redact_credential_ref;
use crate::types::{
    ChatError, Field, RunId, RunPatch, RunStatus, ScheduleId, SchedulePatch, SchedulerError,
    CONVERSATION_KIND_SCHEDULED,
};

use super::{SchedulerEngine, WatcherParams};

/// A run about to be executed; may carry only the identifiers.
#[derive(Debug, Clone, Default)]
pub struct RunDraft {
    pub id: Option<RunId>,
    pub schedule_id: Option<ScheduleId>,
    pub status: Option<RunStatus>,
    pub scheduled_for: Option<chrono::DateTime<Utc>>,
    pub conversation_kind: Option<String>,
}

/// Execute a drafted run. Returns the run id and the conversation opened
/// for it. On error the persisted run row (if any) is left for stale
/// recovery.
pub(crate) async fn execute(
    engine: &SchedulerEngine,
    draft: RunDraft,
    ctx: ExecContext,
) -> Result<(RunId, String), SchedulerError> {
    let run_id = draft.id.unwrap_or_default();
    let schedule_id = draft.schedule_id.ok_or(SchedulerError::MissingScheduleId)?;

    let schedule = engine
        .store
        .get_schedule(&schedule_id)
        .await?
        .ok_or(SchedulerError::ScheduleNotFound(schedule_id))?;

    // Out-of-band auth replaces the ambient identity with the credential
    // owner's tokens before anything touches the chat subsystem.
    let ctx = match schedule.user_cred_url.as_deref() {
        Some(cred_url) => {
            tracing::debug!(
                schedule = %schedule.id,
                cred = %redact_credential_ref(cred_url),
                "resolving out-of-band credentials"
            );
            auth::oob_login(engine.authorizer.as_ref(), &engine.auth, &ctx, cred_url).await?
        }
        None => ctx,
    };

    let effective_user = schedule
        .created_by_user_id
        .clone()
        .or_else(|| ctx.effective_user(engine.default_user_id.as_deref()));
    if schedule.created_by_user_id.is_none() {
        if let Some(user) = &effective_user {
            let mut patch = SchedulePatch::for_schedule(schedule.id);
            patch.created_by_user_id = Field::Set(user.clone());
            if let Err(err) = engine.store.patch_schedule(&patch).await {
                tracing::warn!(schedule = %schedule.id, error = %err, "failed to backfill schedule owner");
            }
        }
    }

    let status = draft.status.unwrap_or_default();
    let kind = draft
        .conversation_kind
        .unwrap_or_else(|| CONVERSATION_KIND_SCHEDULED.to_string());
    let scheduled_for = draft.scheduled_for.unwrap_or_else(Utc::now);

    // A run row must exist before any conversation side-effects.
    let mut patch = RunPatch::for_run(run_id);
    patch.schedule_id = Some(schedule_id);
    patch.status = Field::Set(status);
    patch.scheduled_for = Field::Set(scheduled_for);
    patch.conversation_kind = Field::Set(kind.clone());
    engine.store.patch_run(&patch).await?;

    let conversation_id = engine
        .chat
        .create_conversation(NewConversation {
            title: schedule.name.clone(),
            visibility: schedule.visibility,
            agent: schedule.agent_ref.clone(),
            model: schedule.model_override.clone(),
        })
        .await?;
    if conversation_id.is_empty() {
        return Err(ChatError::EmptyConversationId.into());
    }

    let link = ConversationLink {
        scheduled: true,
        schedule_id,
        schedule_run_id: run_id,
        kind,
        timezone: schedule.timezone.clone(),
        cron_expr: schedule.cron_expr.clone(),
    };
    if let Err(err) = engine.chat.annotate(&conversation_id, &link).await {
        tracing::warn!(
            run = %run_id,
            conversation = %conversation_id,
            error = %err,
            "failed to annotate conversation with its schedule"
        );
    }

    let mut patch = RunPatch::for_run(run_id);
    patch.conversation_id = Field::Set(conversation_id.clone());
    engine.store.patch_run(&patch).await?;

    let content = schedule
        .task_prompt
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| schedule.task_prompt_uri.clone().filter(|s| !s.is_empty()));

    let started_at = Utc::now();
    if let Some(content) = content {
        engine
            .chat
            .post_message(
                &conversation_id,
                PostMessage {
                    content,
                    agent: schedule.agent_ref.clone(),
                    model: schedule.model_override.clone(),
                },
            )
            .await?;

        let mut patch = RunPatch::for_run(run_id);
        patch.status = Field::Set(RunStatus::Running);
        patch.started_at = Field::Set(started_at);
        engine.store.patch_run(&patch).await?;
    }

    // Early claim is best-effort; the watcher heartbeats from here on.
    if let Err(err) = engine
        .store
        .try_claim_run(&run_id, engine.lease_owner(), engine.lease.until(started_at))
        .await
    {
        tracing::warn!(run = %run_id, error = %err, "initial run lease claim failed");
    }

    engine.spawn_watcher(WatcherParams {
        run_id,
        schedule_id,
        conversation_id: conversation_id.clone(),
        timeout: schedule.effective_timeout(),
        run_name: schedule.name.clone(),
        started_at,
    });

    tracing::info!(
        run = %run_id,
        schedule = %schedule.id,
        conversation = %conversation_id,
        user = effective_user.as_deref().unwrap_or("background"),
        "run started"
    );
    Ok((run_id, conversation_id))
}
