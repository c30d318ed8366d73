//! Chat/conversation collaborator interface.
//!
//! The scheduler never drives conversations itself; it creates them, posts
//! the task prompt, and then observes the conversation stage until it goes
//! terminal. Implementations adapt whatever chat subsystem hosts the agents.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ChatError, RunId, RunStatus, ScheduleId, Visibility};

/// Stages that mean the conversation is still making progress.
pub const RUNNING_STAGES: [&str; 5] =
    ["executing", "thinking", "waiting", "eliciting", "elicitation"];

/// Request to open a fresh conversation for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConversation {
    /// Conversation title; the scheduler passes the schedule name.
    pub title: String,
    pub visibility: Visibility,
    /// External agent identifier.
    pub agent: String,
    pub model: Option<String>,
}

/// A message posted into a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostMessage {
    pub content: String,
    pub agent: String,
    pub model: Option<String>,
}

/// Annotation linking a conversation back to the schedule and run that
/// created it. Written best-effort; losing it never fails a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationLink {
    pub scheduled: bool,
    pub schedule_id: ScheduleId,
    pub schedule_run_id: RunId,
    pub kind: String,
    pub timezone: Option<String>,
    pub cron_expr: Option<String>,
}

/// Snapshot of a conversation as seen by the watcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationView {
    pub id: String,
    pub stage: Option<String>,
    /// Present when the caller asked for the transcript; opaque here.
    pub transcript: Option<serde_json::Value>,
}

/// Lightweight DAO used for the cheap "any turn in progress" precheck.
/// Optional: schedulers fall back to full stage fetches without it.
#[async_trait]
pub trait TurnProbe: Send + Sync {
    /// Whether any turn of the conversation is active or queued.
    async fn turn_in_progress(&self, conversation_id: &str) -> Result<bool, ChatError>;
}

/// The conversation surface the scheduler consumes.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Open a conversation; must return a non-empty id.
    async fn create_conversation(&self, req: NewConversation) -> Result<String, ChatError>;

    /// Post a message; returns the message id.
    async fn post_message(
        &self,
        conversation_id: &str,
        req: PostMessage,
    ) -> Result<String, ChatError>;

    /// Best-effort stop. Returns whether anything was cancelled.
    async fn cancel(&self, conversation_id: &str) -> Result<bool, ChatError>;

    /// Fetch the conversation, optionally with its transcript.
    async fn get_conversation(
        &self,
        conversation_id: &str,
        include_transcript: bool,
    ) -> Result<ConversationView, ChatError>;

    /// Best-effort annotation of a conversation with its scheduling origin.
    async fn annotate(
        &self,
        conversation_id: &str,
        link: &ConversationLink,
    ) -> Result<(), ChatError>;

    /// Cheap precheck handle, when the backend offers one.
    fn turn_probe(&self) -> Option<Arc<dyn TurnProbe>> {
        None
    }
}

/// Lowercase and trim a raw stage value.
pub fn normalize_stage(stage: &str) -> String {
    stage.trim().to_ascii_lowercase()
}

/// Whether a normalized stage means the conversation is still running.
pub fn is_running_stage(stage: &str) -> bool {
    RUNNING_STAGES.contains(&stage)
}

/// Map a normalized, non-running stage to the run's terminal status.
pub fn terminal_status(stage: &str) -> RunStatus {
    match stage {
        "error" | "failed" => RunStatus::Failed,
        "canceled" => RunStatus::Skipped,
        _ => RunStatus::Succeeded,
    }
}
