//! Scheduler engine: wiring, lease identity, and the run-now fast path.
//!
//! One [`SchedulerEngine`] serves one process. Any number of engines (in any
//! number of processes) may point at the same store; schedule- and run-level
//! leases serialise their work. The [`Watchdog`] drives the periodic
//! [`SchedulerEngine::run_due`] tick; each started run hands off to a
//! detached watcher task that finalises it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::auth::{AuthConfig, ExecContext, OobAuthorizer};
use crate::chat::ChatClient;
use crate::config::LeaseConfig;
use crate::store::SchedulerStore;
use crate::types::{
    Field, RunId, RunPatch, RunStatus, ScheduleId, SchedulePatch, SchedulerError,
    CONVERSATION_KIND_SCHEDULED,
};

mod due;
mod executor;
mod watcher;
mod watchdog;

pub use due::TickReport;
pub use executor::RunDraft;
pub use watchdog::{Watchdog, DEFAULT_TICK_INTERVAL};

pub(crate) use watcher::WatcherParams;

/// Input of the run-now fast path. `id` doubles as the run id and, for
/// legacy callers that only send one identifier, as the schedule id.
#[derive(Debug, Clone, Default)]
pub struct RunNowRequest {
    pub id: Option<uuid::Uuid>,
    pub schedule_id: Option<ScheduleId>,
    pub status: Option<RunStatus>,
    pub conversation_id: Option<String>,
    pub conversation_kind: Option<String>,
}

/// Result of the run-now fast path. `conversation_id` is empty until an
/// executor actually opened one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNowOutcome {
    pub run_id: RunId,
    pub conversation_id: String,
}

/// The scheduling core of one process.
pub struct SchedulerEngine {
    pub(crate) store: Arc<dyn SchedulerStore>,
    pub(crate) chat: Arc<dyn ChatClient>,
    pub(crate) authorizer: Option<Arc<dyn OobAuthorizer>>,
    pub(crate) auth: AuthConfig,
    pub(crate) lease: LeaseConfig,
    pub(crate) default_user_id: Option<String>,
    inline_run_now: bool,
    /// Live watcher tasks, so hosts can observe and abort them at shutdown.
    watchers: Mutex<HashMap<RunId, JoinHandle<()>>>,
}

impl SchedulerEngine {
    pub fn new(store: Arc<dyn SchedulerStore>, chat: Arc<dyn ChatClient>) -> Self {
        Self {
            store,
            chat,
            authorizer: None,
            auth: AuthConfig::default(),
            lease: LeaseConfig::from_env(),
            default_user_id: None,
            inline_run_now: false,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_lease_config(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn OobAuthorizer>, auth: AuthConfig) -> Self {
        self.authorizer = Some(authorizer);
        self.auth = auth;
        self
    }

    /// Identity runs fall back to when a schedule has no recorded owner.
    pub fn with_default_user(mut self, user_id: impl Into<String>) -> Self {
        self.default_user_id = Some(user_id.into());
        self
    }

    /// Wire the in-process executor into run-now. Without it, run-now only
    /// persists the pending run and nudges the schedule for the watchdog.
    pub fn with_inline_run_now(mut self, inline: bool) -> Self {
        self.inline_run_now = inline;
        self
    }

    pub fn lease_owner(&self) -> &str {
        &self.lease.owner
    }

    /// Number of watcher tasks that have not finished yet.
    pub fn active_watchers(&self) -> usize {
        self.watchers.lock().values().filter(|h| !h.is_finished()).count()
    }

    /// Abort all live watchers. Their runs will be picked up by stale
    /// recovery on another instance (or this one, after restart).
    pub fn abort_watchers(&self) {
        for (_, handle) in self.watchers.lock().drain() {
            handle.abort();
        }
    }

    pub(crate) fn spawn_watcher(&self, params: WatcherParams) {
        let store = Arc::clone(&self.store);
        let chat = Arc::clone(&self.chat);
        let lease = self.lease.clone();
        let run_id = params.run_id;
        // The watcher owns its own lifetime: it is spawned on the runtime,
        // carries only values, and is bounded by the run timeout rather
        // than by whatever request context triggered the run.
        let handle = tokio::spawn(watcher::watch(store, chat, lease, params));
        let mut watchers = self.watchers.lock();
        watchers.retain(|_, h| !h.is_finished());
        watchers.insert(run_id, handle);
    }

    /// Create and persist a pending run immediately.
    ///
    /// With an in-process executor wired the run starts synchronously;
    /// otherwise the schedule is nudged (`next_run_at = now`) so the next
    /// watchdog tick starts it. The nudge is skipped in the inline case to
    /// avoid duplicate executions.
    pub async fn run_now(&self, req: RunNowRequest) -> Result<RunNowOutcome, SchedulerError> {
        let schedule_id = req
            .schedule_id
            .or(req.id.map(ScheduleId::from_uuid))
            .ok_or_else(|| {
                SchedulerError::Validation("run-now requires a schedule id".to_string())
            })?;
        let run_id = req.id.map(RunId::from_uuid).unwrap_or_default();
        let now = Utc::now();

        let mut patch = RunPatch::for_run(run_id);
        patch.schedule_id = Some(schedule_id);
        patch.scheduled_for = Field::Set(now);
        patch.status = Field::Set(req.status.unwrap_or_default());
        if let Some(conversation_id) = &req.conversation_id {
            patch.conversation_id = Field::Set(conversation_id.clone());
        }
        patch.conversation_kind = Field::Set(
            req.conversation_kind
                .clone()
                .unwrap_or_else(|| CONVERSATION_KIND_SCHEDULED.to_string()),
        );
        self.store.patch_run(&patch).await?;

        if self.inline_run_now {
            let draft = RunDraft {
                id: Some(run_id),
                schedule_id: Some(schedule_id),
                status: req.status,
                scheduled_for: Some(now),
                conversation_kind: req.conversation_kind,
            };
            let (run_id, conversation_id) =
                executor::execute(self, draft, ExecContext::background()).await?;
            return Ok(RunNowOutcome {
                run_id,
                conversation_id,
            });
        }

        let mut nudge = SchedulePatch::for_schedule(schedule_id);
        nudge.next_run_at = Field::Set(now);
        self.store.patch_schedule(&nudge).await?;

        Ok(RunNowOutcome {
            run_id,
            conversation_id: req.conversation_id.unwrap_or_default(),
        })
    }
}
