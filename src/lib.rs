//! Agently Scheduler
//!
//! A distributed task scheduler for agent workloads. Schedules (cron,
//! fixed-interval, or ad-hoc) are persisted in a shared store; each firing
//! becomes a run backed by a fresh conversation against the hosting chat
//! subsystem. A per-run watcher observes the conversation to completion and
//! records the terminal status. Schedule- and run-level leases let any
//! number of scheduler instances share one store safely.
//!
//! Typical wiring:
//!
//! ```no_run
//! use std::sync::Arc;
//! use agently_scheduler::{SchedulerEngine, SqliteSchedulerStore, Watchdog, DEFAULT_TICK_INTERVAL};
//! # use agently_scheduler::chat::ChatClient;
//! # async fn wire(chat: Arc<dyn ChatClient>) {
//! let store = Arc::new(SqliteSchedulerStore::open(&SqliteSchedulerStore::default_path()).unwrap());
//! let engine = Arc::new(SchedulerEngine::new(store, chat));
//! let watchdog = Watchdog::start(engine, DEFAULT_TICK_INTERVAL);
//! # let _ = watchdog;
//! # }
//! ```

pub mod auth;
pub mod chat;
pub mod config;
pub mod cron;
pub mod scheduler;
pub mod secrets;
pub mod store;
pub mod types;

pub use auth::{AuthConfig, AuthMode, ExecContext, OobAuthorizer, OobCredentials, UserInfo};
pub use chat::{ChatClient, ConversationLink, ConversationView, NewConversation, PostMessage, TurnProbe};
pub use config::{debug_enabled, init_tracing, LeaseConfig, DEFAULT_LEASE_TTL, LEASE_GRACE};
pub use cron::CronSpec;
pub use scheduler::{
    RunDraft, RunNowOutcome, RunNowRequest, SchedulerEngine, TickReport, Watchdog,
    DEFAULT_TICK_INTERVAL,
};
pub use store::{RunQuery, SchedulerStore, SqliteSchedulerStore};
pub use types::{
    AuthError, ChatError, CronError, Field, Run, RunId, RunPatch, RunStatus, Schedule,
    ScheduleId, ScheduleKind, SchedulePatch, SchedulerError, StoreError, Violation, Violations,
    Visibility, CONVERSATION_KIND_SCHEDULED, DEFAULT_RUN_TIMEOUT,
};
