//! Error taxonomy for the scheduler.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::{RunId, ScheduleId};

/// Cron expression parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),

    #[error("{field}: empty token")]
    EmptyToken { field: &'static str },

    #[error("{field}: invalid token {token:?}")]
    InvalidToken { field: &'static str, token: String },

    #[error("{field}: value {value} out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u8,
        max: u8,
    },

    #[error("{field}: step must be a positive integer applied to `*` or a range")]
    InvalidStep { field: &'static str },

    #[error("{field}: expression expands to no values")]
    EmptySet { field: &'static str },
}

/// A single validation failure reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Ordered list of violations; `Display` renders the first one, which is
/// what callers surface as the operation's error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violations(pub Vec<Violation>);

impl Violations {
    pub fn first(&self) -> Option<&Violation> {
        self.0.first()
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.first() {
            Some(v) => write!(f, "{v}"),
            None => write!(f, "validation failed"),
        }
    }
}

/// Errors produced by the scheduler store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(ScheduleId),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("{0}")]
    Validation(Violations),
}

/// Errors surfaced by the chat collaborator.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("conversation backend error: {0}")]
    Backend(String),

    #[error("conversation create returned an empty id")]
    EmptyConversationId,

    #[error("conversation call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from the out-of-band auth flow.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("out-of-band auth requires BFF auth mode")]
    NotBff,

    #[error("out-of-band auth requires an OAuth client config URL")]
    MissingConfigUrl,

    #[error("no out-of-band authorizer is configured")]
    NoAuthorizer,

    #[error("failed to load user secret or client config: {0}")]
    CredentialLoad(String),

    #[error("authorizer error: {0}")]
    Authorizer(String),

    #[error("authorizer returned an empty token")]
    EmptyToken,

    #[error("out-of-band auth timed out after {0:?}")]
    Timeout(Duration),
}

/// Umbrella error for scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("cron error: {0}")]
    Cron(#[from] CronError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chat error: {0}")]
    Chat(#[from] ChatError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(ScheduleId),

    #[error("run is missing a schedule id")]
    MissingScheduleId,
}
