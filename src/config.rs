//! Process-wide scheduler configuration.
//!
//! Everything here is env-driven and resolved once at startup:
//!
//! - `AGENTLY_SCHEDULER_LEASE_TTL` — lease duration, e.g. `45s`, `2m`.
//! - `AGENTLY_SCHEDULER_LEASE_OWNER` — override the lease owner identity.
//! - `AGENTLY_SCHEDULER_DEBUG` — debug logging toggle (`1|true|yes|y|on`).

use std::env;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

pub const ENV_LEASE_TTL: &str = "AGENTLY_SCHEDULER_LEASE_TTL";
pub const ENV_LEASE_OWNER: &str = "AGENTLY_SCHEDULER_LEASE_OWNER";
pub const ENV_DEBUG: &str = "AGENTLY_SCHEDULER_DEBUG";

/// Default schedule/run lease duration.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Grace added on top of an expired lease before a run counts as stale.
pub const LEASE_GRACE: Duration = Duration::from_secs(15);

/// Lease identity and duration used by one scheduler instance.
///
/// The owner is not a secret; it only has to be unique per process so that
/// compare-and-swap claims can tell instances apart.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub owner: String,
}

impl LeaseConfig {
    /// Resolve from the process environment.
    pub fn from_env() -> Self {
        Self::resolve(
            env::var(ENV_LEASE_TTL).ok().as_deref(),
            env::var(ENV_LEASE_OWNER).ok().as_deref(),
        )
    }

    /// Resolution logic, separated from env access for testability.
    fn resolve(ttl: Option<&str>, owner: Option<&str>) -> Self {
        let ttl = match ttl.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => match humantime::parse_duration(raw) {
                Ok(d) if !d.is_zero() => d,
                Ok(_) => DEFAULT_LEASE_TTL,
                Err(err) => {
                    tracing::warn!(%raw, %err, "invalid {ENV_LEASE_TTL}, using default");
                    DEFAULT_LEASE_TTL
                }
            },
            None => DEFAULT_LEASE_TTL,
        };
        let owner = match owner.map(str::trim).filter(|s| !s.is_empty()) {
            Some(o) => o.to_string(),
            None => default_owner(),
        };
        Self { ttl, owner }
    }

    /// Lease expiry for a claim made at `now`.
    pub fn until(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
        now + chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// `<hostname>:<pid>:<uuid>` — unique per process.
fn default_owner() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{host}:{}:{}", std::process::id(), uuid::Uuid::new_v4())
}

/// Whether `AGENTLY_SCHEDULER_DEBUG` asks for debug logging.
pub fn debug_enabled() -> bool {
    env::var(ENV_DEBUG).map(|v| is_truthy(&v)).unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Install a tracing subscriber for hosts that do not bring their own.
/// `RUST_LOG` wins; otherwise the debug toggle selects the default level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug_enabled() {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
