//! Execution identity and out-of-band auth.
//!
//! Scheduled runs execute long after the request that created the schedule
//! has finished, so identity travels as plain values in an [`ExecContext`]
//! that deliberately carries no cancellation. When a schedule references
//! user credentials (`user_cred_url`), the run first performs an
//! out-of-band OAuth flow through an external authorizer and continues
//! under the obtained identity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::secrets::redact_credential_ref;
use crate::types::AuthError;

/// Upper bound on the whole out-of-band flow.
pub const OOB_LOGIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Auth deployment mode of the hosting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No auth backend; out-of-band login is unavailable.
    #[default]
    Disabled,
    /// Backend-for-frontend: the only mode that supports out-of-band login.
    Bff,
}

/// Auth configuration of the hosting process.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// OAuth client config location, required for out-of-band login.
    pub config_url: Option<String>,
}

/// Decoded identity of the user a run executes as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub subject: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Tokens and identity produced by a successful out-of-band flow.
#[derive(Debug, Clone)]
pub struct OobCredentials {
    pub bearer_token: String,
    pub id_token: Option<String>,
    pub user_info: Option<UserInfo>,
}

/// Value-only execution context propagated into background work.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    pub user_id: Option<String>,
    pub bearer_token: Option<String>,
    pub id_token: Option<String>,
    pub user_info: Option<UserInfo>,
}

impl ExecContext {
    /// The anonymous background identity.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// The identity this context acts as, with an optional fallback.
    pub fn effective_user(&self, fallback: Option<&str>) -> Option<String> {
        self.user_id
            .clone()
            .or_else(|| fallback.map(|s| s.to_string()))
    }

    fn with_credentials(mut self, creds: OobCredentials) -> Self {
        if let Some(info) = &creds.user_info {
            self.user_id = Some(info.subject.clone());
        }
        self.bearer_token = Some(creds.bearer_token);
        self.id_token = creds.id_token;
        self.user_info = creds.user_info;
        self
    }
}

/// External authorizer performing the OOB+PKCE flow: it resolves the OAuth
/// client config and the user secret behind `cred_url` and exchanges them
/// for tokens.
#[async_trait]
pub trait OobAuthorizer: Send + Sync {
    async fn authorize(&self, cred_url: &str) -> Result<OobCredentials, AuthError>;
}

/// Run the out-of-band flow and return a context carrying the obtained
/// identity. Every failure mode surfaces as the run's error.
pub async fn oob_login(
    authorizer: Option<&Arc<dyn OobAuthorizer>>,
    config: &AuthConfig,
    ctx: &ExecContext,
    cred_url: &str,
) -> Result<ExecContext, AuthError> {
    if config.mode != AuthMode::Bff {
        return Err(AuthError::NotBff);
    }
    if config.config_url.is_none() {
        return Err(AuthError::MissingConfigUrl);
    }
    let authorizer = authorizer.ok_or(AuthError::NoAuthorizer)?;

    tracing::debug!(
        cred = %redact_credential_ref(cred_url),
        "starting out-of-band login"
    );
    let creds = tokio::time::timeout(OOB_LOGIN_TIMEOUT, authorizer.authorize(cred_url))
        .await
        .map_err(|_| AuthError::Timeout(OOB_LOGIN_TIMEOUT))??;

    if creds.bearer_token.is_empty() {
        return Err(AuthError::EmptyToken);
    }
    Ok(ctx.clone().with_credentials(creds))
}
