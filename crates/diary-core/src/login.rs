//! Login results and the continuation seam between a started login and its
//! code-verification step.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::AuthError;

/// A dependent profile (a child) attached to the authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependent {
    /// Provider id of the dependent profile.
    pub id: i64,
    /// Display name, as shown during child selection in the bot layer.
    pub name: String,
}

/// Everything a completed login hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginSession {
    /// Provider access token for downstream API calls.
    pub access_token: String,
    /// Refresh token for silent renewal, when the provider issued one.
    pub refresh_token: Option<String>,
    /// OAuth client id captured during the exchange.
    pub client_id: Option<String>,
    /// OAuth client secret captured during the exchange.
    pub client_secret: Option<String>,
    /// Profile id of the account owner.
    pub profile_id: i64,
    /// Role of the account owner (parent or student).
    pub role: String,
    /// Dependent profiles attached to the account.
    pub dependents: Vec<Dependent>,
}

/// Outcome of a started login.
#[derive(Debug, Clone)]
pub enum AuthResult {
    /// The provider sent a one-time code out-of-band; the login is parked
    /// until the user supplies it.
    SmsRequired {
        /// Masked phone number the code was sent to, for display only.
        masked_contact: String,
        /// How long the code stays valid.
        code_ttl: Duration,
    },
    /// The login completed without a code step.
    Authenticated(LoginSession),
}

/// Observer notified before each extra login attempt, so the bot layer can
/// tell the user the provider is slow instead of going silent.
#[async_trait]
pub trait RetryObserver: Send + Sync {
    /// Called with the upcoming attempt number and the total attempt budget.
    async fn on_retry(&self, attempt: u32, total: u32);
}

/// A login that passed the password step and is waiting on a one-time code.
/// Produced by whichever strategy ran the password step; the verification is
/// always routed back to the same continuation.
#[async_trait]
pub trait PendingLogin: Send + Sync {
    /// Submit the one-time code and complete the exchange.
    ///
    /// A [`crate::AuthenticationError::BadCode`] failure leaves the
    /// continuation usable for a corrected code; any other failure does not.
    async fn verify_code(&mut self, code: &str) -> Result<LoginSession, AuthError>;

    /// Tear down whatever the continuation holds open (an HTTP session, a
    /// browser). Best-effort and idempotent.
    async fn cancel(&mut self);

    /// Short strategy name, for logging.
    fn strategy(&self) -> &'static str;
}
