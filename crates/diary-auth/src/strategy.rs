//! The seam between the orchestrator and the two login implementations.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use diary_core::{
    AuthError, AuthenticationError, LoginSession, NetworkError, PendingLogin, RetryObserver,
};
use thiserror::Error;

/// What a strategy's `start_login` produced.
pub enum StartLoginOutcome {
    /// The login completed without a code step.
    Authenticated(LoginSession),
    /// The provider wants a one-time code; the continuation carries whatever
    /// the strategy needs to finish the exchange later.
    SmsRequired {
        /// Masked phone number the code was sent to.
        masked_contact: String,
        /// Code validity window.
        code_ttl: Duration,
        /// Strategy-specific state for the verification step.
        continuation: Box<dyn PendingLogin>,
    },
}

/// Failure of a single strategy attempt. The discriminants are exactly the
/// branches the orchestrator has to handle, so the `match` over them stays
/// exhaustive when a new one appears.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// The login page never rendered its form — the provider or the network
    /// broke, not the credentials. The orchestrator treats this as the
    /// trigger to retry the whole attempt on the other strategy.
    #[error("the login page did not load: {0}")]
    PageNotLoaded(String),
    /// The strategy's runtime dependency is missing on this host.
    #[error("strategy unavailable: {0}")]
    Unavailable(&'static str),
    /// The provider rejected the user. Final; never worth another transport.
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    /// The provider could not be reached or answered garbage.
    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl From<AuthError> for StrategyError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Authentication(e) => StrategyError::Authentication(e),
            AuthError::Network(e) => StrategyError::Network(e),
        }
    }
}

impl From<StrategyError> for AuthError {
    fn from(err: StrategyError) -> Self {
        match err {
            StrategyError::Authentication(e) => AuthError::Authentication(e),
            StrategyError::Network(e) => AuthError::Network(e),
            StrategyError::PageNotLoaded(reason) => {
                AuthError::Network(NetworkError::PageStructure { message: reason })
            }
            StrategyError::Unavailable(what) => AuthError::Network(NetworkError::Internal {
                message: format!("strategy unavailable: {what}"),
            }),
        }
    }
}

/// One way of getting a user through the provider's login.
#[async_trait]
pub trait LoginStrategy: Send + Sync {
    /// Short name, for logging and routing diagnostics.
    fn name(&self) -> &'static str;

    /// Run the password step. Transient transport failures may be retried
    /// internally within the strategy's budget; `observer` is told before
    /// each extra attempt.
    async fn start_login(
        &self,
        login: &str,
        password: &str,
        observer: Option<Arc<dyn RetryObserver>>,
    ) -> Result<StartLoginOutcome, StrategyError>;
}
