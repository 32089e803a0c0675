//! Strategy selection, fallback and code routing for the login flow.

use std::sync::Arc;

use diary_core::{
    session::PendingSessionStore,
    tokens::{RefreshedTokens, TokenRefresher},
    AuthError, AuthResult, AuthenticationError, ClientSettings, NetworkError, RetryObserver,
    UserId,
};

use crate::{
    browser::AutomatedBrowserClient,
    evasion::FingerprintEvasionClient,
    strategy::{LoginStrategy, StartLoginOutcome, StrategyError},
};

/// The strategies this process can actually run, probed once at startup.
pub struct StrategyRegistry {
    primary: Arc<dyn LoginStrategy>,
    fallback: Option<Arc<dyn LoginStrategy>>,
}

impl StrategyRegistry {
    /// Register an explicit primary/fallback pair. Mostly useful for tests
    /// and unusual deployments; [`AuthOrchestrator::new`] probes and builds
    /// the standard pair.
    pub fn new(primary: Arc<dyn LoginStrategy>, fallback: Option<Arc<dyn LoginStrategy>>) -> Self {
        Self { primary, fallback }
    }
}

/// Entry point of the login subsystem: picks a strategy, runs it, falls back
/// when the login page refuses to load, and routes one-time codes back to
/// whichever strategy parked the login.
pub struct AuthOrchestrator {
    registry: StrategyRegistry,
    sessions: Arc<PendingSessionStore>,
    refresher: Arc<dyn TokenRefresher>,
}

impl AuthOrchestrator {
    /// Probe the host's capabilities once and build the standard setup: the
    /// browser strategy first when a Chromium is present, the HTTP strategy
    /// as fallback (or alone).
    pub fn new(settings: ClientSettings) -> Result<Self, NetworkError> {
        let settings = Arc::new(settings);
        let http = Arc::new(FingerprintEvasionClient::new(Arc::clone(&settings))?);

        let registry = if AutomatedBrowserClient::available() {
            tracing::info!("chromium found, browser strategy registered as primary");
            StrategyRegistry::new(
                Arc::new(AutomatedBrowserClient::new(Arc::clone(&settings))?),
                Some(Arc::clone(&http) as Arc<dyn LoginStrategy>),
            )
        } else {
            tracing::info!("no chromium on this host, HTTP strategy only");
            StrategyRegistry::new(Arc::clone(&http) as Arc<dyn LoginStrategy>, None)
        };

        Ok(Self {
            registry,
            sessions: Arc::new(PendingSessionStore::new()),
            refresher: http,
        })
    }

    /// Build an orchestrator over an explicit registry, session store and
    /// refresher.
    pub fn with_registry(
        registry: StrategyRegistry,
        sessions: Arc<PendingSessionStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            registry,
            sessions,
            refresher,
        }
    }

    /// The refresher downstream token management should use. Always the HTTP
    /// strategy: a refresh never needs a browser.
    pub fn refresher(&self) -> Arc<dyn TokenRefresher> {
        Arc::clone(&self.refresher)
    }

    /// The pending-session registry, for callers that want to inspect or
    /// cancel parked logins.
    pub fn sessions(&self) -> Arc<PendingSessionStore> {
        Arc::clone(&self.sessions)
    }

    /// Run the password step for a user. A still-pending login for the same
    /// user is superseded, never merged into.
    pub async fn start_login(
        &self,
        user_id: UserId,
        login: &str,
        password: &str,
        observer: Option<Arc<dyn RetryObserver>>,
    ) -> Result<AuthResult, AuthError> {
        self.sessions.cancel(user_id).await;

        let primary = &self.registry.primary;
        let outcome = match primary
            .start_login(login, password, observer.clone())
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                let fallback = match (&err, &self.registry.fallback) {
                    // The page failing to load says nothing about the
                    // credentials; the HTTP path gets to try the same
                    // attempt from scratch.
                    (StrategyError::PageNotLoaded(reason), Some(fallback)) => {
                        tracing::warn!(
                            %user_id,
                            %reason,
                            strategy = primary.name(),
                            "login page did not load, falling back"
                        );
                        Arc::clone(fallback)
                    }
                    (StrategyError::Unavailable(what), Some(fallback)) => {
                        tracing::warn!(%user_id, what = *what, "strategy unavailable, falling back");
                        Arc::clone(fallback)
                    }
                    // Anything else — rejected credentials, a locked
                    // account, a dead network — would only repeat itself on
                    // another transport.
                    _ => return Err(err.into()),
                };
                fallback
                    .start_login(login, password, observer)
                    .await
                    .map_err(AuthError::from)?
            }
        };

        match outcome {
            StartLoginOutcome::Authenticated(session) => Ok(AuthResult::Authenticated(session)),
            StartLoginOutcome::SmsRequired {
                masked_contact,
                code_ttl,
                continuation,
            } => {
                self.sessions
                    .park(user_id, masked_contact.clone(), code_ttl, continuation)
                    .await;
                Ok(AuthResult::SmsRequired {
                    masked_contact,
                    code_ttl,
                })
            }
        }
    }

    /// Submit the one-time code for a user's parked login.
    pub async fn verify_sms(&self, user_id: UserId, code: &str) -> Result<AuthResult, AuthError> {
        let handle = self
            .sessions
            .lookup(user_id)
            .ok_or(AuthenticationError::NoPendingSession)?;

        let strategy = handle.strategy().await;
        tracing::debug!(%user_id, strategy, "routing code to the strategy that parked the login");

        match handle.verify(code).await {
            Ok(session) => {
                self.sessions.evict(user_id, handle.id());
                Ok(AuthResult::Authenticated(session))
            }
            // A rejected code leaves the session parked for a corrected one.
            Err(err @ AuthError::Authentication(AuthenticationError::BadCode)) => Err(err),
            // Every other provider rejection is final for this login.
            Err(err @ AuthError::Authentication(_)) => {
                if self.sessions.evict(user_id, handle.id()) {
                    handle.shutdown().await;
                }
                Err(err)
            }
            // Transient failure: the session (and the code) stay usable.
            Err(err) => Err(err),
        }
    }

    /// Drop a user's parked login, tearing down whatever it held open.
    pub async fn cancel_login(&self, user_id: UserId) -> bool {
        self.sessions.cancel(user_id).await
    }

    /// Silent refresh, always over HTTP.
    pub async fn refresh_token(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<RefreshedTokens, AuthError> {
        self.refresher
            .refresh(refresh_token, client_id, client_secret)
            .await
    }
}
