//! HTTP login strategy. Speaks the provider exchange directly, hiding behind
//! a browser-grade TLS fingerprint so the network-layer bot detection lets
//! the connection through.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use diary_core::{
    probe, tokens::{RefreshedTokens, TokenRefresher}, AuthError, AuthenticationError,
    ClientSettings, LoginSession, NetworkError, PendingLogin, RetryObserver,
};

use crate::{
    api::{
        request::{
            ExchangeCodeRequest, PasswordLoginRequest, RegisterClientRequest, RenewTokenRequest,
            SmsVerifyRequest,
        },
        response::{LoginStep, RegisterClientResponse},
        EvasionTransport, ProviderApi, SessionMaterial,
    },
    strategy::{LoginStrategy, StartLoginOutcome, StrategyError},
};

/// Login strategy that runs the raw multi-step exchange over an
/// impersonated-TLS HTTP client.
pub struct FingerprintEvasionClient {
    settings: Arc<ClientSettings>,
    api: Arc<ProviderApi>,
}

impl FingerprintEvasionClient {
    /// Build the strategy against the configured provider.
    pub fn new(settings: Arc<ClientSettings>) -> Result<Self, NetworkError> {
        let api = Arc::new(ProviderApi::build(&settings)?);
        Ok(Self { settings, api })
    }

    /// Host and port the reachability probe checks, derived from the auth
    /// base URL.
    fn probe_target(&self) -> (String, u16) {
        match url::Url::parse(&self.settings.auth_url) {
            Ok(parsed) => {
                let host = parsed
                    .host_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| self.settings.auth_url.clone());
                let port = parsed.port_or_known_default().unwrap_or(443);
                (host, port)
            }
            Err(_) => (self.settings.auth_url.clone(), 443),
        }
    }

    /// One full password-step attempt on a fresh transport. The transport is
    /// returned so a parked SMS step can continue on the same session
    /// cookies.
    async fn login_attempt(
        &self,
        login: &str,
        password: &str,
    ) -> Result<(EvasionTransport, RegisterClientResponse, LoginStep), AuthError> {
        let transport = EvasionTransport::build(&self.settings)?;
        let registration = RegisterClientRequest::new().send(&transport).await?;
        let step = PasswordLoginRequest::new(login, password, &registration.client_id)
            .send(&transport)
            .await?;
        Ok((transport, registration, step))
    }
}

#[async_trait]
impl LoginStrategy for FingerprintEvasionClient {
    fn name(&self) -> &'static str {
        "fingerprint-evasion"
    }

    #[tracing::instrument(skip_all)]
    async fn start_login(
        &self,
        login: &str,
        password: &str,
        observer: Option<Arc<dyn RetryObserver>>,
    ) -> Result<StartLoginOutcome, StrategyError> {
        // Fail in seconds when the provider is down instead of burning the
        // full login budget. A failed probe is never retried.
        let (host, port) = self.probe_target();
        if !probe::is_reachable(&host, port, self.settings.probe_timeout).await {
            return Err(NetworkError::Unreachable { host }.into());
        }

        let total_attempts = 1 + self.settings.login_retry_limit;
        let mut attempt = 1;
        let (transport, registration, step) = loop {
            let outcome = tokio::time::timeout(
                self.settings.login_timeout,
                self.login_attempt(login, password),
            )
            .await;

            // A failed attempt drops its transport here; the next attempt
            // starts on a session the remote has never seen.
            let err = match outcome {
                Ok(Ok(parts)) => break parts,
                Ok(Err(err)) => err,
                Err(_) => NetworkError::Timeout.into(),
            };

            if attempt < total_attempts && is_transient(&err) {
                attempt += 1;
                tracing::warn!(%err, attempt, total_attempts, "login attempt failed, retrying");
                if let Some(observer) = &observer {
                    observer.on_retry(attempt, total_attempts).await;
                }
                continue;
            }
            return Err(err.into());
        };

        match step {
            LoginStep::Authorized { code } => {
                let tokens =
                    ExchangeCodeRequest::new(&code, &registration.client_id, &registration.client_secret)
                        .send(&transport)
                        .await
                        .map_err(StrategyError::from)?;
                let session = self
                    .api
                    .finalize(SessionMaterial {
                        access_token: Some(tokens.access_token),
                        refresh_token: tokens.refresh_token,
                        client_id: Some(registration.client_id),
                        client_secret: Some(registration.client_secret),
                        session_token: None,
                    })
                    .await
                    .map_err(StrategyError::from)?;
                tracing::info!("login completed without a code step");
                Ok(StartLoginOutcome::Authenticated(session))
            }
            LoginStep::SmsRequired { contact, ttl_seconds } => {
                tracing::info!("provider requires a one-time code");
                Ok(StartLoginOutcome::SmsRequired {
                    masked_contact: contact,
                    code_ttl: Duration::from_secs(ttl_seconds),
                    continuation: Box::new(EvasionPendingLogin {
                        transport: Some(transport),
                        client_id: registration.client_id,
                        client_secret: registration.client_secret,
                        api: Arc::clone(&self.api),
                        verify_timeout: self.settings.verify_timeout,
                    }),
                })
            }
        }
    }
}

#[async_trait]
impl TokenRefresher for FingerprintEvasionClient {
    async fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<RefreshedTokens, AuthError> {
        // Each refresh runs on its own transport; there is no session state
        // worth carrying over from previous exchanges.
        let transport = EvasionTransport::build(&self.settings)?;
        let tokens = RenewTokenRequest::new(refresh_token, client_id, client_secret)
            .send(&transport)
            .await?;
        let session_token = self.api.exchange_session_token(&tokens.access_token).await?;
        Ok(RefreshedTokens {
            access_token: session_token,
            refresh_token: tokens.refresh_token,
        })
    }
}

fn is_transient(err: &AuthError) -> bool {
    matches!(
        err,
        AuthError::Network(NetworkError::Timeout | NetworkError::Transport { .. })
    )
}

/// A password step that ended in an SMS challenge, parked on the transport
/// whose cookies hold the provider-side login state.
struct EvasionPendingLogin {
    transport: Option<EvasionTransport>,
    client_id: String,
    client_secret: String,
    api: Arc<ProviderApi>,
    verify_timeout: Duration,
}

#[async_trait]
impl PendingLogin for EvasionPendingLogin {
    #[tracing::instrument(skip_all)]
    async fn verify_code(&mut self, code: &str) -> Result<LoginSession, AuthError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(AuthenticationError::SessionExpired)?;

        // No automatic retry here: a rejected code is the user's to fix, and
        // resubmitting one the provider already consumed only burns attempts.
        let exchange = async {
            let step = SmsVerifyRequest::new(code).send(transport).await?;
            let auth_code = match step {
                LoginStep::Authorized { code } => code,
                LoginStep::SmsRequired { .. } => {
                    return Err(NetworkError::UnexpectedResponse {
                        message: "the provider answered the code with another challenge".into(),
                    }
                    .into())
                }
            };
            let tokens = ExchangeCodeRequest::new(&auth_code, &self.client_id, &self.client_secret)
                .send(transport)
                .await?;
            self.api
                .finalize(SessionMaterial {
                    access_token: Some(tokens.access_token),
                    refresh_token: tokens.refresh_token,
                    client_id: Some(self.client_id.clone()),
                    client_secret: Some(self.client_secret.clone()),
                    session_token: None,
                })
                .await
        };

        match tokio::time::timeout(self.verify_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout.into()),
        }
    }

    async fn cancel(&mut self) {
        // Dropping the transport closes its connections and forgets the
        // session cookies.
        self.transport = None;
    }

    fn strategy(&self) -> &'static str {
        "fingerprint-evasion"
    }
}
