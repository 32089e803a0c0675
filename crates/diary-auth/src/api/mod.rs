//! Wire plumbing for the provider's undocumented multi-step exchange.
//!
//! Paths and payload shapes in here mirror what the live provider actually
//! serves and are pinned by the integration tests, not by any published
//! contract. The login/verify/refresh steps go through the TLS-impersonating
//! [`EvasionTransport`]; the ordinary provider API (session-token exchange,
//! profile, family) goes through the plain [`ProviderApi`] client.

pub(crate) mod request;
pub(crate) mod response;

use std::time::Duration;

use diary_core::{AuthError, ClientSettings, Dependent, LoginSession, NetworkError};
use serde::{de::DeserializeOwned, Serialize};

use response::{extract_session_token, parse_provider_response, FamilyResponse, ProfileResponse};

/// OAuth client registration, first step of the exchange.
pub(crate) const OAUTH_REGISTER_PATH: &str = "/sps/oauth/register";
/// Password step.
pub(crate) const OAUTH_LOGIN_PATH: &str = "/sps/login";
/// One-time-code verification step.
pub(crate) const OAUTH_VERIFY_PATH: &str = "/sps/login/verify";
/// Code-for-token and refresh-token exchange.
pub(crate) const OAUTH_TOKEN_PATH: &str = "/sps/oauth/te";
/// The provider's own session-token exchange, served by the school host.
pub(crate) const SESSION_TOKEN_PATH: &str = "/v3/auth/sudir/auth";
/// Profile of the authenticated account.
pub(crate) const PROFILE_PATH: &str = "/api/family/mobile/v1/profile";
/// Dependent profiles attached to the account.
pub(crate) const FAMILY_PATH: &str = "/api/family/mobile/v1/family";

/// Budget for one ordinary provider API call.
const API_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP transport for the login exchange, impersonating a real browser's TLS
/// handshake so the provider's network-layer bot detection does not cut the
/// connection. Built fresh for every attempt: state a failed attempt may have
/// poisoned (cookies, connections the remote flagged) is never reused.
pub(crate) struct EvasionTransport {
    client: rquest::Client,
    base_url: String,
}

impl EvasionTransport {
    /// Build a transport against the auth host from `settings`.
    pub(crate) fn build(settings: &ClientSettings) -> Result<Self, NetworkError> {
        let mut headers = rquest::header::HeaderMap::new();
        headers.insert(
            "x-mes-subsystem",
            rquest::header::HeaderValue::from_static("familymp"),
        );
        headers.insert(
            "client-type",
            rquest::header::HeaderValue::from_static("diary-mobile"),
        );

        let client = rquest::Client::builder()
            .impersonate(rquest::Impersonate::Chrome131)
            .cookie_store(true)
            .default_headers(headers)
            .build()
            .map_err(|err| NetworkError::Internal {
                message: err.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: settings.auth_url.trim_end_matches('/').to_string(),
        })
    }

    /// POST a url-encoded body and parse the provider's answer.
    pub(crate) async fn post_form<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, AuthError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(
                rquest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded; charset=utf-8",
            )
            .header(rquest::header::ACCEPT, "application/json")
            .body(serde_qs::to_string(body).expect("Serialize should be infallible"))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_transport_error)?;
        parse_provider_response(status, &text)
    }
}

fn map_transport_error(err: rquest::Error) -> AuthError {
    if err.is_timeout() {
        NetworkError::Timeout.into()
    } else {
        NetworkError::Transport {
            message: err.to_string(),
        }
        .into()
    }
}

fn map_api_error(err: reqwest::Error) -> AuthError {
    if err.is_timeout() {
        NetworkError::Timeout.into()
    } else {
        NetworkError::Transport {
            message: err.to_string(),
        }
        .into()
    }
}

/// Tokens and identifiers gathered during a login, everything finalization
/// needs to mint a [`LoginSession`].
#[derive(Debug, Default, Clone)]
pub(crate) struct SessionMaterial {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// The provider session token, when something already obtained it.
    pub session_token: Option<String>,
}

/// Plain client for the provider API on the school host. These calls carry a
/// session token and are not subject to the login-path bot detection.
pub(crate) struct ProviderApi {
    client: reqwest::Client,
    base_url: String,
}

impl ProviderApi {
    /// Build an API client against the school host from `settings`.
    pub(crate) fn build(settings: &ClientSettings) -> Result<Self, NetworkError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "x-mes-subsystem",
            reqwest::header::HeaderValue::from_static("familymp"),
        );
        headers.insert(
            "client-type",
            reqwest::header::HeaderValue::from_static("diary-mobile"),
        );

        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|err| NetworkError::Internal {
                message: err.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: settings.entry_url.trim_end_matches('/').to_string(),
        })
    }

    /// Exchange an OAuth access token for the provider session token.
    pub(crate) async fn exchange_session_token(
        &self,
        access_token: &str,
    ) -> Result<String, AuthError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, SESSION_TOKEN_PATH))
            .bearer_auth(access_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(map_api_error)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_api_error)?;
        let body: serde_json::Value = parse_provider_response(status, &text)?;

        extract_session_token(&body).ok_or_else(|| {
            let fields: Vec<&String> = body.as_object().map(|o| o.keys().collect()).unwrap_or_default();
            tracing::error!(?fields, "unknown session token response shape");
            NetworkError::UnexpectedResponse {
                message: format!("unknown session token response shape, fields: {fields:?}"),
            }
            .into()
        })
    }

    /// Fetch the profile of the authenticated account.
    pub(crate) async fn fetch_profile(
        &self,
        session_token: &str,
    ) -> Result<response::ProfileModel, AuthError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, PROFILE_PATH))
            .bearer_auth(session_token)
            .send()
            .await
            .map_err(map_api_error)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_api_error)?;
        let profile: ProfileResponse = parse_provider_response(status, &text)?;

        profile
            .profile
            .into_iter()
            .next()
            .ok_or_else(|| diary_core::AuthenticationError::ProfileNotFound.into())
    }

    /// Fetch the dependent profiles attached to an account.
    pub(crate) async fn fetch_dependents(
        &self,
        session_token: &str,
        profile_id: i64,
    ) -> Result<Vec<Dependent>, AuthError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, FAMILY_PATH))
            .query(&[("profile_id", profile_id)])
            .bearer_auth(session_token)
            .send()
            .await
            .map_err(map_api_error)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_api_error)?;
        let family: FamilyResponse = parse_provider_response(status, &text)?;

        Ok(family
            .children
            .into_iter()
            .map(|child| Dependent {
                id: child.id,
                name: format!("{} {}", child.last_name, child.first_name),
            })
            .collect())
    }

    /// Complete a login from whatever material the exchange produced: obtain
    /// the session token (directly if it was captured, via one more exchange
    /// otherwise), then attach profile and dependents.
    pub(crate) async fn finalize(
        &self,
        material: SessionMaterial,
    ) -> Result<LoginSession, AuthError> {
        let session_token = match material.session_token {
            Some(session_token) => session_token,
            None => {
                let access_token = material.access_token.as_deref().ok_or_else(|| {
                    AuthError::from(NetworkError::UnexpectedResponse {
                        message: "no access token was captured during the login".into(),
                    })
                })?;
                tracing::debug!("session token not captured, exchanging directly");
                self.exchange_session_token(access_token).await?
            }
        };

        let profile = self.fetch_profile(&session_token).await?;
        let dependents = self.fetch_dependents(&session_token, profile.id).await?;

        Ok(LoginSession {
            access_token: session_token,
            refresh_token: material.refresh_token,
            client_id: material.client_id,
            client_secret: material.client_secret,
            profile_id: profile.id,
            role: profile.role,
            dependents,
        })
    }
}
