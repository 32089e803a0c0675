//! Request models for the provider exchange. Each knows its own path and
//! sends itself through the evasion transport.

use diary_core::AuthError;
use serde::Serialize;

use super::{
    response::{LoginStep, LoginStepResponse, RegisterClientResponse, TokenExchangeResponse},
    EvasionTransport, OAUTH_LOGIN_PATH, OAUTH_REGISTER_PATH, OAUTH_TOKEN_PATH, OAUTH_VERIFY_PATH,
};

/// Registers a fresh OAuth client, the first step of every login.
#[derive(Serialize, Debug)]
pub(crate) struct RegisterClientRequest {
    software_id: &'static str,
    device_type: &'static str,
}

impl RegisterClientRequest {
    pub(crate) fn new() -> Self {
        Self {
            software_id: "diary-mobile",
            device_type: "android",
        }
    }

    pub(crate) async fn send(
        &self,
        transport: &EvasionTransport,
    ) -> Result<RegisterClientResponse, AuthError> {
        transport.post_form(OAUTH_REGISTER_PATH, self).await
    }
}

/// Submits the user's credentials.
#[derive(Serialize, Debug)]
pub(crate) struct PasswordLoginRequest {
    login: String,
    password: String,
    client_id: String,
}

impl PasswordLoginRequest {
    pub(crate) fn new(login: &str, password: &str, client_id: &str) -> Self {
        Self {
            login: login.to_owned(),
            password: password.to_owned(),
            client_id: client_id.to_owned(),
        }
    }

    pub(crate) async fn send(&self, transport: &EvasionTransport) -> Result<LoginStep, AuthError> {
        let raw: LoginStepResponse = transport.post_form(OAUTH_LOGIN_PATH, self).await?;
        raw.try_into()
    }
}

/// Submits the one-time code for a parked login. The provider correlates the
/// step through the transport's session cookies, so this must go out on the
/// same transport that ran the password step.
#[derive(Serialize, Debug)]
pub(crate) struct SmsVerifyRequest {
    code: String,
}

impl SmsVerifyRequest {
    pub(crate) fn new(code: &str) -> Self {
        Self {
            code: code.to_owned(),
        }
    }

    pub(crate) async fn send(&self, transport: &EvasionTransport) -> Result<LoginStep, AuthError> {
        let raw: LoginStepResponse = transport.post_form(OAUTH_VERIFY_PATH, self).await?;
        raw.try_into()
    }
}

/// Exchanges an authorization code for the token pair.
#[derive(Serialize, Debug)]
pub(crate) struct ExchangeCodeRequest {
    grant_type: &'static str,
    code: String,
    client_id: String,
    client_secret: String,
}

impl ExchangeCodeRequest {
    pub(crate) fn new(code: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            grant_type: "authorization_code",
            code: code.to_owned(),
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
        }
    }

    pub(crate) async fn send(
        &self,
        transport: &EvasionTransport,
    ) -> Result<TokenExchangeResponse, AuthError> {
        transport.post_form(OAUTH_TOKEN_PATH, self).await
    }
}

/// Exchanges a refresh token for a new token pair.
#[derive(Serialize, Debug)]
pub(crate) struct RenewTokenRequest {
    grant_type: &'static str,
    refresh_token: String,
    client_id: String,
    client_secret: String,
}

impl RenewTokenRequest {
    pub(crate) fn new(refresh_token: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            grant_type: "refresh_token",
            refresh_token: refresh_token.to_owned(),
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
        }
    }

    pub(crate) async fn send(
        &self,
        transport: &EvasionTransport,
    ) -> Result<TokenExchangeResponse, AuthError> {
        transport.post_form(OAUTH_TOKEN_PATH, self).await
    }
}
