//! Response models for the provider exchange, and the mapping from its error
//! codes to the SDK error taxonomy.

use diary_core::{AuthError, AuthenticationError, NetworkError};
use serde::{de::DeserializeOwned, Deserialize};

/// How much of an unrecognized error body is carried into the error message.
const ERROR_EXCERPT_LEN: usize = 200;

/// OAuth client registration result.
#[derive(Deserialize, Debug)]
pub(crate) struct RegisterClientResponse {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Deserialize, Debug)]
struct RawSmsChallenge {
    contact: String,
    ttl: u64,
}

/// The password and verification steps answer with either a parked SMS
/// challenge or an authorization code, depending on whether the account has
/// the code step enabled and whether it was already passed.
#[derive(Deserialize, Debug)]
pub(crate) struct LoginStepResponse {
    sms_challenge: Option<RawSmsChallenge>,
    authorization_code: Option<String>,
}

/// Parsed outcome of a password or verification step.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LoginStep {
    /// The provider sent a one-time code to the user's phone.
    SmsRequired {
        /// Masked phone number, for display.
        contact: String,
        /// Code validity in seconds.
        ttl_seconds: u64,
    },
    /// The step passed; the code can be exchanged for tokens.
    Authorized {
        /// Authorization code for the token exchange.
        code: String,
    },
}

impl TryFrom<LoginStepResponse> for LoginStep {
    type Error = AuthError;

    fn try_from(raw: LoginStepResponse) -> Result<Self, AuthError> {
        if let Some(challenge) = raw.sms_challenge {
            return Ok(LoginStep::SmsRequired {
                contact: challenge.contact,
                ttl_seconds: challenge.ttl,
            });
        }
        if let Some(code) = raw.authorization_code {
            return Ok(LoginStep::Authorized { code });
        }
        Err(NetworkError::UnexpectedResponse {
            message: "login step carried neither a challenge nor a code".into(),
        }
        .into())
    }
}

/// Token exchange result, for both the code grant and the refresh grant.
#[derive(Deserialize, Debug)]
pub(crate) struct TokenExchangeResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Profile listing of the authenticated account.
#[derive(Deserialize, Debug)]
pub(crate) struct ProfileResponse {
    #[serde(default)]
    pub profile: Vec<ProfileModel>,
}

/// One profile entry.
#[derive(Deserialize, Debug)]
pub(crate) struct ProfileModel {
    pub id: i64,
    #[serde(rename = "type")]
    pub role: String,
}

/// Family listing of the authenticated account.
#[derive(Deserialize, Debug)]
pub(crate) struct FamilyResponse {
    #[serde(default)]
    pub children: Vec<ChildModel>,
}

/// One dependent profile entry.
#[derive(Deserialize, Debug)]
pub(crate) struct ChildModel {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Deserialize, Debug)]
struct ProviderErrorBody {
    error_code: String,
    message: Option<String>,
}

/// Parse a provider answer: deserialize the body on success, classify the
/// error code otherwise.
pub(crate) fn parse_provider_response<T: DeserializeOwned>(
    status: u16,
    text: &str,
) -> Result<T, AuthError> {
    if (200..300).contains(&status) {
        serde_json::from_str(text).map_err(|err| {
            NetworkError::UnexpectedResponse {
                message: err.to_string(),
            }
            .into()
        })
    } else {
        Err(classify_provider_error(status, text))
    }
}

/// Map a provider error body onto the SDK taxonomy. Codes the SDK does not
/// know — and bodies that are not the provider's error shape at all — come
/// back as network errors, never as authentication failures.
pub(crate) fn classify_provider_error(status: u16, body: &str) -> AuthError {
    match serde_json::from_str::<ProviderErrorBody>(body) {
        Ok(error) => match error.error_code.as_str() {
            "InvalidCredentials" | "NotFound" => AuthenticationError::BadCredentials.into(),
            "TemporarilyBlocked" => AuthenticationError::AccountLocked.into(),
            "InvalidOTP" => AuthenticationError::BadCode.into(),
            "CodeExpired" | "NoAttempts" => AuthenticationError::SessionExpired.into(),
            other => NetworkError::ResponseContent {
                status,
                message: error.message.unwrap_or_else(|| other.to_string()),
            }
            .into(),
        },
        Err(_) => NetworkError::ResponseContent {
            status,
            message: excerpt(body),
        }
        .into(),
    }
}

/// Pull the provider session token out of a session-token response,
/// tolerating the nested shape and the flat fallbacks the provider has been
/// seen to produce.
pub(crate) fn extract_session_token(body: &serde_json::Value) -> Option<String> {
    body.get("user_authentication_for_mobile_response")
        .and_then(|inner| inner.get("mesh_access_token"))
        .or_else(|| body.get("mesh_access_token"))
        .or_else(|| body.get("token"))
        .or_else(|| body.get("access_token"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}

fn excerpt(body: &str) -> String {
    body.chars().take(ERROR_EXCERPT_LEN).collect()
}
