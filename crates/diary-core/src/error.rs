//! Errors that can occur when using this SDK.
//!
//! Every failure a login strategy or the token lifecycle manager can produce
//! is classified into exactly one of two kinds before it crosses a crate
//! boundary: [`AuthenticationError`] (the end user has to act) or
//! [`NetworkError`] (transient, worth retrying later). Transport-library
//! error types are wrapped here and never leak to callers.

use thiserror::Error;

/// The end user's credentials or one-time code are not (or no longer)
/// acceptable to the provider. These are never retried automatically; the
/// message tells the user what to do next.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    /// Login or password rejected by the provider.
    #[error("invalid login or password")]
    BadCredentials,
    /// The provider temporarily locked the account after too many attempts.
    #[error("the account is temporarily locked, try again later")]
    AccountLocked,
    /// The one-time code was rejected. The pending login stays usable, the
    /// user can re-enter a corrected code.
    #[error("the one-time code is not valid, enter it again")]
    BadCode,
    /// The one-time code expired or the attempt budget ran out. The pending
    /// login is discarded, registration has to start over.
    #[error("the one-time code expired, restart the registration")]
    SessionExpired,
    /// A code was submitted but no login is waiting for one.
    #[error("no login is awaiting a code, restart the registration")]
    NoPendingSession,
    /// The stored session can no longer be refreshed silently.
    #[error("the session has expired, please log in again")]
    MustRelogin,
    /// The provider accepted the credentials but returned no profile.
    #[error("no profile is attached to this account")]
    ProfileNotFound,
    /// No credential record exists for this user.
    #[error("the user is not registered")]
    NotRegistered,
}

/// The provider could not be reached or answered with something unusable.
/// Retried automatically only at the login step, within a bounded budget.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The reachability probe failed before any request was issued.
    #[error("the server {host} is unreachable, try again later")]
    Unreachable {
        /// Host that failed the probe.
        host: String,
    },
    /// A request ran past its upper bound.
    #[error("the server did not answer in time, try again later")]
    Timeout,
    /// The transport failed below the HTTP layer.
    #[error("connection failure: {message}")]
    Transport {
        /// Human-readable transport failure, with library specifics stripped.
        message: String,
    },
    /// The server answered with an error status.
    #[error("the server returned an error: [{status}] {message}")]
    ResponseContent {
        /// HTTP status code.
        status: u16,
        /// Body excerpt or provider message.
        message: String,
    },
    /// The response parsed, but not into any shape this SDK knows.
    #[error("unexpected response from the server: {message}")]
    UnexpectedResponse {
        /// What was missing or malformed.
        message: String,
    },
    /// The code was submitted but the provider never issued a token within
    /// the wait budget. The same code may still be accepted on a retry.
    #[error("the server did not issue a token after the code was entered, try submitting the same code again")]
    TokenWaitTimeout,
    /// The login page rendered, but without the fields the flow needs.
    #[error("the login page is missing expected fields: {message}")]
    PageStructure {
        /// Which field or step was missing.
        message: String,
    },
    /// A failure that is neither the user's fault nor clearly transport.
    #[error("internal failure: {message}")]
    Internal {
        /// Wrapped cause.
        message: String,
    },
}

/// Umbrella error for the operations exposed to the bot layer.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Missing required field.
#[derive(Debug, Error)]
#[error("The response received was missing a required field: {0}")]
pub struct MissingFieldError(pub &'static str);

/// This macro is used to require that a value is present or return an error
/// otherwise. It is equivalent to using `val.ok_or(Error::MissingFields)?`,
/// but easier to use and with a more descriptive error message.
/// Note that this macro will return early from the function if the value is
/// not present.
#[macro_export]
macro_rules! require {
    ($val:expr) => {
        match $val {
            Some(val) => val,
            None => return Err($crate::MissingFieldError(stringify!($val)).into()),
        }
    };
}

impl From<MissingFieldError> for AuthError {
    fn from(e: MissingFieldError) -> Self {
        AuthError::Network(NetworkError::UnexpectedResponse {
            message: e.to_string(),
        })
    }
}

impl AuthError {
    /// Whether the failure should be surfaced to the user as actionable
    /// (`true`) or as a transient "try again" (`false`).
    pub fn is_authentication(&self) -> bool {
        matches!(self, AuthError::Authentication(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_becomes_network_error() {
        fn parse() -> Result<String, AuthError> {
            let value: Option<String> = None;
            Ok(require!(value))
        }

        let err = parse().unwrap_err();
        assert!(matches!(
            err,
            AuthError::Network(NetworkError::UnexpectedResponse { .. })
        ));
        assert!(err.to_string().contains("value"));
    }

    #[test]
    fn classification_is_visible_to_callers() {
        assert!(AuthError::from(AuthenticationError::BadCode).is_authentication());
        assert!(!AuthError::from(NetworkError::Timeout).is_authentication());
    }
}
