use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an end user as known to the bot layer (the chat platform
/// user id). The SDK keys all per-user state — pending logins, refresh locks,
/// credential records — by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}
