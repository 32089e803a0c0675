//! Process-scoped registry of logins parked between the password step and
//! the one-time-code step.
//!
//! Lifecycle: [`PendingSessionStore::park`] creates (or replaces) the entry
//! for a user, [`PendingSessionStore::lookup`] hands out a handle for the
//! verification step, and [`PendingSessionStore::evict`] removes the entry
//! once its outcome is final. Entries only live in memory: after a process
//! restart every in-flight login is gone and the user starts over.

use std::{collections::HashMap, sync::Arc, sync::Mutex, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::{login::PendingLogin, AuthError, LoginSession, UserId};

type SharedContinuation = Arc<AsyncMutex<Box<dyn PendingLogin>>>;

struct PendingEntry {
    id: Uuid,
    created_at: DateTime<Utc>,
    masked_contact: String,
    code_ttl: Duration,
    continuation: SharedContinuation,
}

/// Registry of at most one pending login per user.
#[derive(Default)]
pub struct PendingSessionStore {
    sessions: Mutex<HashMap<UserId, PendingEntry>>,
}

impl PendingSessionStore {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a login that is waiting on a one-time code. Any previous pending
    /// login for the same user is replaced and its resources torn down — a
    /// fresh `start_login` always supersedes, never merges.
    ///
    /// Returns the id of the new entry, used to guard later eviction.
    pub async fn park(
        &self,
        user_id: UserId,
        masked_contact: String,
        code_ttl: Duration,
        continuation: Box<dyn PendingLogin>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let entry = PendingEntry {
            id,
            created_at: Utc::now(),
            masked_contact,
            code_ttl,
            continuation: Arc::new(AsyncMutex::new(continuation)),
        };

        let replaced = {
            let mut sessions = self.sessions.lock().expect("Mutex is not poisoned");
            sessions.insert(user_id, entry)
        };

        if let Some(old) = replaced {
            tracing::debug!(%user_id, "superseding a pending login");
            old.continuation.lock().await.cancel().await;
        }

        id
    }

    /// Look up the pending login for a user, if any.
    pub fn lookup(&self, user_id: UserId) -> Option<PendingSessionHandle> {
        let sessions = self.sessions.lock().expect("Mutex is not poisoned");
        sessions.get(&user_id).map(|entry| PendingSessionHandle {
            user_id,
            id: entry.id,
            created_at: entry.created_at,
            masked_contact: entry.masked_contact.clone(),
            code_ttl: entry.code_ttl,
            continuation: Arc::clone(&entry.continuation),
        })
    }

    /// Remove the entry for a user, but only if it is still the session
    /// identified by `session_id`. A login that was superseded while its
    /// outcome was in flight must not evict its successor.
    pub fn evict(&self, user_id: UserId, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.lock().expect("Mutex is not poisoned");
        match sessions.get(&user_id) {
            Some(entry) if entry.id == session_id => {
                sessions.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Explicitly cancel the pending login for a user, tearing down its
    /// resources. Returns whether anything was pending.
    pub async fn cancel(&self, user_id: UserId) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock().expect("Mutex is not poisoned");
            sessions.remove(&user_id)
        };

        match removed {
            Some(entry) => {
                entry.continuation.lock().await.cancel().await;
                true
            }
            None => false,
        }
    }
}

/// Snapshot handle to a parked login. Holds the continuation behind its own
/// lock so verification does not block the registry itself.
pub struct PendingSessionHandle {
    user_id: UserId,
    id: Uuid,
    created_at: DateTime<Utc>,
    masked_contact: String,
    code_ttl: Duration,
    continuation: SharedContinuation,
}

impl PendingSessionHandle {
    /// Id of the underlying entry, for guarded eviction.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// User this login belongs to.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// When the login was parked.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Masked phone number the code was sent to.
    pub fn masked_contact(&self) -> &str {
        &self.masked_contact
    }

    /// How long the code stays valid.
    pub fn code_ttl(&self) -> Duration {
        self.code_ttl
    }

    /// Name of the strategy that parked this login.
    pub async fn strategy(&self) -> &'static str {
        self.continuation.lock().await.strategy()
    }

    /// Submit the one-time code to the parked continuation. Concurrent
    /// submissions for the same user serialize on the continuation lock.
    pub async fn verify(&self, code: &str) -> Result<LoginSession, AuthError> {
        self.continuation.lock().await.verify_code(code).await
    }

    /// Tear down the parked continuation's resources.
    pub async fn shutdown(&self) {
        self.continuation.lock().await.cancel().await;
    }
}
