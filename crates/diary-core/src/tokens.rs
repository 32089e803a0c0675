//! Per-user access-token lifecycle: validity checking, silent refresh and
//! persistence, with concurrent callers for the same user serialized through
//! a per-user lock.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    credentials::CredentialStore, AuthError, AuthenticationError, ClientSettings, UserId,
};

/// A token is treated as expired this many seconds before its stored expiry,
/// so a request started right at the boundary still carries a live token.
pub const TOKEN_EXPIRY_MARGIN_SECONDS: i64 = 5 * 60;

/// Tokens returned by a successful silent refresh.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    /// The new access token.
    pub access_token: String,
    /// The rotated refresh token, when the provider rotated it.
    pub refresh_token: Option<String>,
}

/// Exchanges a refresh token for a new access token. Implemented by the HTTP
/// login strategy; a refresh never needs a browser or an SMS step.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Perform the refresh exchange.
    async fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<RefreshedTokens, AuthError>;
}

/// Validates, refreshes and persists the long-lived session token per user.
pub struct TokenLifecycleManager {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    token_lifetime: Duration,
    locks: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl TokenLifecycleManager {
    /// Create a manager over a credential store and a refresher.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        settings: &ClientSettings,
    ) -> Self {
        let token_lifetime = Duration::from_std(settings.token_lifetime)
            .unwrap_or_else(|_| Duration::hours(24));
        Self {
            store,
            refresher,
            token_lifetime,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return a usable access token for `user_id`, refreshing it silently if
    /// the stored one is within the expiry margin.
    ///
    /// A still-valid token is returned with no network call. Otherwise the
    /// caller serializes on a lock scoped to this user (distinct users
    /// refresh independently), re-reads the record in case another caller
    /// refreshed first, and only then performs one refresh exchange. Refresh
    /// failures surface as [`AuthenticationError::MustRelogin`] and leave the
    /// stored record untouched.
    pub async fn ensure_valid_token(&self, user_id: UserId) -> Result<String, AuthError> {
        let credential = self
            .store
            .read(user_id)
            .await?
            .ok_or(AuthenticationError::NotRegistered)?;

        if token_is_valid(credential.token_expires_at.as_deref()) {
            if let Some(token) = credential.access_token {
                return Ok(token);
            }
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        // Another caller may have finished a refresh while we waited.
        let mut credential = self
            .store
            .read(user_id)
            .await?
            .ok_or(AuthenticationError::NotRegistered)?;

        if token_is_valid(credential.token_expires_at.as_deref()) {
            if let Some(token) = credential.access_token {
                return Ok(token);
            }
        }

        let (refresh_token, client_id, client_secret) = match (
            credential.refresh_token.clone(),
            credential.client_id.clone(),
            credential.client_secret.clone(),
        ) {
            (Some(refresh_token), Some(client_id), Some(client_secret)) => {
                (refresh_token, client_id, client_secret)
            }
            _ => {
                // Records written before the OAuth fields existed cannot be
                // refreshed at all.
                tracing::warn!(%user_id, "credential record has no refresh material");
                return Err(AuthenticationError::MustRelogin.into());
            }
        };

        tracing::info!(%user_id, "access token expired, refreshing");
        let refreshed = match self
            .refresher
            .refresh(&refresh_token, &client_id, &client_secret)
            .await
        {
            Ok(refreshed) => refreshed,
            Err(err) => {
                tracing::warn!(%user_id, %err, "token refresh failed");
                return Err(AuthenticationError::MustRelogin.into());
            }
        };

        // The provider does not reliably report a lifetime, so the expiry is
        // stamped from the configured assumption.
        credential.access_token = Some(refreshed.access_token.clone());
        credential.token_expires_at = Some((Utc::now() + self.token_lifetime).to_rfc3339());
        if refreshed.refresh_token.is_some() {
            credential.refresh_token = refreshed.refresh_token.clone();
        }
        self.store.write(user_id, &credential).await?;

        tracing::info!(%user_id, "access token refreshed");
        Ok(refreshed.access_token)
    }

    fn user_lock(&self, user_id: UserId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("Mutex is not poisoned");
        Arc::clone(
            locks
                .entry(user_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }
}

/// Whether a stored expiry timestamp, minus the safety margin, is still in
/// the future. A missing or unparsable expiry counts as expired.
fn token_is_valid(expires_at: Option<&str>) -> bool {
    let Some(raw) = expires_at else {
        return false;
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(expires_at) => {
            expires_at.with_timezone(&Utc) - Duration::seconds(TOKEN_EXPIRY_MARGIN_SECONDS)
                > Utc::now()
        }
        Err(err) => {
            tracing::warn!(%err, raw, "unparsable token expiry, treating as expired");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    use tokio::sync::Barrier;

    use super::*;
    use crate::credentials::{Credential, CredentialStoreError};

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<HashMap<UserId, Credential>>,
    }

    #[async_trait]
    impl CredentialStore for MemoryStore {
        async fn read(&self, user_id: UserId) -> Result<Option<Credential>, CredentialStoreError> {
            Ok(self.records.lock().unwrap().get(&user_id).cloned())
        }

        async fn write(
            &self,
            user_id: UserId,
            credential: &Credential,
        ) -> Result<(), CredentialStoreError> {
            self.records
                .lock()
                .unwrap()
                .insert(user_id, credential.clone());
            Ok(())
        }
    }

    struct CountingRefresher {
        calls: AtomicUsize,
        outcome: Result<RefreshedTokens, AuthenticationError>,
        barrier: Option<Barrier>,
    }

    impl CountingRefresher {
        fn ok(token: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome: Ok(RefreshedTokens {
                    access_token: token.into(),
                    refresh_token: Some("rotated-refresh".into()),
                }),
                barrier: None,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome: Err(AuthenticationError::MustRelogin),
                barrier: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(
            &self,
            _refresh_token: &str,
            _client_id: &str,
            _client_secret: &str,
        ) -> Result<RefreshedTokens, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(barrier) = &self.barrier {
                // Used to prove that two users' refreshes run concurrently.
                barrier.wait().await;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            self.outcome.clone().map_err(AuthError::from)
        }
    }

    fn registered(token: &str, expires_at: Option<String>) -> Credential {
        Credential {
            login: "parent@example.com".into(),
            password: "secret".into(),
            access_token: Some(token.into()),
            token_expires_at: expires_at,
            refresh_token: Some("refresh".into()),
            client_id: Some("client".into()),
            client_secret: Some("client-secret".into()),
            ..Default::default()
        }
    }

    async fn manager_with(
        credential: Credential,
        refresher: CountingRefresher,
    ) -> (TokenLifecycleManager, Arc<MemoryStore>, Arc<CountingRefresher>) {
        let store = Arc::new(MemoryStore::default());
        store.write(UserId(1), &credential).await.unwrap();
        let refresher = Arc::new(refresher);
        let manager = TokenLifecycleManager::new(
            Arc::clone(&store) as Arc<dyn CredentialStore>,
            Arc::clone(&refresher) as Arc<dyn TokenRefresher>,
            &ClientSettings::default(),
        );
        (manager, store, refresher)
    }

    #[test]
    fn validity_honors_the_five_minute_margin() {
        let in_four_minutes = (Utc::now() + Duration::minutes(4)).to_rfc3339();
        let in_six_minutes = (Utc::now() + Duration::minutes(6)).to_rfc3339();

        assert!(!token_is_valid(Some(&in_four_minutes)));
        assert!(token_is_valid(Some(&in_six_minutes)));
        assert!(!token_is_valid(None));
        assert!(!token_is_valid(Some("not-a-timestamp")));
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_a_refresh_call() {
        let expires = (Utc::now() + Duration::hours(1)).to_rfc3339();
        let (manager, _store, refresher) =
            manager_with(registered("live-token", Some(expires)), CountingRefresher::ok("new"))
                .await;

        let token = manager.ensure_valid_token(UserId(1)).await.unwrap();

        assert_eq!(token, "live-token");
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let expired = (Utc::now() - Duration::hours(1)).to_rfc3339();
        let (manager, store, refresher) =
            manager_with(registered("stale", Some(expired)), CountingRefresher::ok("fresh"))
                .await;

        let token = manager.ensure_valid_token(UserId(1)).await.unwrap();

        assert_eq!(token, "fresh");
        assert_eq!(refresher.calls(), 1);

        let stored = store.read(UserId(1)).await.unwrap().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("fresh"));
        assert_eq!(stored.refresh_token.as_deref(), Some("rotated-refresh"));
        let expiry =
            DateTime::parse_from_rfc3339(stored.token_expires_at.as_deref().unwrap()).unwrap();
        assert!(expiry.with_timezone(&Utc) > Utc::now());
    }

    #[tokio::test]
    async fn unparsable_expiry_counts_as_expired() {
        let (manager, _store, refresher) = manager_with(
            registered("stale", Some("yesterday-ish".into())),
            CountingRefresher::ok("fresh"),
        )
        .await;

        let token = manager.ensure_valid_token(UserId(1)).await.unwrap();
        assert_eq!(token, "fresh");
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_for_one_user_share_a_single_refresh() {
        let expired = (Utc::now() - Duration::hours(1)).to_rfc3339();
        let (manager, _store, refresher) =
            manager_with(registered("stale", Some(expired)), CountingRefresher::ok("fresh"))
                .await;

        let (a, b) = tokio::join!(
            manager.ensure_valid_token(UserId(1)),
            manager.ensure_valid_token(UserId(1)),
        );

        assert_eq!(a.unwrap(), "fresh");
        assert_eq!(b.unwrap(), "fresh");
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn distinct_users_refresh_concurrently() {
        let expired = (Utc::now() - Duration::hours(1)).to_rfc3339();
        let store = Arc::new(MemoryStore::default());
        store
            .write(UserId(1), &registered("stale", Some(expired.clone())))
            .await
            .unwrap();
        store
            .write(UserId(2), &registered("stale", Some(expired)))
            .await
            .unwrap();

        // Each refresh parks on the barrier until both are in flight, so the
        // test hangs (and times out) if the users serialize on one lock.
        let refresher = Arc::new(CountingRefresher {
            barrier: Some(Barrier::new(2)),
            ..CountingRefresher::ok("fresh")
        });
        let manager = TokenLifecycleManager::new(
            store,
            Arc::clone(&refresher) as Arc<dyn TokenRefresher>,
            &ClientSettings::default(),
        );

        let joined = tokio::time::timeout(StdDuration::from_secs(5), async {
            tokio::join!(
                manager.ensure_valid_token(UserId(1)),
                manager.ensure_valid_token(UserId(2)),
            )
        })
        .await
        .expect("refreshes for distinct users must not block each other");

        assert_eq!(joined.0.unwrap(), "fresh");
        assert_eq!(joined.1.unwrap(), "fresh");
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn missing_refresh_material_requires_relogin_without_a_call() {
        let expired = (Utc::now() - Duration::hours(1)).to_rfc3339();
        let mut credential = registered("stale", Some(expired));
        credential.client_secret = None;
        let (manager, _store, refresher) =
            manager_with(credential, CountingRefresher::ok("fresh")).await;

        let err = manager.ensure_valid_token(UserId(1)).await.unwrap_err();

        assert!(matches!(
            err,
            AuthError::Authentication(AuthenticationError::MustRelogin)
        ));
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn refresh_failure_leaves_stored_state_untouched() {
        let expired = (Utc::now() - Duration::hours(1)).to_rfc3339();
        let credential = registered("stale", Some(expired));
        let (manager, store, _refresher) =
            manager_with(credential.clone(), CountingRefresher::failing()).await;

        let err = manager.ensure_valid_token(UserId(1)).await.unwrap_err();

        assert!(matches!(
            err,
            AuthError::Authentication(AuthenticationError::MustRelogin)
        ));
        assert_eq!(store.read(UserId(1)).await.unwrap().unwrap(), credential);
    }

    #[tokio::test]
    async fn unregistered_user_is_an_authentication_error() {
        let store = Arc::new(MemoryStore::default());
        let refresher = Arc::new(CountingRefresher::ok("fresh"));
        let manager = TokenLifecycleManager::new(
            store,
            refresher as Arc<dyn TokenRefresher>,
            &ClientSettings::default(),
        );

        let err = manager.ensure_valid_token(UserId(9)).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Authentication(AuthenticationError::NotRegistered)
        ));
    }
}
