//! Credential records and the collaborator seams they are persisted through.
//!
//! The SDK never owns persistence or encryption-at-rest: the bot backend
//! supplies a [`CredentialStore`] and a [`CredentialCipher`], and this crate
//! only ever holds plaintext in memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{NetworkError, UserId};

/// The persisted credential record for one user. Created by the registration
/// flow; mutated afterwards only by the token lifecycle manager when a
/// refresh succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// Provider login.
    pub login: String,
    /// Provider password.
    pub password: String,
    /// Current access token, if a login ever completed.
    pub access_token: Option<String>,
    /// RFC3339 timestamp the access token is assumed to expire at.
    pub token_expires_at: Option<String>,
    /// Long-lived token used to renew the access token silently.
    pub refresh_token: Option<String>,
    /// OAuth client id captured during registration.
    pub client_id: Option<String>,
    /// OAuth client secret captured during registration.
    pub client_secret: Option<String>,
    /// Provider profile id of the account owner.
    pub profile_id: Option<i64>,
    /// Provider role of the account owner (parent or student).
    pub role: Option<String>,
}

impl Credential {
    /// Whether the record carries everything a silent refresh needs. Records
    /// written by older schema versions may miss these fields.
    pub fn has_refresh_material(&self) -> bool {
        self.refresh_token.is_some() && self.client_id.is_some() && self.client_secret.is_some()
    }
}

/// Failure inside a collaborator-provided store or cipher.
#[derive(Debug, Error)]
#[error("credential store failure: {0}")]
pub struct CredentialStoreError(pub String);

impl From<CredentialStoreError> for crate::AuthError {
    fn from(e: CredentialStoreError) -> Self {
        crate::AuthError::Network(NetworkError::Internal {
            message: e.to_string(),
        })
    }
}

/// Persisted key-value credential storage, supplied by the bot backend.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read the credential record for a user, `None` if never registered.
    async fn read(&self, user_id: UserId) -> Result<Option<Credential>, CredentialStoreError>;

    /// Write (insert or replace) the credential record for a user.
    async fn write(
        &self,
        user_id: UserId,
        credential: &Credential,
    ) -> Result<(), CredentialStoreError>;
}

/// Opaque encrypt/decrypt service for credentials at rest, supplied by the
/// bot backend. The SDK does not care how it is implemented.
pub trait CredentialCipher: Send + Sync {
    /// Encrypt a plaintext string.
    fn encrypt(&self, plaintext: &str) -> Result<String, CredentialStoreError>;
    /// Decrypt a previously encrypted string.
    fn decrypt(&self, ciphertext: &str) -> Result<String, CredentialStoreError>;
}

/// Store adapter that seals the secret fields of a [`Credential`] through a
/// [`CredentialCipher`] on write and opens them on read, so the inner store
/// only ever sees ciphertext for the password and tokens.
pub struct SealedCredentialStore<S, C> {
    inner: S,
    cipher: C,
}

impl<S: CredentialStore, C: CredentialCipher> SealedCredentialStore<S, C> {
    /// Wrap a store with a cipher.
    pub fn new(inner: S, cipher: C) -> Self {
        Self { inner, cipher }
    }

    fn seal(&self, credential: &Credential) -> Result<Credential, CredentialStoreError> {
        let mut sealed = credential.clone();
        sealed.password = self.cipher.encrypt(&credential.password)?;
        sealed.access_token = self.seal_opt(credential.access_token.as_deref())?;
        sealed.refresh_token = self.seal_opt(credential.refresh_token.as_deref())?;
        sealed.client_secret = self.seal_opt(credential.client_secret.as_deref())?;
        Ok(sealed)
    }

    fn open(&self, sealed: &Credential) -> Result<Credential, CredentialStoreError> {
        let mut credential = sealed.clone();
        credential.password = self.cipher.decrypt(&sealed.password)?;
        credential.access_token = self.open_opt(sealed.access_token.as_deref())?;
        credential.refresh_token = self.open_opt(sealed.refresh_token.as_deref())?;
        credential.client_secret = self.open_opt(sealed.client_secret.as_deref())?;
        Ok(credential)
    }

    fn seal_opt(&self, value: Option<&str>) -> Result<Option<String>, CredentialStoreError> {
        value.map(|v| self.cipher.encrypt(v)).transpose()
    }

    fn open_opt(&self, value: Option<&str>) -> Result<Option<String>, CredentialStoreError> {
        value.map(|v| self.cipher.decrypt(v)).transpose()
    }
}

#[async_trait]
impl<S: CredentialStore, C: CredentialCipher> CredentialStore for SealedCredentialStore<S, C> {
    async fn read(&self, user_id: UserId) -> Result<Option<Credential>, CredentialStoreError> {
        match self.inner.read(user_id).await? {
            Some(sealed) => Ok(Some(self.open(&sealed)?)),
            None => Ok(None),
        }
    }

    async fn write(
        &self,
        user_id: UserId,
        credential: &Credential,
    ) -> Result<(), CredentialStoreError> {
        let sealed = self.seal(credential)?;
        self.inner.write(user_id, &sealed).await
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use super::*;

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

    /// Reverses the input, which is enough to tell plaintext from
    /// "ciphertext" in assertions.
    struct MirrorCipher;

    impl CredentialCipher for MirrorCipher {
        fn encrypt(&self, plaintext: &str) -> Result<String, CredentialStoreError> {
            Ok(plaintext.chars().rev().collect())
        }

        fn decrypt(&self, ciphertext: &str) -> Result<String, CredentialStoreError> {
            Ok(ciphertext.chars().rev().collect())
        }
    }

    #[tokio::test]
    async fn sealed_store_roundtrips_and_hides_secrets() {
        let store = SealedCredentialStore::new(MemoryStore::default(), MirrorCipher);
        let user = UserId(7);
        let credential = Credential {
            login: "parent@example.com".into(),
            password: "hunter2".into(),
            access_token: Some("token".into()),
            refresh_token: Some("refresh".into()),
            client_secret: Some("secret".into()),
            ..Default::default()
        };

        store.write(user, &credential).await.unwrap();

        // The inner store must only see ciphertext for the secret fields.
        let sealed = store.inner.read(user).await.unwrap().unwrap();
        assert_eq!(sealed.password, "2retnuh");
        assert_eq!(sealed.login, "parent@example.com");

        let opened = store.read(user).await.unwrap().unwrap();
        assert_eq!(opened, credential);
    }

    #[test]
    fn refresh_material_requires_all_three_fields() {
        let mut credential = Credential {
            refresh_token: Some("r".into()),
            client_id: Some("id".into()),
            client_secret: Some("s".into()),
            ..Default::default()
        };
        assert!(credential.has_refresh_material());

        credential.client_secret = None;
        assert!(!credential.has_refresh_material());
    }
}
