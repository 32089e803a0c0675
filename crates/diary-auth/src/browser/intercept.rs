//! Network-response interception. While the login page is open, every
//! response the browser receives is inspected by URL path; the three shapes
//! the exchange produces are captured as they fly by, and the token exchange
//! doubles as the completion signal the verification step waits on.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::{
    EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::Page;
use diary_core::NetworkError;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::api::{
    response::extract_session_token, SessionMaterial, OAUTH_REGISTER_PATH, OAUTH_TOKEN_PATH,
    SESSION_TOKEN_PATH,
};

/// Tokens recovered from intercepted responses so far.
#[derive(Debug, Default, Clone)]
pub(crate) struct InterceptedTokens {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub session_token: Option<String>,
}

impl InterceptedTokens {
    /// Feed one successful response body. Returns `true` when this response
    /// was the token exchange — the signal that the login can be completed.
    pub(crate) fn absorb(&mut self, url: &str, body: &serde_json::Value) -> bool {
        if url.contains(OAUTH_REGISTER_PATH) {
            self.client_id = string_field(body, "client_id");
            self.client_secret = string_field(body, "client_secret");
            tracing::debug!("intercepted client registration");
            false
        } else if url.contains(OAUTH_TOKEN_PATH) {
            self.access_token = string_field(body, "access_token");
            self.refresh_token = string_field(body, "refresh_token");
            tracing::debug!("intercepted token exchange");
            true
        } else if url.contains(SESSION_TOKEN_PATH) {
            // Issued by the browser itself only sometimes; when it is not,
            // finalization performs the exchange directly.
            self.session_token = extract_session_token(body);
            if self.session_token.is_some() {
                tracing::debug!("intercepted session token");
            }
            false
        } else {
            false
        }
    }

    /// Whether anything usable for finalization was captured.
    pub(crate) fn has_token(&self) -> bool {
        self.access_token.is_some() || self.session_token.is_some()
    }
}

impl From<InterceptedTokens> for SessionMaterial {
    fn from(tokens: InterceptedTokens) -> Self {
        SessionMaterial {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            client_id: tokens.client_id,
            client_secret: tokens.client_secret,
            session_token: tokens.session_token,
        }
    }
}

/// Listens to a page's responses and accumulates [`InterceptedTokens`].
pub(crate) struct ResponseInterceptor {
    tokens: Arc<Mutex<InterceptedTokens>>,
    completed: Option<oneshot::Receiver<()>>,
    done: bool,
    task: JoinHandle<()>,
}

impl ResponseInterceptor {
    /// Attach to a page. Must happen before navigation so the registration
    /// response is not missed.
    pub(crate) async fn attach(page: &Page) -> Result<Self, NetworkError> {
        let mut events = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|err| NetworkError::Transport {
                message: err.to_string(),
            })?;

        let tokens = Arc::new(Mutex::new(InterceptedTokens::default()));
        let (tx, rx) = oneshot::channel();

        let state = Arc::clone(&tokens);
        let body_source = page.clone();
        let task = tokio::task::spawn(async move {
            let mut tx = Some(tx);
            while let Some(event) = events.next().await {
                let url = event.response.url.clone();
                if !is_exchange_url(&url) || event.response.status != 200 {
                    continue;
                }
                let body = match body_source
                    .execute(GetResponseBodyParams::new(event.request_id.clone()))
                    .await
                {
                    Ok(response) => response.result.body.clone(),
                    Err(err) => {
                        tracing::debug!(%err, %url, "response body was not retrievable");
                        continue;
                    }
                };
                let Ok(json) = serde_json::from_str::<serde_json::Value>(&body) else {
                    continue;
                };
                let completed = state
                    .lock()
                    .expect("Mutex is not poisoned")
                    .absorb(&url, &json);
                if completed {
                    // Resolved exactly once per session; later token
                    // exchanges only update the captured state.
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
        });

        Ok(Self {
            tokens,
            completed: Some(rx),
            done: false,
            task,
        })
    }

    /// Snapshot of everything captured so far, as finalization material.
    pub(crate) fn material(&self) -> SessionMaterial {
        self.tokens
            .lock()
            .expect("Mutex is not poisoned")
            .clone()
            .into()
    }

    /// Whether a token usable for finalization was already captured.
    pub(crate) fn has_token(&self) -> bool {
        self.tokens
            .lock()
            .expect("Mutex is not poisoned")
            .has_token()
    }

    /// Wait for the token exchange to be intercepted. Returns `false` on
    /// timeout; the wait can be repeated (the signal is sticky once it
    /// fired).
    pub(crate) async fn wait_for_completion(&mut self, timeout: Duration) -> bool {
        if self.done {
            return true;
        }
        let Some(mut rx) = self.completed.take() else {
            return false;
        };
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(())) => {
                self.done = true;
                true
            }
            // The listener task died; nothing will ever arrive.
            Ok(Err(_)) => false,
            Err(_) => {
                self.completed = Some(rx);
                false
            }
        }
    }
}

impl Drop for ResponseInterceptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn is_exchange_url(url: &str) -> bool {
    url.contains(OAUTH_REGISTER_PATH)
        || url.contains(OAUTH_TOKEN_PATH)
        || url.contains(SESSION_TOKEN_PATH)
}

fn string_field(body: &serde_json::Value, field: &str) -> Option<String> {
    body.get(field)
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_response_fills_client_material() {
        let mut tokens = InterceptedTokens::default();
        let done = tokens.absorb(
            "https://login.mos.ru/sps/oauth/register",
            &serde_json::json!({"client_id": "id", "client_secret": "secret"}),
        );

        assert!(!done);
        assert_eq!(tokens.client_id.as_deref(), Some("id"));
        assert_eq!(tokens.client_secret.as_deref(), Some("secret"));
        assert!(!tokens.has_token());
    }

    #[test]
    fn token_exchange_completes_the_capture() {
        let mut tokens = InterceptedTokens::default();
        let done = tokens.absorb(
            "https://login.mos.ru/sps/oauth/te",
            &serde_json::json!({"access_token": "access", "refresh_token": "refresh"}),
        );

        assert!(done);
        assert!(tokens.has_token());
        assert_eq!(tokens.access_token.as_deref(), Some("access"));
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh"));
    }

    #[test]
    fn session_token_is_captured_from_the_nested_shape() {
        let mut tokens = InterceptedTokens::default();
        let done = tokens.absorb(
            "https://school.mos.ru/v3/auth/sudir/auth",
            &serde_json::json!({
                "user_authentication_for_mobile_response": {"mesh_access_token": "session"}
            }),
        );

        assert!(!done);
        assert_eq!(tokens.session_token.as_deref(), Some("session"));
        assert!(tokens.has_token());
    }

    #[test]
    fn unrelated_urls_are_ignored() {
        let mut tokens = InterceptedTokens::default();
        let done = tokens.absorb(
            "https://school.mos.ru/static/app.js",
            &serde_json::json!({"access_token": "decoy"}),
        );

        assert!(!done);
        assert!(!tokens.has_token());
    }
}
