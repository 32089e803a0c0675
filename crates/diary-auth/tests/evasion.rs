//! Integration tests for the HTTP login strategy against a mocked provider.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use diary_auth::{FingerprintEvasionClient, LoginStrategy, StartLoginOutcome, StrategyError};
use diary_core::{
    tokens::TokenRefresher, AuthError, AuthenticationError, ClientSettings, NetworkError,
    PendingLogin, RetryObserver,
};
use diary_test::{
    provider_error_body, session_token_body, start_provider_mock, start_refresh_server,
    token_exchange_body,
};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

fn test_settings(server: &MockServer) -> ClientSettings {
    ClientSettings {
        entry_url: server.uri(),
        auth_url: server.uri(),
        probe_timeout: Duration::from_millis(500),
        login_timeout: Duration::from_millis(800),
        verify_timeout: Duration::from_secs(2),
        ..ClientSettings::default()
    }
}

fn client(server: &MockServer) -> FingerprintEvasionClient {
    FingerprintEvasionClient::new(Arc::new(test_settings(server))).expect("client builds")
}

fn register_mock() -> Mock {
    Mock::given(method("POST"))
        .and(path("/sps/oauth/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "client_id": "client-1",
            "client_secret": "secret-1",
        })))
}

fn finalize_mocks() -> Vec<Mock> {
    vec![
        Mock::given(method("POST"))
            .and(path("/sps/oauth/te"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_exchange_body("mos-access", "refresh-1")),
            ),
        Mock::given(method("POST"))
            .and(path("/v3/auth/sudir/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_token_body("session-token"))),
        Mock::given(method("GET"))
            .and(path("/api/family/mobile/v1/profile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "profile": [{"id": 77, "type": "parent"}],
            }))),
        Mock::given(method("GET"))
            .and(path("/api/family/mobile/v1/family"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "children": [{"id": 5, "first_name": "Иван", "last_name": "Иванов"}],
            }))),
    ]
}

async fn requests_to(server: &MockServer, needle: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path().contains(needle))
        .count()
}

#[derive(Default)]
struct CountingObserver {
    calls: Mutex<Vec<(u32, u32)>>,
}

#[async_trait]
impl RetryObserver for CountingObserver {
    async fn on_retry(&self, attempt: u32, total: u32) {
        self.calls.lock().expect("Mutex is not poisoned").push((attempt, total));
    }
}

#[tokio::test]
async fn login_with_sms_step_completes_after_the_code() {
    let mut mocks = vec![
        register_mock(),
        Mock::given(method("POST"))
            .and(path("/sps/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sms_challenge": {"contact": "7***99", "ttl": 300},
            }))),
        Mock::given(method("POST"))
            .and(path("/sps/login/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authorization_code": "auth-code",
            }))),
    ];
    mocks.extend(finalize_mocks());
    let server = start_provider_mock(mocks).await;

    let outcome = client(&server)
        .start_login("parent@example.com", "hunter2", None)
        .await
        .unwrap();

    let StartLoginOutcome::SmsRequired {
        masked_contact,
        code_ttl,
        mut continuation,
    } = outcome
    else {
        panic!("expected the SMS step");
    };
    assert_eq!(masked_contact, "7***99");
    assert_eq!(code_ttl, Duration::from_secs(300));

    let session = continuation.verify_code("1234").await.unwrap();
    assert_eq!(session.access_token, "session-token");
    assert_eq!(session.refresh_token.as_deref(), Some("refresh-1"));
    assert_eq!(session.client_id.as_deref(), Some("client-1"));
    assert_eq!(session.client_secret.as_deref(), Some("secret-1"));
    assert_eq!(session.profile_id, 77);
    assert_eq!(session.role, "parent");
    assert_eq!(session.dependents.len(), 1);
    assert_eq!(session.dependents[0].name, "Иванов Иван");

    assert_eq!(requests_to(&server, "/sps/oauth/register").await, 1);
    assert_eq!(requests_to(&server, "/sps/login/verify").await, 1);
    assert_eq!(requests_to(&server, "/sps/oauth/te").await, 1);
}

#[tokio::test]
async fn login_without_sms_step_authenticates_directly() {
    let mut mocks = vec![
        register_mock(),
        Mock::given(method("POST"))
            .and(path("/sps/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authorization_code": "auth-code",
            }))),
    ];
    mocks.extend(finalize_mocks());
    let server = start_provider_mock(mocks).await;

    let outcome = client(&server)
        .start_login("parent@example.com", "hunter2", None)
        .await
        .unwrap();

    let StartLoginOutcome::Authenticated(session) = outcome else {
        panic!("expected a direct login");
    };
    assert_eq!(session.access_token, "session-token");
}

#[tokio::test]
async fn rejected_credentials_are_final_and_not_retried() {
    let server = start_provider_mock(vec![
        register_mock(),
        Mock::given(method("POST"))
            .and(path("/sps/login"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(provider_error_body("InvalidCredentials")),
            ),
    ])
    .await;

    let err = client(&server)
        .start_login("parent@example.com", "wrong", None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StrategyError::Authentication(AuthenticationError::BadCredentials)
    ));
    assert_eq!(requests_to(&server, "/sps/login").await, 1);
}

#[tokio::test]
async fn a_blocked_account_is_reported_as_locked() {
    let server = start_provider_mock(vec![
        register_mock(),
        Mock::given(method("POST"))
            .and(path("/sps/login"))
            .respond_with(
                ResponseTemplate::new(403).set_body_json(provider_error_body("TemporarilyBlocked")),
            ),
    ])
    .await;

    let err = client(&server)
        .start_login("parent@example.com", "hunter2", None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StrategyError::Authentication(AuthenticationError::AccountLocked)
    ));
}

#[tokio::test]
async fn a_slow_provider_gets_one_retry_and_the_user_is_told() {
    let server = start_provider_mock(vec![
        register_mock(),
        Mock::given(method("POST"))
            .and(path("/sps/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(3))
                    .set_body_json(serde_json::json!({"authorization_code": "late"})),
            ),
    ])
    .await;

    let observer = Arc::new(CountingObserver::default());
    let err = client(&server)
        .start_login(
            "parent@example.com",
            "hunter2",
            Some(Arc::clone(&observer) as Arc<dyn RetryObserver>),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, StrategyError::Network(NetworkError::Timeout)));
    // One original attempt plus one retry, each registering afresh.
    assert_eq!(requests_to(&server, "/sps/oauth/register").await, 2);
    assert_eq!(*observer.calls.lock().unwrap(), vec![(2, 2)]);
}

#[tokio::test]
async fn an_unreachable_provider_fails_before_any_request() {
    let server = start_provider_mock(vec![register_mock()]).await;

    // A port that was just free is as unreachable as a dead provider.
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        port
    };

    let mut settings = test_settings(&server);
    settings.auth_url = format!("http://127.0.0.1:{dead_port}");

    let err = FingerprintEvasionClient::new(Arc::new(settings))
        .expect("client builds")
        .start_login("parent@example.com", "hunter2", None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StrategyError::Network(NetworkError::Unreachable { .. })
    ));
    assert_eq!(requests_to(&server, "/").await, 0);
}

#[tokio::test]
async fn an_invalid_code_leaves_the_continuation_usable() {
    let mut mocks = vec![
        register_mock(),
        Mock::given(method("POST"))
            .and(path("/sps/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sms_challenge": {"contact": "7***99", "ttl": 300},
            }))),
        // First submission is rejected, the corrected one goes through.
        Mock::given(method("POST"))
            .and(path("/sps/login/verify"))
            .respond_with(ResponseTemplate::new(400).set_body_json(provider_error_body("InvalidOTP")))
            .up_to_n_times(1),
        Mock::given(method("POST"))
            .and(path("/sps/login/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authorization_code": "auth-code",
            }))),
    ];
    mocks.extend(finalize_mocks());
    let server = start_provider_mock(mocks).await;

    let outcome = client(&server)
        .start_login("parent@example.com", "hunter2", None)
        .await
        .unwrap();
    let StartLoginOutcome::SmsRequired { mut continuation, .. } = outcome else {
        panic!("expected the SMS step");
    };

    let err = continuation.verify_code("0000").await.unwrap_err();
    assert!(matches!(
        err,
        AuthError::Authentication(AuthenticationError::BadCode)
    ));

    let session = continuation.verify_code("1234").await.unwrap();
    assert_eq!(session.access_token, "session-token");
}

#[tokio::test]
async fn an_expired_code_requires_a_restart() {
    let server = start_provider_mock(vec![
        register_mock(),
        Mock::given(method("POST"))
            .and(path("/sps/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sms_challenge": {"contact": "7***99", "ttl": 300},
            }))),
        Mock::given(method("POST"))
            .and(path("/sps/login/verify"))
            .respond_with(ResponseTemplate::new(400).set_body_json(provider_error_body("CodeExpired"))),
    ])
    .await;

    let outcome = client(&server)
        .start_login("parent@example.com", "hunter2", None)
        .await
        .unwrap();
    let StartLoginOutcome::SmsRequired { mut continuation, .. } = outcome else {
        panic!("expected the SMS step");
    };

    let err = continuation.verify_code("0000").await.unwrap_err();
    assert!(matches!(
        err,
        AuthError::Authentication(AuthenticationError::SessionExpired)
    ));
}

#[tokio::test]
async fn refresh_renews_the_session_token_without_sms() {
    let server = start_refresh_server("mos-access").await;
    server
        .register(
            Mock::given(method("POST"))
                .and(path("/v3/auth/sudir/auth"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(session_token_body("renewed-session")),
                ),
        )
        .await;

    let refreshed = client(&server)
        .refresh("old-refresh", "client-1", "secret-1")
        .await
        .unwrap();

    assert_eq!(refreshed.access_token, "renewed-session");
    assert_eq!(refreshed.refresh_token.as_deref(), Some("rotated-refresh"));
    assert_eq!(requests_to(&server, "/sps/login").await, 0);
}

#[tokio::test]
async fn a_revoked_refresh_token_surfaces_as_an_error() {
    let server = start_provider_mock(vec![Mock::given(method("POST"))
        .and(path("/sps/oauth/te"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "revoked"})),
        )])
    .await;

    let err = client(&server)
        .refresh("old-refresh", "client-1", "secret-1")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AuthError::Network(NetworkError::ResponseContent { status: 401, .. })
    ));
}
