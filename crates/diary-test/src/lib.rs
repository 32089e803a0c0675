#![doc = include_str!("../README.md")]

use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

/// Helper for testing the provider exchange using wiremock.
///
/// Warning: when using `Mock::expect` ensure the server is not dropped before
/// the test completes.
pub async fn start_provider_mock(mocks: Vec<Mock>) -> MockServer {
    let server = MockServer::start().await;

    for mock in mocks {
        server.register(mock).await;
    }

    server
}

/// The provider's token-exchange success body.
pub fn token_exchange_body(access_token: &str, refresh_token: &str) -> serde_json::Value {
    serde_json::json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "token_type": "Bearer",
    })
}

/// The provider's session-token success body, in its nested shape.
pub fn session_token_body(session_token: &str) -> serde_json::Value {
    serde_json::json!({
        "user_authentication_for_mobile_response": {
            "mesh_access_token": session_token,
        }
    })
}

/// The provider's error body for a given `error_code`.
pub fn provider_error_body(error_code: &str) -> serde_json::Value {
    serde_json::json!({
        "error_code": error_code,
        "message": "from mock",
    })
}

/// Start a mock server whose token-exchange endpoint always renews to
/// `renewed_token`.
pub async fn start_refresh_server(renewed_token: &str) -> MockServer {
    start_provider_mock(vec![Mock::given(matchers::method("POST"))
        .and(matchers::path("/sps/oauth/te"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_exchange_body(renewed_token, "rotated-refresh")),
        )])
    .await
}
