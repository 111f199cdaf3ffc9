//! Integration tests for the control API client against a mock server.

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use parla::api::ApiClient;
use parla::errors::{codes, EmbedError};
use parla::messages::MessageRole;
use parla::EmbedConfig;

fn client_for(server_uri: &str) -> ApiClient {
    let mut config = EmbedConfig::new("pk_test_key");
    config.api_url = server_uri.to_string();
    ApiClient::new(&config).unwrap()
}

#[tokio::test]
async fn test_fetch_token_sends_bearer_key_and_parses_data() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/token"))
        .and(header("authorization", "Bearer pk_test_key"))
        .and(body_json(json!({
            "assistantId": "asst_1",
            "metadata": {"page": "pricing"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "callId": "call_1",
                "token": "jwt_token",
                "url": "wss://rtc.example.com",
                "roomName": "room_1",
                "assistant": {"id": "asst_1", "name": "Ada"},
                "rateLimit": {"requestsRemaining": 41, "resetAt": 1700000000000u64},
            },
        })))
        .expect(1)
        .mount(&server)
        .await;

    let token = client_for(&server.uri())
        .fetch_token("asst_1", Some(json!({"page": "pricing"})))
        .await
        .unwrap();

    assert_eq!(token.call_id, "call_1");
    assert_eq!(token.token, "jwt_token");
    assert_eq!(token.url, "wss://rtc.example.com");
    assert_eq!(token.room_name.as_deref(), Some("room_1"));
    assert_eq!(token.assistant.unwrap().name, "Ada");
    let rate_limit = token.rate_limit.unwrap();
    assert_eq!(rate_limit.requests_remaining, Some(41));
}

#[tokio::test]
async fn test_rate_limited_token_carries_hints() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/token"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "success": false,
            "error": {
                "code": "RATE_LIMITED",
                "message": "too many requests",
                "details": {"retryAfter": 30, "resetAt": 1700000000000u64},
            },
        })))
        .mount(&server)
        .await;

    let err = client_for(&server.uri())
        .fetch_token("asst_1", None)
        .await
        .unwrap_err();

    match err {
        EmbedError::RateLimit {
            retry_after,
            reset_at,
            ..
        } => {
            assert_eq!(retry_after, Some(30));
            assert_eq!(reset_at, Some(1700000000000));
        }
        other => panic!("expected RateLimit, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_assistant_maps_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/token"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "success": false,
            "error": {"code": "NOT_FOUND", "message": "no such assistant"},
        })))
        .mount(&server)
        .await;

    let err = client_for(&server.uri())
        .fetch_token("asst_missing", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EmbedError::AssistantNotFound(_)));
    assert_eq!(err.code(), codes::ASSISTANT_NOT_FOUND);
}

#[tokio::test]
async fn test_success_false_with_http_200_is_still_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "error": {"code": "SOMETHING_ODD", "message": "nope"},
        })))
        .mount(&server)
        .await;

    let err = client_for(&server.uri())
        .fetch_token("asst_1", None)
        .await
        .unwrap_err();
    match err {
        EmbedError::Api { code, .. } => assert_eq!(code, "SOMETHING_ODD"),
        other => panic!("expected Api, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_json_error_body_is_capped() {
    let server = MockServer::start().await;
    let huge = "x".repeat(2000);
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/token"))
        .respond_with(ResponseTemplate::new(500).set_body_string(huge))
        .mount(&server)
        .await;

    let err = client_for(&server.uri())
        .fetch_token("asst_1", None)
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("truncated"));
    assert!(message.len() < 700);
}

#[tokio::test]
async fn test_get_call_messages_builds_query_and_parses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/embed/calls/call_1/messages"))
        .and(query_param("limit", "10"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "messages": [
                    {"id": "m1", "role": "user", "content": "hi", "timestamp": 1},
                    {"id": "m2", "role": "assistant", "text": "hello", "timestamp": 2},
                ],
            },
        })))
        .mount(&server)
        .await;

    let messages = client_for(&server.uri())
        .get_call_messages("call_1", 10, 0)
        .await
        .unwrap();

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    // "text" is accepted as an alias for content.
    assert_eq!(messages[1].content, "hello");
    assert!(messages[1].is_complete, "completeness defaults to true");
}

#[tokio::test]
async fn test_set_muted_posts_state() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/calls/call_1/mute"))
        .and(body_json(json!({"muted": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    client_for(&server.uri())
        .set_muted("call_1", true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_connection_refused_maps_to_connection_error() {
    // Nothing listens on this port.
    let client = client_for("http://127.0.0.1:9");
    let err = client.fetch_token("asst_1", None).await.unwrap_err();
    assert_eq!(err.code(), codes::CONNECTION_FAILED);
    assert!(err.is_retryable());
}
