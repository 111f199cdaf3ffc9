//! End-to-end client lifecycle tests against a mock control API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use parla::errors::codes;
use parla::{
    ClientEvent, EmbedClient, EmbedConfig, EmbedError, EventKind, Message, MessageRole,
    SessionState,
};

fn client_for(server_uri: &str) -> EmbedClient {
    let mut config = EmbedConfig::new("pk_test_key");
    config.api_url = server_uri.to_string();
    EmbedClient::new(config).unwrap()
}

async fn mount_chat_creation(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {"chatId": "chat_1", "assistant": {"id": "asst_1", "name": "Ada"}},
        })))
        .mount(server)
        .await;
}

#[test]
fn test_bad_key_fails_construction_without_network() {
    let err = EmbedClient::new(EmbedConfig::new("bad_key")).unwrap_err();
    assert!(matches!(err, EmbedError::Configuration(_)));
}

#[tokio::test]
async fn test_start_call_no_credits_rejects_and_resets() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/token"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "success": false,
            "error": {"code": "X", "message": "no credits"},
        })))
        .mount(&server)
        .await;

    let client = client_for(&server.uri());
    let err = client.start_call("asst_1", None).await.unwrap_err();

    assert!(matches!(err, EmbedError::InsufficientCredits(_)));
    assert_eq!(client.state(), SessionState::Idle);
    assert_eq!(client.call_id(), None);
}

#[tokio::test]
async fn test_voice_blocked_while_chat_session_active() {
    let server = MockServer::start().await;
    mount_chat_creation(&server).await;

    let client = client_for(&server.uri());
    let chat_id = client.start_chat_session("asst_1", None).await.unwrap();
    assert_eq!(chat_id.as_deref(), Some("chat_1"));

    let err = client.start_call("asst_1", None).await.unwrap_err();
    assert_eq!(err.code(), codes::CHAT_IN_PROGRESS);
    // The chat session is untouched.
    assert_eq!(client.chat_id().as_deref(), Some("chat_1"));
    assert_eq!(client.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_chat_round_trip_emits_each_message_once() {
    let server = MockServer::start().await;
    mount_chat_creation(&server).await;

    let body = "event: message:start\ndata: {\"id\":\"m1\"}\n\n\
event: message:chunk\ndata: {\"content\":\"Hello\"}\n\n\
event: message:chunk\ndata: {\"content\":\"Hello th\"}\n\n\
event: message:chunk\ndata: {\"content\":\"Hello there\"}\n\n\
event: message:complete\ndata: {\"id\":\"m1\",\"content\":\"Hello there\"}\n\n\
event: done\n\n";
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/chat/chat_1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/chat/chat_1/end"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(&server)
        .await;

    let client = client_for(&server.uri());
    let messages: Arc<Mutex<Vec<Message>>> = Arc::default();
    let messages_clone = Arc::clone(&messages);
    client.on(EventKind::Message, move |event| {
        if let ClientEvent::Message(message) = event {
            messages_clone.lock().push(message.clone());
        }
    });

    client.start_chat_session("asst_1", None).await.unwrap();
    client.send_chat_message("hi").await.unwrap();
    client.end_chat_session().await.unwrap();

    let messages = messages.lock();
    assert_eq!(messages.len(), 2, "one user message, one assistant reply");
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].id, "m1");
    assert_eq!(messages[1].content, "Hello there");
    assert_eq!(client.state(), SessionState::Disconnected);
    assert_eq!(client.chat_id(), None);
}

#[tokio::test]
async fn test_chat_session_restartable_after_end() {
    let server = MockServer::start().await;
    mount_chat_creation(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/chat/chat_1/end"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(&server)
        .await;

    let client = client_for(&server.uri());
    client.start_chat_session("asst_1", None).await.unwrap();
    client.end_chat_session().await.unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);

    // Disconnected is re-enterable.
    let chat_id = client.start_chat_session("asst_1", None).await.unwrap();
    assert_eq!(chat_id.as_deref(), Some("chat_1"));
    assert_eq!(client.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_once_handler_fires_a_single_time() {
    let server = MockServer::start().await;
    mount_chat_creation(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/chat/chat_1/end"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(&server)
        .await;

    let client = client_for(&server.uri());
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);
    client.once(EventKind::Connected, move |_| {
        fired_clone.fetch_add(1, Ordering::SeqCst);
    });

    client.start_chat_session("asst_1", None).await.unwrap();
    client.end_chat_session().await.unwrap();
    client.start_chat_session("asst_1", None).await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_destroy_ends_chat_and_clears_listeners() {
    let server = MockServer::start().await;
    mount_chat_creation(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/embed/chat/chat_1/end"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server.uri());
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);
    client.on(EventKind::StateChange, move |_| {
        fired_clone.fetch_add(1, Ordering::SeqCst);
    });

    client.start_chat_session("asst_1", None).await.unwrap();
    client.destroy().await;

    assert_eq!(client.chat_id(), None);
    assert!(client.state().can_start());
}

#[tokio::test]
async fn test_panicking_subscriber_does_not_break_others() {
    let server = MockServer::start().await;
    mount_chat_creation(&server).await;

    let client = client_for(&server.uri());
    client.on(EventKind::Connected, |_| panic!("bad subscriber"));
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);
    client.on(EventKind::Connected, move |_| {
        fired_clone.fetch_add(1, Ordering::SeqCst);
    });

    client.start_chat_session("asst_1", None).await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
