//! Integration tests for HTTP notification delivery
//!
//! A wiremock server stands in for the bot API.

use std::sync::Arc;
use std::time::Duration;

use quizlink::notifier::endpoint_url;
use quizlink::{DeliveryError, Dispatcher, EventKind, HttpNotifier, Notifier, OutboundEvent};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn linked_event() -> OutboundEvent {
    OutboundEvent {
        platform_user_id: 42,
        external_user_id: "tg-900".to_string(),
        kind: EventKind::Linked {
            external_username: Some("alice".to_string()),
            code: "123456".to_string(),
        },
        timestamp: 1_700_000_000,
    }
}

/// Test that the configured path is replaced by the event path
#[tokio::test]
async fn test_delivery_posts_json_to_event_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/linked"))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(serde_json::json!({
            "platformUserId": 42,
            "externalUserId": "tg-900",
            "event": "linked",
            "externalUsername": "alice",
            "timestamp": 1_700_000_000,
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let base = format!("{}/api/moodle/verify-code", server.uri());
    let notifier = HttpNotifier::new(&base, Duration::from_secs(2), None).unwrap();

    notifier.deliver(&linked_event()).await.unwrap();
}

#[tokio::test]
async fn test_bearer_token_attached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/quiz-completed"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = HttpNotifier::new(&server.uri(), Duration::from_secs(2), Some("s3cret".to_string())).unwrap();
    let event = OutboundEvent {
        platform_user_id: 1,
        external_user_id: "tg-1".to_string(),
        kind: EventKind::QuizCompleted {
            topic: "OTAN".to_string(),
            activity_title: "Simulacro OTAN".to_string(),
            correct: false,
            response_time_ms: 800,
        },
        timestamp: 0,
    };

    notifier.deliver(&event).await.unwrap();
}

#[tokio::test]
async fn test_non_success_status_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let notifier = HttpNotifier::new(&server.uri(), Duration::from_secs(2), None).unwrap();
    let result = notifier.deliver(&linked_event()).await;

    assert!(matches!(result, Err(DeliveryError::Status(503))));
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1500)))
        .mount(&server)
        .await;

    let notifier = HttpNotifier::new(&server.uri(), Duration::from_millis(200), None).unwrap();
    let started = std::time::Instant::now();
    let result = notifier.deliver(&linked_event()).await;

    assert!(matches!(result, Err(DeliveryError::Timeout)));
    assert!(started.elapsed() < Duration::from_millis(1500));
}

/// Test that the dispatcher swallows delivery failures
#[tokio::test]
async fn test_dispatcher_swallows_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let notifier: Arc<dyn Notifier> =
        Arc::new(HttpNotifier::new(&server.uri(), Duration::from_secs(2), None).unwrap());
    let dispatcher = Dispatcher::new(notifier);

    let handle = dispatcher.send(linked_event()).unwrap();
    // The spawned task completes normally even though the bot answered 500
    handle.await.unwrap();
}

#[test]
fn test_endpoint_keeps_explicit_port() {
    let url = endpoint_url("http://127.0.0.1:3000/some/old/path", "/attempt-completed").unwrap();
    assert_eq!(url.as_str(), "http://127.0.0.1:3000/attempt-completed");
}
