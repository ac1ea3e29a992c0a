mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use webhook_relay::{
    DeliveryError, DeliveryStatus, ErrorClass, MessageChannel, Queue, WebhookId,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let server = MockServer::start().await;
    let responder = ScriptedResponder::fail_times(3, 500);
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(responder.clone())
        .mount(&server)
        .await;

    let mut pipeline = Pipeline::new();
    pipeline.register(webhook("w1", &format!("{}/hook", server.uri()), 3)).await;
    pipeline.worker.start();

    let record = pipeline
        .dispatcher
        .enqueue_delivery(&WebhookId::new("w1"), EVENT, json!({"taskId": "123"}))
        .await
        .unwrap();

    let done = pipeline.wait_for_terminal(&record.id).await;
    assert_eq!(done.status, DeliveryStatus::Success);
    assert_eq!(done.retry_count, 3);
    assert_eq!(done.status_code, Some(200));
    assert!(done.next_retry.is_none());
    assert_eq!(responder.count(), 4);

    assert_eq!(done.attempts.len(), 4);
    for (n, attempt) in done.attempts[..3].iter().enumerate() {
        assert_eq!(attempt.retry_count, n as u32);
        assert_eq!(attempt.status_code, Some(500));
        assert_eq!(attempt.error_class, Some(ErrorClass::Server));
    }
    assert_eq!(done.attempts[3].error_class, None);

    // receivers deduplicate on the delivery id, so it must not change
    for request in responder.requests() {
        assert_eq!(request.header("x-webhook-delivery"), Some(record.id.as_str()));
    }

    pipeline.worker.shutdown().await;
    assert!(pipeline.channel.unacked().await.is_empty());
}

#[tokio::test]
async fn exhausted_budget_makes_retry_count_plus_one_attempts() {
    let server = MockServer::start().await;
    let responder = ScriptedResponder::always(503);
    Mock::given(method("POST"))
        .respond_with(responder.clone())
        .mount(&server)
        .await;

    let mut pipeline = Pipeline::new();
    pipeline.register(webhook("w1", &format!("{}/hook", server.uri()), 2)).await;
    pipeline.worker.start();

    let record = pipeline
        .dispatcher
        .enqueue_delivery(&WebhookId::new("w1"), EVENT, json!({}))
        .await
        .unwrap();

    let done = pipeline.wait_for_terminal(&record.id).await;
    assert_eq!(done.status, DeliveryStatus::Failed);
    assert_eq!(done.retry_count, 2);
    assert_eq!(done.error_class, Some(ErrorClass::Server));
    assert_eq!(done.status_code, Some(503));
    assert_eq!(done.response_body.as_deref(), Some("upstream unavailable"));
    assert!(done.next_retry.is_none());
    assert_eq!(done.attempts.len(), 3);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(responder.count(), 3);

    pipeline.worker.shutdown().await;
}

#[tokio::test]
async fn zero_retry_budget_means_a_single_attempt() {
    let server = MockServer::start().await;
    let responder = ScriptedResponder::always(500);
    Mock::given(method("POST"))
        .respond_with(responder.clone())
        .mount(&server)
        .await;

    let pipeline = Pipeline::new();
    pipeline.register(webhook("w1", &format!("{}/hook", server.uri()), 0)).await;
    pipeline
        .dispatcher
        .enqueue_delivery(&WebhookId::new("w1"), EVENT, json!({}))
        .await
        .unwrap();

    let envelope = pipeline.channel.receive(Queue::Primary).await.unwrap().unwrap();
    assert_eq!(
        pipeline.worker.handle_message(envelope).await,
        Err(DeliveryError::MaxRetriesExceeded { retry_count: 0 })
    );
    assert_eq!(responder.count(), 1);
    assert_eq!(pipeline.channel.published_count(Queue::Retry), 0);
}

#[tokio::test]
async fn rate_limited_destination_is_never_called() {
    let server = MockServer::start().await;
    let responder = ScriptedResponder::ok();
    Mock::given(method("POST"))
        .respond_with(responder.clone())
        .mount(&server)
        .await;

    let mut pipeline = Pipeline::with_counter_store(Arc::new(SaturatedCounterStore));
    pipeline.register(webhook("w1", &format!("{}/hook", server.uri()), 3)).await;
    pipeline.worker.start();

    let record = pipeline
        .dispatcher
        .enqueue_delivery(&WebhookId::new("w1"), EVENT, json!({}))
        .await
        .unwrap();

    let done = pipeline.wait_for_terminal(&record.id).await;
    assert_eq!(done.status, DeliveryStatus::Failed);
    assert_eq!(done.retry_count, 3);
    assert!(done.next_retry.is_none());
    assert_eq!(done.attempts.len(), 4);
    for attempt in &done.attempts {
        assert_eq!(attempt.error_class, Some(ErrorClass::RateLimit));
        assert_eq!(attempt.status_code, Some(429));
    }
    assert_eq!(responder.count(), 0);

    pipeline.worker.shutdown().await;
}

#[tokio::test]
async fn failing_destination_does_not_hold_up_others() {
    let failing = MockServer::start().await;
    let failing_responder = ScriptedResponder::always(500);
    Mock::given(method("POST"))
        .respond_with(failing_responder.clone())
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    let healthy_responder = ScriptedResponder::ok();
    Mock::given(method("POST"))
        .respond_with(healthy_responder.clone())
        .mount(&healthy)
        .await;

    let mut pipeline = Pipeline::new();
    pipeline.register(webhook("down", &format!("{}/hook", failing.uri()), 3)).await;
    pipeline.register(webhook("up", &format!("{}/hook", healthy.uri()), 3)).await;
    pipeline.worker.start();

    let records = pipeline
        .dispatcher
        .dispatch_event(EVENT, json!({"taskId": "123"}))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);

    let up = records.iter().find(|r| r.webhook_id.as_str() == "up").unwrap();
    let down = records.iter().find(|r| r.webhook_id.as_str() == "down").unwrap();

    let up_done = pipeline.wait_for_terminal(&up.id).await;
    assert_eq!(up_done.status, DeliveryStatus::Success);
    assert_eq!(up_done.attempts.len(), 1);

    let down_done = pipeline.wait_for_terminal(&down.id).await;
    assert_eq!(down_done.status, DeliveryStatus::Failed);
    assert_eq!(down_done.attempts.len(), 4);
    assert_eq!(healthy_responder.count(), 1);

    pipeline.worker.shutdown().await;
}

#[tokio::test]
async fn failed_record_carries_next_retry_while_budget_remains() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ScriptedResponder::always(500))
        .mount(&server)
        .await;

    let pipeline = Pipeline::new();
    pipeline.register(webhook("w1", &format!("{}/hook", server.uri()), 3)).await;
    let record = pipeline
        .dispatcher
        .enqueue_delivery(&WebhookId::new("w1"), EVENT, json!({}))
        .await
        .unwrap();

    let envelope = pipeline.channel.receive(Queue::Primary).await.unwrap().unwrap();
    let _ = pipeline.worker.handle_message(envelope).await;

    let stored = pipeline.dispatcher.get_delivery(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Failed);
    assert!(stored.next_retry.is_some());
    assert!(!stored.is_terminal());

    let retry = pipeline.channel.receive(Queue::Retry).await.unwrap().unwrap();
    assert_eq!(retry.message.delivery_id, record.id);
    assert_eq!(retry.message.retry_count, 1);
    assert_eq!(retry.message.next_retry, stored.next_retry);
}

/// Primary attempt fails with budget left and its retry is queued, then
/// the primary message is redelivered.
#[tokio::test]
async fn redelivered_attempt_does_not_queue_a_second_retry() {
    let server = MockServer::start().await;
    let responder = ScriptedResponder::always(500);
    Mock::given(method("POST"))
        .respond_with(responder.clone())
        .mount(&server)
        .await;

    let pipeline = Pipeline::new();
    pipeline.register(webhook("w1", &format!("{}/hook", server.uri()), 3)).await;
    let record = pipeline
        .dispatcher
        .enqueue_delivery(&WebhookId::new("w1"), EVENT, json!({}))
        .await
        .unwrap();

    let envelope = pipeline.channel.receive(Queue::Primary).await.unwrap().unwrap();
    let duplicate = envelope.clone();
    assert!(pipeline.worker.handle_message(envelope).await.is_err());
    assert_eq!(pipeline.channel.published_count(Queue::Retry), 1);

    assert!(pipeline.worker.handle_message(duplicate).await.is_ok());
    assert_eq!(pipeline.channel.published_count(Queue::Retry), 1);
    assert_eq!(responder.count(), 1);

    let stored = pipeline.dispatcher.get_delivery(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts.len(), 1);
    assert!(pipeline.channel.unacked().await.is_empty());
}

#[tokio::test]
async fn redelivered_attempt_after_its_retry_ran_is_skipped() {
    let server = MockServer::start().await;
    let responder = ScriptedResponder::always(500);
    Mock::given(method("POST"))
        .respond_with(responder.clone())
        .mount(&server)
        .await;

    let pipeline = Pipeline::new();
    pipeline.register(webhook("w1", &format!("{}/hook", server.uri()), 3)).await;
    let record = pipeline
        .dispatcher
        .enqueue_delivery(&WebhookId::new("w1"), EVENT, json!({}))
        .await
        .unwrap();

    let primary = pipeline.channel.receive(Queue::Primary).await.unwrap().unwrap();
    let duplicate = primary.clone();
    let _ = pipeline.worker.handle_message(primary).await;

    let retry = pipeline.channel.receive(Queue::Retry).await.unwrap().unwrap();
    assert_eq!(retry.message.retry_count, 1);
    assert_eq!(
        pipeline.worker.handle_message(retry).await,
        Err(DeliveryError::ServerError { status: 500 })
    );
    assert_eq!(responder.count(), 2);

    // budget remains, so the stale copy must neither exhaust nor reschedule
    assert!(pipeline.worker.handle_message(duplicate).await.is_ok());
    assert_eq!(responder.count(), 2);
    assert_eq!(pipeline.channel.published_count(Queue::Retry), 2);

    let stored = pipeline.dispatcher.get_delivery(&record.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 1);
    assert!(stored.next_retry.is_some());
    assert_eq!(stored.attempts.len(), 2);
}

#[tokio::test]
async fn lost_retry_publish_is_recovered_on_redelivery() {
    let server = MockServer::start().await;
    let responder = ScriptedResponder::always(500);
    Mock::given(method("POST"))
        .respond_with(responder.clone())
        .mount(&server)
        .await;

    let pipeline = Pipeline::new();
    pipeline.register(webhook("w1", &format!("{}/hook", server.uri()), 3)).await;
    pipeline
        .dispatcher
        .enqueue_delivery(&WebhookId::new("w1"), EVENT, json!({}))
        .await
        .unwrap();

    // attempt recorded, but the worker died before publishing the retry
    let envelope = pipeline.channel.receive(Queue::Primary).await.unwrap().unwrap();
    let failure = pipeline
        .dispatcher
        .process_delivery(&envelope.message)
        .await
        .unwrap_err();
    assert!(failure.next_retry.is_some());

    assert!(pipeline.worker.handle_message(envelope).await.is_err());
    assert_eq!(responder.count(), 1);

    let retry = pipeline.channel.receive(Queue::Retry).await.unwrap().unwrap();
    assert_eq!(retry.message.retry_count, 1);
    assert_eq!(retry.message.next_retry, failure.next_retry);
}
