mod utils;

use std::time::Duration;

use case_events::{Event, EventType};
use chawk_webhooks::domain::ports::{DeliveryStore, SubscriptionStore};
use chawk_webhooks::infrastructure::memory_store::{
    InMemoryDeliveryStore, InMemorySubscriptionStore,
};
use chawk_webhooks::outbound::webhook::schemas::DeliveryUpdate;
use chawk_webhooks::outbound::webhook::{
    Delivery, DeliveryStatus, PayloadBuilder, Subscription, WebhookTemplate, delivery_id_for,
    verify_signature,
};
use serde_json::{Value, json};
use utils::Harness;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ORG: i64 = 42;

fn hook(server: &MockServer) -> Subscription {
    Subscription::new(ORG, "soc-bridge", format!("{}/hook", server.uri()))
        .subscribe_to([EventType::CASE_CREATED])
        .with_retry_backoff(Duration::from_millis(20))
}

fn statuses(delivery: &Delivery) -> Vec<DeliveryStatus> {
    delivery.history.iter().map(|t| t.status).collect()
}

#[tokio::test]
async fn signed_delivery_succeeds_first_time() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("X-Event-Type", "case.created"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let subscription = harness
        .subscriptions
        .register(hook(&server).with_secret("s3cret"))
        .unwrap();
    harness.manager.start().await.unwrap();

    let report = harness
        .manager
        .trigger_case_created(ORG, json!({"id": 3, "title": "Phishing"}), Some(9))
        .await
        .unwrap();
    assert_eq!(report.queued.len(), 1);

    let delivery = harness.settled(report.queued[0]).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(
        statuses(&delivery),
        [DeliveryStatus::Pending, DeliveryStatus::Sending, DeliveryStatus::Success]
    );
    let response = delivery.last_response.unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, "ok");

    let received = server.received_requests().await.unwrap();
    let request = &received[0];
    let signature = request.headers.get("X-Signature").unwrap().to_str().unwrap();
    assert!(verify_signature("s3cret", &request.body, signature).is_ok());
    assert!(verify_signature("other", &request.body, signature).is_err());
    assert_eq!(
        request.headers.get("X-Delivery-Id").unwrap().to_str().unwrap(),
        delivery.id.to_string()
    );

    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["event"], "case.created");
    assert_eq!(body["webhook"]["id"], subscription.id.to_string());
    assert_eq!(body["data"]["case"]["title"], "Phishing");

    let stats = harness
        .subscriptions
        .get_subscription(subscription.id)
        .await
        .unwrap()
        .unwrap()
        .stats;
    assert_eq!(stats.total_sent, 1);
    assert_eq!(stats.total_failed, 0);
    assert!(stats.last_success.is_some());

    harness.manager.stop().await;
}

#[tokio::test]
async fn transient_failures_are_retried_with_growing_delays() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .with_priority(2)
        .mount(&server)
        .await;

    let harness = Harness::new();
    harness.subscriptions.register(hook(&server)).unwrap();
    harness.manager.start().await.unwrap();

    let report = harness
        .manager
        .trigger_case_created(ORG, json!({"id": 1}), None)
        .await
        .unwrap();
    let delivery = harness.settled(report.queued[0]).await;

    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_count, 3);
    assert_eq!(delivery.last_response.map(|r| r.status_code), Some(204));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    let sends: Vec<_> = delivery
        .history
        .iter()
        .filter(|t| t.status == DeliveryStatus::Sending)
        .collect();
    assert_eq!(sends.iter().map(|t| t.attempt).collect::<Vec<_>>(), [1, 2, 3]);
    // Base 20ms, doubling per failed attempt.
    assert!(sends[1].at - sends[0].at >= time::Duration::milliseconds(20));
    assert!(sends[2].at - sends[1].at >= time::Duration::milliseconds(40));
    assert!(delivery.history.windows(2).all(|w| w[0].at <= w[1].at));

    harness.manager.stop().await;
}

#[tokio::test]
async fn exhausted_retries_abandon_the_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let subscription = harness
        .subscriptions
        .register(hook(&server).with_max_retries(2))
        .unwrap();
    harness.manager.start().await.unwrap();

    let report = harness
        .manager
        .trigger_case_created(ORG, json!({"id": 1}), None)
        .await
        .unwrap();
    let delivery = harness.settled(report.queued[0]).await;

    assert_eq!(delivery.status, DeliveryStatus::Abandoned);
    assert_eq!(delivery.attempt_count, 3);
    assert_eq!(delivery.last_response.as_ref().map(|r| r.status_code), Some(503));
    assert!(delivery.last_error.as_deref().unwrap().contains("3 attempt"));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    let stats = harness
        .subscriptions
        .get_subscription(subscription.id)
        .await
        .unwrap()
        .unwrap()
        .stats;
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.total_sent, 0);

    // Terminal deliveries never move again.
    let again = harness
        .deliveries
        .update_status(delivery.id, &DeliveryUpdate::sending(4))
        .await;
    assert!(again.is_err());

    harness.manager.stop().await;
}

#[tokio::test]
async fn slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let harness = Harness::new();
    harness
        .subscriptions
        .register(
            hook(&server)
                .with_timeout(Duration::from_millis(50))
                .with_max_retries(0),
        )
        .unwrap();
    harness.manager.start().await.unwrap();

    let report = harness
        .manager
        .trigger_case_created(ORG, json!({"id": 1}), None)
        .await
        .unwrap();
    let delivery = harness.settled(report.queued[0]).await;

    assert_eq!(delivery.status, DeliveryStatus::Abandoned);
    assert_eq!(delivery.attempt_count, 1);
    assert!(delivery.last_response.is_none());
    assert!(delivery.last_error.unwrap().contains("timeout"));

    harness.manager.stop().await;
}

#[tokio::test]
async fn disabling_a_subscription_abandons_its_pending_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let subscription = harness
        .subscriptions
        .register(hook(&server).with_retry_backoff(Duration::from_millis(300)))
        .unwrap();
    harness.manager.start().await.unwrap();

    let report = harness
        .manager
        .trigger_case_created(ORG, json!({"id": 1}), None)
        .await
        .unwrap();
    harness
        .wait_for(report.queued[0], |d| d.status == DeliveryStatus::Retrying)
        .await;
    harness
        .subscriptions
        .set_enabled(subscription.id, false)
        .unwrap();

    let delivery = harness.settled(report.queued[0]).await;
    assert_eq!(delivery.status, DeliveryStatus::Abandoned);
    assert_eq!(delivery.last_error.as_deref(), Some("subscription disabled"));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    harness.manager.stop().await;
}

#[tokio::test]
async fn only_matching_subscriptions_receive_the_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = Harness::new();
    harness
        .subscriptions
        .register(
            Subscription::new(ORG, "tasks", format!("{}/tasks", server.uri()))
                .subscribe_to([EventType::TASK_COMPLETED]),
        )
        .unwrap();
    harness
        .subscriptions
        .register(
            Subscription::new(ORG + 1, "elsewhere", format!("{}/other", server.uri()))
                .subscribe_all(),
        )
        .unwrap();
    harness.manager.start().await.unwrap();

    let report = harness
        .manager
        .trigger_case_created(ORG, json!({"id": 1}), None)
        .await
        .unwrap();
    assert_eq!(report.matched, 0);
    assert!(report.queued.is_empty());

    let report = harness
        .manager
        .trigger_task_completed(ORG, 1, json!({"id": 8, "title": "Triage"}), Some(2))
        .await
        .unwrap();
    let delivery = harness.settled(report.queued[0]).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.related.task_id, Some(8));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].url.path(), "/tasks");

    harness.manager.stop().await;
}

#[tokio::test]
async fn template_shapes_the_request() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/chat"))
        .and(header("X-Channel", "soc"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let template = WebhookTemplate {
        method: Some("put".to_string()),
        ..WebhookTemplate::new(r#"{"text": "{{ event_type }}: {{ event.case.title | upper }}"}"#)
            .with_url(format!("{}/chat", server.uri()))
            .with_header("X-Channel", "{{ config.channel }}")
            .with_config("channel", json!("soc"))
    };

    let harness = Harness::new();
    harness
        .subscriptions
        .register(hook(&server).with_template(template))
        .unwrap();
    harness.manager.start().await.unwrap();

    let report = harness
        .manager
        .trigger_case_created(ORG, json!({"id": 5, "title": "ransomware"}), None)
        .await
        .unwrap();
    let delivery = harness.settled(report.queued[0]).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);

    let received = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["text"], "case.created: RANSOMWARE");

    harness.manager.stop().await;
}

#[tokio::test]
async fn unfinished_deliveries_resume_after_restart() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let deliveries = InMemoryDeliveryStore::new();
    let subscriptions = InMemorySubscriptionStore::new();
    let subscription = subscriptions.register(hook(&server)).unwrap();
    let builder = PayloadBuilder::new("chawk-webhooks-tests");

    // Queued but never picked up.
    let queued = Event::new(EventType::CASE_CREATED, json!({"case": {"id": 1}}))
        .with_organization(ORG);
    let queued_id = delivery_id_for(queued.id, subscription.id);
    let request = builder.build(&subscription, &queued).unwrap();
    deliveries
        .create(&Delivery::pending(queued_id, &subscription, &queued, request))
        .await
        .unwrap();

    // Cut off mid-attempt.
    let interrupted = Event::new(EventType::CASE_CREATED, json!({"case": {"id": 2}}))
        .with_organization(ORG);
    let interrupted_id = delivery_id_for(interrupted.id, subscription.id);
    let request = builder.build(&subscription, &interrupted).unwrap();
    deliveries
        .create(&Delivery::pending(
            interrupted_id,
            &subscription,
            &interrupted,
            request,
        ))
        .await
        .unwrap();
    deliveries
        .update_status(interrupted_id, &DeliveryUpdate::sending(1))
        .await
        .unwrap();

    let harness = Harness::with_stores(deliveries, subscriptions);
    harness.manager.start().await.unwrap();

    let delivery = harness.settled(queued_id).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_count, 1);

    let delivery = harness.settled(interrupted_id).await;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_count, 2);
    assert!(statuses(&delivery).contains(&DeliveryStatus::Retrying));

    harness.manager.stop().await;
}

#[tokio::test]
async fn stopped_engine_refuses_events() {
    let harness = Harness::new();
    harness.manager.start().await.unwrap();
    harness.manager.stop().await;

    let result = harness
        .manager
        .trigger_case_created(ORG, json!({"id": 1}), None)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn unsendable_rendered_header_is_abandoned_without_an_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let subscription = harness
        .subscriptions
        .register(hook(&server).with_template(
            WebhookTemplate::new("{}").with_header("X-Case", "{{ event.case.title }}"),
        ))
        .unwrap();
    harness.manager.start().await.unwrap();

    let report = harness
        .manager
        .trigger_case_created(ORG, json!({"id": 1, "title": "a\u{1}b"}), None)
        .await
        .unwrap();
    assert!(report.queued.is_empty());
    assert_eq!(report.build_failed.len(), 1);

    let delivery = harness.settled(report.build_failed[0]).await;
    assert_eq!(delivery.status, DeliveryStatus::Abandoned);
    assert_eq!(delivery.attempt_count, 0);
    assert!(delivery.last_error.unwrap().contains("X-Case"));

    let stats = harness
        .subscriptions
        .get_subscription(subscription.id)
        .await
        .unwrap()
        .unwrap()
        .stats;
    assert!(stats.last_triggered.is_none());
    assert_eq!(stats.total_failed, 0);

    harness.manager.stop().await;
}
