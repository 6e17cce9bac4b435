#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::{Harness, harness, test_config, webhook, webhook_request};
use courier::{
    circuit::CircuitBreakerConfig,
    delivery::{CANCELLED_MESSAGE, DeliveryEvent},
    dispatcher::{CIRCUIT_OPEN_MESSAGE, DELIVERY_ID_HEADER, DispatcherConfig, EVENT_HEADER},
    store::{DeliveryRepository, WebhookRepository},
    time::{Clock, ManualClock},
    types::{
        AttemptErrorKind, CircuitState, DeliveryOutcome, DeliveryStatus, Webhook, WebhookStatus,
    },
};
use tokio::sync::broadcast;
use uuid::Uuid;
use wiremock::{
    Mock, MockServer, Request, Respond, ResponseTemplate,
    matchers::{header_exists, method, path},
};

const EVENT: &str = "order.created";

async fn register(h: &Harness, url: &str, max_retries: u32) -> Webhook {
    let mut req = webhook_request(Uuid::new_v4(), url, &[EVENT]);
    req.max_retries = Some(max_retries);
    let webhook = Webhook::register(req, h.clock.now());
    h.store.insert_webhook(&webhook).await.unwrap();
    webhook
}

fn cancelled_ids(events: &mut broadcast::Receiver<DeliveryEvent>) -> Vec<Uuid> {
    let mut ids = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DeliveryEvent::Cancelled { delivery_id, .. } = event {
            ids.push(delivery_id);
        }
    }
    ids.sort();
    ids
}

/// Answers 200 and moves the test clock forward, as a slow target would.
struct SlowTarget {
    clock: ManualClock,
    per_request: ChronoDuration,
}

impl Respond for SlowTarget {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.clock.advance(self.per_request);
        ResponseTemplate::new(200)
    }
}

#[tokio::test]
async fn happy_path_delivers_and_records_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header_exists(EVENT_HEADER))
        .and(header_exists(DELIVERY_ID_HEADER))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(test_config()).await;
    let hook = register(&h, &format!("{}/hook", server.uri()), 3).await;
    let mut events = h.dispatcher.events().subscribe();

    let created = h
        .dispatcher
        .emit(hook.workspace_id, EVENT, r#"{"order_id":42}"#)
        .await
        .unwrap();
    assert_eq!(created.len(), 1);

    let report = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.delivered, 1);

    let delivery = h.store.get(created[0].id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.http_status_code, Some(200));
    assert_eq!(delivery.response_body.as_deref(), Some("ok"));
    assert!(delivery.delivered_at.is_some());

    let attempts = h.store.list_attempts(delivery.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].success);

    let webhook = h.store.get_webhook(hook.id).await.unwrap().unwrap();
    assert_eq!(webhook.success_count, 1);
    assert_eq!(webhook.last_delivery_status, Some(DeliveryOutcome::Success));

    assert!(matches!(events.recv().await.unwrap(), DeliveryEvent::Created { .. }));
    assert!(matches!(events.recv().await.unwrap(), DeliveryEvent::Succeeded { .. }));
}

#[tokio::test]
async fn emit_skips_unsubscribed_and_rejects_bad_json() {
    let h = harness(test_config()).await;
    let hook = register(&h, "https://example.invalid/hook", 3).await;

    let none = h
        .dispatcher
        .emit(hook.workspace_id, "order.paid", "{}")
        .await
        .unwrap();
    assert!(none.is_empty());

    let invalid = h.dispatcher.emit(hook.workspace_id, EVENT, "{not json").await;
    assert!(invalid.is_err());
}

#[tokio::test]
async fn failed_attempt_retries_after_backoff_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(test_config()).await;
    let hook = register(&h, &server.uri(), 3).await;
    let created = h.dispatcher.emit(hook.workspace_id, EVENT, "{}").await.unwrap();
    let t0 = h.clock.now();

    let report = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(report.retried, 1);

    let pending = h.store.get(created[0].id).await.unwrap().unwrap();
    assert_eq!(pending.status, DeliveryStatus::Pending);
    assert_eq!(pending.attempt_count, 1);
    assert_eq!(pending.http_status_code, Some(500));
    assert_eq!(pending.error_message.as_deref(), Some("HTTP 500"));
    assert_eq!(pending.next_retry_at, Some(t0 + ChronoDuration::seconds(1)));

    let early = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(early.claimed, 0);

    h.clock.advance(ChronoDuration::seconds(1));
    let report = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(report.delivered, 1);

    let delivered = h.store.get(created[0].id).await.unwrap().unwrap();
    assert_eq!(delivered.status, DeliveryStatus::Delivered);
    assert_eq!(delivered.attempt_count, 1);
    assert!(delivered.next_retry_at.is_none());
    assert_eq!(h.store.list_attempts(delivered.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn retries_exhaust_into_failed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let h = harness(test_config()).await;
    let hook = register(&h, &server.uri(), 2).await;
    let created = h.dispatcher.emit(hook.workspace_id, EVENT, "{}").await.unwrap();

    h.dispatcher.process_batch("worker-1").await.unwrap();
    h.clock.advance(ChronoDuration::seconds(1));
    let report = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(report.failed, 1);

    let failed = h.store.get(created[0].id).await.unwrap().unwrap();
    assert_eq!(failed.status, DeliveryStatus::Failed);
    assert_eq!(failed.attempt_count, 2);
    assert!(failed.next_retry_at.is_none());

    h.clock.advance(ChronoDuration::minutes(10));
    let idle = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(idle.claimed, 0);

    let webhook = h.store.get_webhook(hook.id).await.unwrap().unwrap();
    assert_eq!(webhook.failure_count, 2);
    assert_eq!(webhook.last_error.as_deref(), Some("HTTP 503"));
}

#[tokio::test]
async fn open_breaker_defers_without_spending_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(5)
        .mount(&server)
        .await;

    let h = harness(test_config()).await;
    let hook = register(&h, &server.uri(), 5).await;
    let mut ids = Vec::new();
    for _ in 0..6 {
        let created = h.dispatcher.emit(hook.workspace_id, EVENT, "{}").await.unwrap();
        ids.push(created[0].id);
        h.clock.advance(ChronoDuration::milliseconds(1));
    }

    let report = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(report.claimed, 6);
    assert_eq!(report.retried, 5);
    assert_eq!(report.deferred, 1);

    let breaker = h.dispatcher.registry().get(&hook.id.to_string());
    assert_eq!(breaker.state(), CircuitState::Open);

    let shielded = h.store.get(ids[5]).await.unwrap().unwrap();
    assert_eq!(shielded.status, DeliveryStatus::Pending);
    assert_eq!(shielded.attempt_count, 0);
    assert!(h.store.list_attempts(ids[5]).await.unwrap().is_empty());

    // The breaker still rejects, so the next poll leaves the row alone.
    let again = h.dispatcher.process_batch("worker-2").await.unwrap();
    assert_eq!(again.claimed, 0);
    assert!(again.is_idle());
}

#[tokio::test]
async fn starved_delivery_fails_behind_open_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let circuit = CircuitBreakerConfig {
        recovery_timeout: Duration::from_secs(600),
        ..CircuitBreakerConfig::default()
    };
    let config = DispatcherConfig {
        starvation_threshold: Duration::from_secs(120),
        circuit,
        ..test_config()
    };
    let h = harness(config).await;
    let hook = register(&h, &server.uri(), 3).await;
    h.dispatcher.registry().force_open(&hook.id.to_string());
    let created = h.dispatcher.emit(hook.workspace_id, EVENT, "{}").await.unwrap();

    let skipped = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(skipped.claimed, 0);

    h.clock.advance(ChronoDuration::seconds(121));
    let report = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(report.retried, 1);

    let delivery = h.store.get(created[0].id).await.unwrap().unwrap();
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(delivery.error_message.as_deref(), Some(CIRCUIT_OPEN_MESSAGE));

    let attempts = h.store.list_attempts(delivery.id).await.unwrap();
    assert_eq!(attempts[0].error_kind, Some(AttemptErrorKind::CircuitOpen));
}

#[tokio::test]
async fn paused_webhook_cancels_pending_deliveries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(test_config()).await;
    let hook = register(&h, &server.uri(), 3).await;
    let created = h.dispatcher.emit(hook.workspace_id, EVENT, "{}").await.unwrap();
    h.store
        .set_webhook_status(hook.id, WebhookStatus::Paused, h.clock.now())
        .await
        .unwrap();

    let report = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(report.cancelled, 1);

    let cancelled = h.store.get(created[0].id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, DeliveryStatus::Failed);
    assert_eq!(cancelled.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(cancelled.attempt_count, 0);

    let none = h.dispatcher.emit(hook.workspace_id, EVENT, "{}").await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn health_sweep_disables_failing_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = DispatcherConfig {
        health_min_samples: 3,
        health_window: 10,
        health_failure_threshold: 0.5,
        ..test_config()
    };
    let h = harness(config).await;
    let failing = register(&h, &server.uri(), 3).await;
    let quiet = register(&h, &server.uri(), 3).await;

    for _ in 0..3 {
        h.dispatcher.emit(failing.workspace_id, EVENT, "{}").await.unwrap();
    }
    h.dispatcher.emit(quiet.workspace_id, EVENT, "{}").await.unwrap();
    h.dispatcher.process_batch("worker-1").await.unwrap();

    let metrics = h.dispatcher.health_metrics(failing.id).await.unwrap();
    assert_eq!(metrics.sample_size, 3);
    assert_eq!(metrics.consecutive_failures, 3);
    assert!(metrics.recent_success_rate.abs() < f64::EPSILON);

    let mut events = h.dispatcher.events().subscribe();
    let disabled = h.dispatcher.run_health_sweep().await.unwrap();
    assert_eq!(disabled, vec![failing.id]);
    assert_eq!(cancelled_ids(&mut events).len(), 3);

    let webhook = h.store.get_webhook(failing.id).await.unwrap().unwrap();
    assert_eq!(webhook.status, WebhookStatus::Disabled);
    let quiet_after = h.store.get_webhook(quiet.id).await.unwrap().unwrap();
    assert_eq!(quiet_after.status, WebhookStatus::Active);

    h.clock.advance(ChronoDuration::minutes(5));
    let report = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(report.cancelled + report.delivered + report.failed, 0);
    assert!(h.dispatcher.health_metrics(Uuid::new_v4()).await.is_err());
}

#[tokio::test]
async fn worker_pool_delivers_and_shuts_down() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = DispatcherConfig {
        worker_count: 2,
        poll_interval: Duration::from_millis(20),
        ..test_config()
    };
    let h = harness(config).await;
    let hook = webhook(Uuid::new_v4(), &server.uri(), &[EVENT], h.clock.now());
    h.store.insert_webhook(&hook).await.unwrap();
    let created = h.dispatcher.emit(hook.workspace_id, EVENT, "{}").await.unwrap();

    let pool = courier::dispatcher::WorkerPool::start(std::sync::Arc::clone(&h.dispatcher));

    let mut delivered = false;
    for _ in 0..100 {
        let delivery = h.store.get(created[0].id).await.unwrap().unwrap();
        if delivery.status == DeliveryStatus::Delivered {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(delivered);

    pool.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn pausing_through_dispatcher_publishes_cancellations() {
    let h = harness(test_config()).await;
    let hook = register(&h, "https://example.invalid/hook", 3).await;
    let mut expected = Vec::new();
    for _ in 0..2 {
        let created = h.dispatcher.emit(hook.workspace_id, EVENT, "{}").await.unwrap();
        expected.push(created[0].id);
    }
    expected.sort();
    let mut events = h.dispatcher.events().subscribe();

    let cancelled = h
        .dispatcher
        .set_webhook_status(hook.id, WebhookStatus::Paused)
        .await
        .unwrap();

    assert_eq!(cancelled, 2);
    assert_eq!(cancelled_ids(&mut events), expected);
    for id in &expected {
        let delivery = h.store.get(*id).await.unwrap().unwrap();
        assert_eq!(delivery.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    }

    assert_eq!(h.dispatcher.delete_webhook(hook.id).await.unwrap(), 0);
    assert!(cancelled_ids(&mut events).is_empty());
}

#[tokio::test]
async fn expired_lease_mid_batch_is_not_attempted_twice() {
    let h = harness(DispatcherConfig {
        lease_duration: Duration::from_secs(10),
        ..test_config()
    })
    .await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(SlowTarget {
            clock: h.clock.clone(),
            per_request: ChronoDuration::seconds(8),
        })
        .expect(3)
        .mount(&server)
        .await;

    let hook = register(&h, &server.uri(), 3).await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        let created = h.dispatcher.emit(hook.workspace_id, EVENT, "{}").await.unwrap();
        ids.push(created[0].id);
        h.clock.advance(ChronoDuration::milliseconds(1));
    }

    // Two attempts push the clock past the batch lease; the third row must
    // be given up rather than sent under an expired lease.
    let first = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(first.claimed, 3);
    assert_eq!(first.delivered, 2);
    assert_eq!(first.lease_lost, 1);

    let untouched = h.store.get(ids[2]).await.unwrap().unwrap();
    assert_eq!(untouched.status, DeliveryStatus::Pending);
    assert_eq!(untouched.attempt_count, 0);

    let second = h.dispatcher.process_batch("worker-2").await.unwrap();
    assert_eq!(second.claimed, 1);
    assert_eq!(second.delivered, 1);

    for id in &ids {
        assert_eq!(h.store.list_attempts(*id).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn open_breaker_on_one_webhook_does_not_hold_back_others() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/blocked"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/healthy"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = DispatcherConfig {
        circuit: CircuitBreakerConfig {
            recovery_timeout: Duration::from_secs(600),
            ..CircuitBreakerConfig::default()
        },
        ..test_config()
    };
    let h = harness(config).await;
    let blocked = register(&h, &format!("{}/blocked", server.uri()), 3).await;
    let healthy = register(&h, &format!("{}/healthy", server.uri()), 3).await;
    h.dispatcher.registry().force_open(&blocked.id.to_string());

    for _ in 0..12 {
        h.dispatcher.emit(blocked.workspace_id, EVENT, "{}").await.unwrap();
        h.clock.advance(ChronoDuration::milliseconds(1));
    }
    let created = h.dispatcher.emit(healthy.workspace_id, EVENT, "{}").await.unwrap();

    let report = h.dispatcher.process_batch("worker-1").await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.delivered, 1);

    let delivery = h.store.get(created[0].id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
}
