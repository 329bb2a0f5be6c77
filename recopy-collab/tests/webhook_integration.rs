//! Webhook delivery against a live HTTP endpoint.

use chrono::{Duration as ChronoDuration, Utc};
use recopy_collab::config::DispatcherConfig;
use recopy_collab::conflict::{CommitRequest, ConflictDetector};
use recopy_collab::model::ElementKey;
use recopy_collab::session::{InMemorySessions, SessionRequest};
use recopy_collab::storage::{InMemoryStore, WebhookStore};
use recopy_collab::webhook::{
    verify_signature, NewWebhook, Webhook, WebhookDispatcher, WebhookEvent, WebhookPayload,
    WebhookRegistry, HEADER_DELIVERY, HEADER_EVENT, HEADER_RETRY, HEADER_SIGNATURE, HEADER_TEST,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

struct Harness {
    store: Arc<InMemoryStore>,
    registry: WebhookRegistry,
    dispatcher: WebhookDispatcher,
    site_id: Uuid,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let config = DispatcherConfig {
            timeout: Duration::from_secs(5),
            test_timeout: Duration::from_secs(5),
            ..DispatcherConfig::default()
        };
        let registry = WebhookRegistry::new(store.clone(), config.default_max_failures);
        let dispatcher = WebhookDispatcher::new(store.clone(), config).unwrap();
        Self {
            store,
            registry,
            dispatcher,
            site_id: Uuid::new_v4(),
        }
    }

    fn register(&self, server: &MockServer, events: Vec<WebhookEvent>, max_failures: u32) -> Webhook {
        self.registry
            .create_webhook(NewWebhook {
                site_id: self.site_id,
                url: format!("{}/hook", server.uri()),
                events,
                max_failures: Some(max_failures),
            })
            .unwrap()
    }
}

async fn mount_status(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

async fn received(server: &MockServer) -> Vec<Request> {
    server.received_requests().await.unwrap_or_default()
}

fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn test_delivery_is_signed_and_logged() {
    let server = MockServer::start().await;
    mount_status(&server, 200).await;
    let h = Harness::new();
    let hook = h.register(&server, vec![WebhookEvent::ContentUpdated], 5);

    let deliveries = h
        .dispatcher
        .trigger_event_and_wait(
            h.site_id,
            WebhookEvent::ContentUpdated,
            json!({ "elementId": "hero-title", "content": "Hi there" }),
        )
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);
    let delivery = &deliveries[0];
    assert!(delivery.success);
    assert_eq!(delivery.response_status, Some(200));
    assert_eq!(delivery.attempt, 1);
    assert!(!delivery.is_test);

    let requests = received(&server).await;
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(header(request, HEADER_EVENT), Some("content.updated"));
    assert_eq!(
        header(request, HEADER_DELIVERY),
        Some(delivery.id.to_string().as_str())
    );
    assert_eq!(header(request, "content-type"), Some("application/json"));
    assert!(header(request, HEADER_RETRY).is_none());

    let signature = header(request, HEADER_SIGNATURE).unwrap();
    assert!(verify_signature(&request.body, signature, &hook.secret));
    assert!(!verify_signature(&request.body, signature, "some-other-secret"));

    let payload: WebhookPayload = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(payload.event, "content.updated");
    assert_eq!(payload.site_id, h.site_id);
    assert_eq!(payload.data["elementId"], "hero-title");
    assert_eq!(delivery.request_body.decompress().unwrap(), request.body);

    let log = h.registry.list_deliveries(hook.id, 10).unwrap();
    assert_eq!(log, deliveries);
    let stored = h.registry.get_webhook(hook.id).unwrap();
    assert_eq!(stored.failure_count, 0);
    assert!(stored.last_success_at.is_some());
    assert_eq!(h.store.pending_retries().unwrap(), 0);
}

#[tokio::test]
async fn test_circuit_breaker_disables_after_consecutive_failures() {
    let server = MockServer::start().await;
    mount_status(&server, 500).await;
    let h = Harness::new();
    let hook = h.register(&server, vec![WebhookEvent::ContentUpdated], 5);

    for round in 1..=5u32 {
        let deliveries = h
            .dispatcher
            .trigger_event_and_wait(h.site_id, WebhookEvent::ContentUpdated, json!({ "round": round }))
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert!(!deliveries[0].success);
        assert_eq!(deliveries[0].response_status, Some(500));
        assert_eq!(deliveries[0].error_message.as_deref(), Some("HTTP 500 Internal Server Error"));
    }

    let stored = h.registry.get_webhook(hook.id).unwrap();
    assert!(!stored.is_active);
    assert_eq!(stored.failure_count, 5);

    // A sixth trigger makes no attempt at all
    let deliveries = h
        .dispatcher
        .trigger_event_and_wait(h.site_id, WebhookEvent::ContentUpdated, json!({ "round": 6 }))
        .await
        .unwrap();
    assert!(deliveries.is_empty());
    assert_eq!(received(&server).await.len(), 5);
    assert_eq!(h.registry.list_deliveries(hook.id, 100).unwrap().len(), 5);

    // Retries queued before the breaker tripped are discarded
    assert_eq!(h.store.pending_retries().unwrap(), 4);
    let attempted = h
        .dispatcher
        .run_due_retries(Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(attempted, 0);
    assert_eq!(h.store.pending_retries().unwrap(), 0);
    assert_eq!(received(&server).await.len(), 5);

    // Re-enabling resumes deliveries
    h.registry.reenable_webhook(hook.id).unwrap();
    let deliveries = h
        .dispatcher
        .trigger_event_and_wait(h.site_id, WebhookEvent::ContentUpdated, json!({ "round": 7 }))
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);
}

#[tokio::test]
async fn test_failed_delivery_is_retried_with_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_status(&server, 200).await;

    let h = Harness::new();
    let hook = h.register(&server, vec![WebhookEvent::ContentCreated], 5);

    let before = Utc::now();
    let deliveries = h
        .dispatcher
        .trigger_event_and_wait(h.site_id, WebhookEvent::ContentCreated, json!({ "elementId": "cta" }))
        .await
        .unwrap();
    assert!(!deliveries[0].success);
    assert_eq!(h.registry.get_webhook(hook.id).unwrap().failure_count, 1);

    // Not due yet: the first retry waits two backoff units
    let job = h
        .store
        .due_retries(Utc::now() + ChronoDuration::hours(1), 10)
        .unwrap()
        .remove(0);
    assert_eq!(job.attempt, 2);
    assert!(job.due_at >= before + ChronoDuration::seconds(2));
    assert_eq!(h.dispatcher.run_due_retries(Utc::now()).await.unwrap(), 0);

    let attempted = h
        .dispatcher
        .run_due_retries(Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(attempted, 1);
    assert_eq!(h.store.pending_retries().unwrap(), 0);

    let requests = received(&server).await;
    assert_eq!(requests.len(), 2);
    assert!(header(&requests[0], HEADER_RETRY).is_none());
    assert_eq!(header(&requests[1], HEADER_RETRY), Some("true"));
    assert_eq!(requests[0].body, requests[1].body);

    let log = h.registry.list_deliveries(hook.id, 10).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].attempt, 2);
    assert!(log[0].success);
    assert_eq!(h.registry.get_webhook(hook.id).unwrap().failure_count, 0);
}

#[tokio::test]
async fn test_send_test_leaves_failure_count_alone() {
    let server = MockServer::start().await;
    mount_status(&server, 500).await;
    let h = Harness::new();
    let hook = h.register(&server, vec![WebhookEvent::SiteUpdated], 1);

    let delivery = h.dispatcher.send_test(hook.id).await.unwrap();
    assert!(delivery.is_test);
    assert!(!delivery.success);

    let requests = received(&server).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(header(&requests[0], HEADER_TEST), Some("true"));
    assert_eq!(header(&requests[0], HEADER_EVENT), Some("webhook.test"));

    let stored = h.registry.get_webhook(hook.id).unwrap();
    assert!(stored.is_active);
    assert_eq!(stored.failure_count, 0);
    assert_eq!(h.store.pending_retries().unwrap(), 0);
    assert_eq!(h.registry.list_deliveries(hook.id, 10).unwrap(), vec![delivery]);
}

#[tokio::test]
async fn test_only_subscribed_webhooks_receive_events() {
    let server = MockServer::start().await;
    mount_status(&server, 200).await;
    let h = Harness::new();
    h.register(&server, vec![WebhookEvent::ContentDeleted], 5);

    let started = h
        .dispatcher
        .trigger_event(h.site_id, WebhookEvent::ContentUpdated, json!({}))
        .unwrap();
    assert_eq!(started, 0);

    let other_site = h
        .dispatcher
        .trigger_event(Uuid::new_v4(), WebhookEvent::ContentDeleted, json!({}))
        .unwrap();
    assert_eq!(other_site, 0);
    assert!(received(&server).await.is_empty());
}

#[tokio::test]
async fn test_commit_fires_content_webhook() {
    let server = MockServer::start().await;
    mount_status(&server, 204).await;
    let h = Harness::new();
    h.register(
        &server,
        vec![WebhookEvent::ContentCreated, WebhookEvent::ContentUpdated],
        5,
    );

    let sessions = Arc::new(InMemorySessions::new());
    let session = sessions
        .issue(h.site_id, Uuid::new_v4(), "alice@example.com", ChronoDuration::minutes(5))
        .unwrap();
    let detector = ConflictDetector::new(h.store.clone(), sessions)
        .with_listener(Arc::new(h.dispatcher.clone()));

    let key = ElementKey::new(h.site_id, "hero-title");
    let request = SessionRequest::new(session.token.clone(), h.site_id);
    detector
        .commit(&request, &CommitRequest::new(&key, "Welcome!").with_selector("h1.hero"))
        .unwrap();

    // Delivery happens in the background
    let mut requests = Vec::new();
    for _ in 0..100 {
        requests = received(&server).await;
        if !requests.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(requests.len(), 1);
    assert_eq!(header(&requests[0], HEADER_EVENT), Some("content.created"));

    let payload: WebhookPayload = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(payload.data["elementId"], "hero-title");
    assert_eq!(payload.data["content"], "Welcome!");
    assert_eq!(payload.data["selector"], "h1.hero");
    assert_eq!(payload.data["userId"], session.user_id.to_string());
}
