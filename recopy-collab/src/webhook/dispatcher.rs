//! Signed HTTP delivery with logging, retries and a circuit breaker.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use reqwest::header::CONTENT_TYPE;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::retry::Backoff;
use super::signature::sign_payload;
use super::{
    RetryJob, Webhook, WebhookDelivery, WebhookError, WebhookEvent, WebhookPayload,
    HEADER_DELIVERY, HEADER_EVENT, HEADER_RETRY, HEADER_SIGNATURE, HEADER_TEST,
};
use crate::config::DispatcherConfig;
use crate::conflict::{CommitEvent, CommitListener, ElementChange};
use crate::storage::{CompressedBody, WebhookStore};

/// Longest response body excerpt kept in the delivery log.
const RESPONSE_EXCERPT_BYTES: usize = 1024;

/// Event name carried by `send_test` payloads.
pub const TEST_EVENT: &str = "webhook.test";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    Initial,
    Retry,
    Test,
}

/// Fans events out to subscribed webhooks.
#[derive(Clone)]
pub struct WebhookDispatcher {
    store: Arc<dyn WebhookStore>,
    http: reqwest::Client,
    config: DispatcherConfig,
    backoff: Backoff,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn WebhookStore>, config: DispatcherConfig) -> Result<Self, WebhookError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| WebhookError::Http(e.to_string()))?;
        Ok(Self {
            store,
            http,
            backoff: Backoff::from_config(&config),
            config,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Queue `event` for every active subscribed webhook of the site and
    /// return immediately with the number of deliveries started.
    ///
    /// Must be called from within a tokio runtime when any webhook matches.
    pub fn trigger_event(
        &self,
        site_id: Uuid,
        event: WebhookEvent,
        data: serde_json::Value,
    ) -> Result<usize, WebhookError> {
        let (targets, body) = self.prepare(site_id, event, data)?;
        if targets.is_empty() {
            return Ok(0);
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| WebhookError::Runtime(e.to_string()))?;

        let count = targets.len();
        let this = self.clone();
        handle.spawn(async move {
            this.fan_out(targets, event, body).await;
        });
        log::debug!("queued {event} for {count} webhooks of site {site_id}");
        Ok(count)
    }

    /// Like [`trigger_event`](Self::trigger_event) but waits for every
    /// initial attempt and returns their log entries.
    pub async fn trigger_event_and_wait(
        &self,
        site_id: Uuid,
        event: WebhookEvent,
        data: serde_json::Value,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        let (targets, body) = self.prepare(site_id, event, data)?;
        Ok(self.fan_out(targets, event, body).await)
    }

    fn prepare(
        &self,
        site_id: Uuid,
        event: WebhookEvent,
        data: serde_json::Value,
    ) -> Result<(Vec<Webhook>, Arc<[u8]>), WebhookError> {
        let targets: Vec<Webhook> = self
            .store
            .list_webhooks(site_id)?
            .into_iter()
            .filter(|webhook| webhook.accepts(event))
            .collect();
        let body = WebhookPayload::new(event.as_str(), site_id, data).to_body()?;
        Ok((targets, Arc::from(body)))
    }

    async fn fan_out(
        &self,
        targets: Vec<Webhook>,
        event: WebhookEvent,
        body: Arc<[u8]>,
    ) -> Vec<WebhookDelivery> {
        let attempts = targets.iter().map(|webhook| {
            self.deliver(webhook, event.as_str(), &body, 1, AttemptKind::Initial)
        });
        join_all(attempts)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(delivery) => Some(delivery),
                Err(e) => {
                    log::error!("webhook delivery bookkeeping failed: {e}");
                    None
                }
            })
            .collect()
    }

    /// Deliver a synthetic `webhook.test` event.
    ///
    /// Logged with `is_test`; the failure counter is left alone.
    pub async fn send_test(&self, webhook_id: Uuid) -> Result<WebhookDelivery, WebhookError> {
        let webhook = self
            .store
            .get_webhook(webhook_id)?
            .ok_or(WebhookError::NotFound(webhook_id))?;
        let data = json!({
            "webhookId": webhook.id,
            "message": "This is a test delivery from ReCopyFast",
        });
        let body = WebhookPayload::new(TEST_EVENT, webhook.site_id, data).to_body()?;
        self.deliver(&webhook, TEST_EVENT, &body, 1, AttemptKind::Test)
            .await
    }

    /// Run every retry job due at `now`. Returns the number of attempts made.
    pub async fn run_due_retries(&self, now: DateTime<Utc>) -> Result<usize, WebhookError> {
        let jobs = self.store.due_retries(now, self.config.retry_batch_size)?;
        let mut runnable = Vec::with_capacity(jobs.len());

        for job in jobs {
            match self.store.get_webhook(job.webhook_id)? {
                Some(webhook) if webhook.is_active => runnable.push((webhook, job)),
                Some(_) => {
                    log::info!(
                        "dropping retry {} for disabled webhook {}",
                        job.id,
                        job.webhook_id
                    );
                    self.store.remove_retry(&job)?;
                }
                None => {
                    log::info!("dropping retry {} for deleted webhook {}", job.id, job.webhook_id);
                    self.store.remove_retry(&job)?;
                }
            }
        }

        let attempts = runnable
            .iter()
            .map(|(webhook, job)| self.retry_one(webhook, job));

        let mut attempted = 0;
        for result in join_all(attempts).await {
            match result {
                Ok(_) => attempted += 1,
                Err(e) => log::error!("webhook retry failed: {e}"),
            }
        }
        Ok(attempted)
    }

    async fn retry_one(&self, webhook: &Webhook, job: &RetryJob) -> Result<WebhookDelivery, WebhookError> {
        let body = job.body.decompress()?;
        let delivery = self
            .deliver(webhook, &job.event, &body, job.attempt, AttemptKind::Retry)
            .await;
        self.store.remove_retry(job)?;
        delivery
    }

    /// One attempt: POST, log, then update the breaker or schedule a retry.
    async fn deliver(
        &self,
        webhook: &Webhook,
        event: &str,
        body: &[u8],
        attempt: u32,
        kind: AttemptKind,
    ) -> Result<WebhookDelivery, WebhookError> {
        let delivery = self.post(webhook, event, body, attempt, kind).await;
        self.store.append_delivery(&delivery)?;

        if kind == AttemptKind::Test {
            return Ok(delivery);
        }

        let now = delivery.delivered_at;
        if delivery.success {
            self.store
                .modify_webhook(webhook.id, &mut |w: &mut Webhook| w.record_success(now))?;
            log::debug!("webhook {} accepted {event} (attempt {attempt})", webhook.id);
            return Ok(delivery);
        }

        let mut tripped = false;
        let updated = self
            .store
            .modify_webhook(webhook.id, &mut |w: &mut Webhook| tripped = w.record_failure(now))?;

        match updated {
            None => {}
            Some(w) if tripped => log::error!(
                "webhook {} disabled after {} consecutive failures",
                w.id,
                w.failure_count
            ),
            Some(w) if w.is_active => {
                let delay = self.backoff.delay_for(attempt);
                let job = RetryJob {
                    id: Uuid::new_v4(),
                    webhook_id: w.id,
                    event: event.to_string(),
                    body: CompressedBody::compress(body),
                    attempt: attempt + 1,
                    due_at: now + chrono::Duration::milliseconds(delay.as_millis() as i64),
                    created_at: now,
                };
                self.store.put_retry(&job)?;
                log::warn!(
                    "webhook {} failed {event} (attempt {attempt}), retrying in {delay:?}",
                    w.id
                );
            }
            Some(_) => {}
        }
        Ok(delivery)
    }

    async fn post(
        &self,
        webhook: &Webhook,
        event: &str,
        body: &[u8],
        attempt: u32,
        kind: AttemptKind,
    ) -> WebhookDelivery {
        let id = Uuid::new_v4();
        let timeout = match kind {
            AttemptKind::Test => self.config.test_timeout,
            _ => self.config.timeout,
        };
        let started = Instant::now();
        let result = self.send(webhook, id, event, body, kind, timeout).await;

        let mut delivery = WebhookDelivery {
            id,
            webhook_id: webhook.id,
            event: event.to_string(),
            attempt,
            is_test: kind == AttemptKind::Test,
            request_body: CompressedBody::compress(body),
            response_status: None,
            response_time_ms: started.elapsed().as_millis() as u64,
            response_body: None,
            error_message: None,
            success: false,
            delivered_at: Utc::now(),
        };
        match result {
            Ok((status, text)) => {
                delivery.response_status = Some(status.as_u16());
                delivery.success = status.is_success();
                delivery.response_body = Some(excerpt(text));
                if !delivery.success {
                    delivery.error_message = Some(format!("HTTP {status}"));
                }
            }
            Err(message) => delivery.error_message = Some(message),
        }
        delivery
    }

    async fn send(
        &self,
        webhook: &Webhook,
        delivery_id: Uuid,
        event: &str,
        body: &[u8],
        kind: AttemptKind,
        timeout: Duration,
    ) -> Result<(reqwest::StatusCode, String), String> {
        let signature = sign_payload(body, &webhook.secret).map_err(|e| e.to_string())?;
        let mut request = self
            .http
            .post(&webhook.url)
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(HEADER_EVENT, event)
            .header(HEADER_SIGNATURE, signature)
            .header(HEADER_DELIVERY, delivery_id.to_string())
            .body(body.to_vec());
        request = match kind {
            AttemptKind::Initial => request,
            AttemptKind::Retry => request.header(HEADER_RETRY, "true"),
            AttemptKind::Test => request.header(HEADER_TEST, "true"),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                format!("timed out after {timeout:?}")
            } else {
                e.to_string()
            }
        })?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }
}

impl CommitListener for WebhookDispatcher {
    fn on_commit(&self, event: &CommitEvent) {
        let element = &event.element;
        let (kind, data) = commit_payload(event);
        if let Err(e) = self.trigger_event(element.site_id, kind, data) {
            log::error!(
                "could not dispatch {kind} for {}: {e}",
                element.key()
            );
        }
    }
}

fn commit_payload(event: &CommitEvent) -> (WebhookEvent, serde_json::Value) {
    let kind = match event.change {
        ElementChange::Created => WebhookEvent::ContentCreated,
        ElementChange::Updated => WebhookEvent::ContentUpdated,
        ElementChange::Deleted => WebhookEvent::ContentDeleted,
    };
    let element = &event.element;
    let data = json!({
        "elementId": element.element_id,
        "language": element.language,
        "variant": element.variant,
        "selector": element.selector,
        "content": element.current_content,
        "previousContent": event.previous_content,
        "version": element.version(),
        "userId": event.user_id,
    });
    (kind, data)
}

fn excerpt(mut text: String) -> String {
    if text.len() > RESPONSE_EXCERPT_BYTES {
        let mut end = RESPONSE_EXCERPT_BYTES;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentElement, ElementKey};
    use crate::storage::InMemoryStore;

    fn event(change: ElementChange) -> CommitEvent {
        let key = ElementKey::new(Uuid::new_v4(), "hero-title");
        CommitEvent {
            change,
            element: ContentElement::new(&key, "h1.hero", "Welcome"),
            previous_content: Some("Hello".into()),
            user_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_commit_events_map_to_webhook_events() {
        assert_eq!(commit_payload(&event(ElementChange::Created)).0, WebhookEvent::ContentCreated);
        assert_eq!(commit_payload(&event(ElementChange::Updated)).0, WebhookEvent::ContentUpdated);
        assert_eq!(commit_payload(&event(ElementChange::Deleted)).0, WebhookEvent::ContentDeleted);
    }

    #[test]
    fn test_commit_payload_fields() {
        let event = event(ElementChange::Updated);
        let (_, data) = commit_payload(&event);
        assert_eq!(data["elementId"], "hero-title");
        assert_eq!(data["language"], "en");
        assert_eq!(data["variant"], "default");
        assert_eq!(data["selector"], "h1.hero");
        assert_eq!(data["content"], "Welcome");
        assert_eq!(data["previousContent"], "Hello");
        assert_eq!(data["userId"], event.user_id.to_string());
        assert_eq!(data["version"], event.element.version().0);
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("ok".into()), "ok");
        let long = "é".repeat(RESPONSE_EXCERPT_BYTES);
        let cut = excerpt(long);
        assert!(cut.len() <= RESPONSE_EXCERPT_BYTES);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_trigger_without_subscribers_needs_no_runtime() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = WebhookDispatcher::new(store, DispatcherConfig::default()).unwrap();
        let started = dispatcher
            .trigger_event(Uuid::new_v4(), WebhookEvent::ContentUpdated, json!({}))
            .unwrap();
        assert_eq!(started, 0);
    }

    #[test]
    fn test_trigger_outside_runtime_is_an_error() {
        let store = Arc::new(InMemoryStore::new());
        let hook = Webhook::new(
            Uuid::new_v4(),
            "http://127.0.0.1:9/hook",
            vec![WebhookEvent::ContentUpdated],
            "secret",
        );
        store.put_webhook(&hook).unwrap();
        let dispatcher = WebhookDispatcher::new(store, DispatcherConfig::default()).unwrap();
        let result = dispatcher.trigger_event(hook.site_id, WebhookEvent::ContentUpdated, json!({}));
        assert!(matches!(result, Err(WebhookError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_schedules_retry() {
        let store = Arc::new(InMemoryStore::new());
        let hook = Webhook::new(
            Uuid::new_v4(),
            "http://127.0.0.1:9/hook",
            vec![WebhookEvent::ContentUpdated],
            "secret",
        );
        store.put_webhook(&hook).unwrap();
        let dispatcher = WebhookDispatcher::new(store.clone(), DispatcherConfig::default()).unwrap();

        let deliveries = dispatcher
            .trigger_event_and_wait(hook.site_id, WebhookEvent::ContentUpdated, json!({}))
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert!(!deliveries[0].success);
        assert!(deliveries[0].response_status.is_none());
        assert!(deliveries[0].error_message.is_some());

        assert_eq!(store.pending_retries().unwrap(), 1);
        assert_eq!(store.get_webhook(hook.id).unwrap().unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_retries_for_disabled_webhooks_are_dropped() {
        let store = Arc::new(InMemoryStore::new());
        let mut hook = Webhook::new(
            Uuid::new_v4(),
            "http://127.0.0.1:9/hook",
            vec![WebhookEvent::ContentUpdated],
            "secret",
        );
        hook.is_active = false;
        store.put_webhook(&hook).unwrap();
        let now = Utc::now();
        store
            .put_retry(&RetryJob {
                id: Uuid::new_v4(),
                webhook_id: hook.id,
                event: "content.updated".into(),
                body: CompressedBody::compress(b"{}"),
                attempt: 2,
                due_at: now,
                created_at: now,
            })
            .unwrap();

        let dispatcher = WebhookDispatcher::new(store.clone(), DispatcherConfig::default()).unwrap();
        assert_eq!(dispatcher.run_due_retries(now).await.unwrap(), 0);
        assert_eq!(store.pending_retries().unwrap(), 0);
        assert!(store.list_deliveries(hook.id, 10).unwrap().is_empty());
    }
}
