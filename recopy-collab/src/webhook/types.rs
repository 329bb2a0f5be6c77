//! Webhook registrations, delivery log records and queued retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::WebhookError;
use crate::storage::CompressedBody;

/// Default consecutive failures before a webhook is disabled.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Event names a webhook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "content.updated")]
    ContentUpdated,
    #[serde(rename = "content.created")]
    ContentCreated,
    #[serde(rename = "content.deleted")]
    ContentDeleted,
    #[serde(rename = "site.updated")]
    SiteUpdated,
    #[serde(rename = "user.invited")]
    UserInvited,
    #[serde(rename = "team.member_added")]
    TeamMemberAdded,
    #[serde(rename = "bulk.operation_completed")]
    BulkOperationCompleted,
    #[serde(rename = "ab_test.started")]
    AbTestStarted,
    #[serde(rename = "ab_test.completed")]
    AbTestCompleted,
}

impl WebhookEvent {
    pub const ALL: [WebhookEvent; 9] = [
        WebhookEvent::ContentUpdated,
        WebhookEvent::ContentCreated,
        WebhookEvent::ContentDeleted,
        WebhookEvent::SiteUpdated,
        WebhookEvent::UserInvited,
        WebhookEvent::TeamMemberAdded,
        WebhookEvent::BulkOperationCompleted,
        WebhookEvent::AbTestStarted,
        WebhookEvent::AbTestCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::ContentUpdated => "content.updated",
            WebhookEvent::ContentCreated => "content.created",
            WebhookEvent::ContentDeleted => "content.deleted",
            WebhookEvent::SiteUpdated => "site.updated",
            WebhookEvent::UserInvited => "user.invited",
            WebhookEvent::TeamMemberAdded => "team.member_added",
            WebhookEvent::BulkOperationCompleted => "bulk.operation_completed",
            WebhookEvent::AbTestStarted => "ab_test.started",
            WebhookEvent::AbTestCompleted => "ab_test.completed",
        }
    }
}

impl fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEvent {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WebhookEvent::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| WebhookError::UnknownEvent(s.to_string()))
    }
}

/// A registered outbound endpoint.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub site_id: Uuid,
    pub url: String,
    pub events: Vec<WebhookEvent>,
    /// HMAC key for `X-ReCopyFast-Signature`. Never logged.
    pub secret: String,
    pub is_active: bool,
    pub failure_count: u32,
    pub max_failures: u32,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    pub fn new(
        site_id: Uuid,
        url: impl Into<String>,
        events: Vec<WebhookEvent>,
        secret: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            site_id,
            url: url.into(),
            events,
            secret: secret.into(),
            is_active: true,
            failure_count: 0,
            max_failures: DEFAULT_MAX_FAILURES,
            last_triggered_at: None,
            last_success_at: None,
            last_failure_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    pub fn subscribes_to(&self, event: WebhookEvent) -> bool {
        self.events.contains(&event)
    }

    /// Active and subscribed.
    pub fn accepts(&self, event: WebhookEvent) -> bool {
        self.is_active && self.subscribes_to(event)
    }

    /// A 2xx response: the consecutive-failure counter starts over.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.failure_count = 0;
        self.last_triggered_at = Some(now);
        self.last_success_at = Some(now);
        self.updated_at = now;
    }

    /// A failed attempt. Returns `true` when this failure disabled the webhook.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_triggered_at = Some(now);
        self.last_failure_at = Some(now);
        self.updated_at = now;
        if self.is_active && self.failure_count >= self.max_failures {
            self.is_active = false;
            return true;
        }
        false
    }

    /// Change the threshold. Returns `true` when the failures already
    /// counted reach the new threshold and the webhook is disabled.
    pub fn set_max_failures(&mut self, max_failures: u32, now: DateTime<Utc>) -> bool {
        self.max_failures = max_failures.max(1);
        self.updated_at = now;
        if self.is_active && self.failure_count >= self.max_failures {
            self.is_active = false;
            return true;
        }
        false
    }

    /// Explicit re-enable after the breaker tripped.
    pub fn reenable(&mut self, now: DateTime<Utc>) {
        self.is_active = true;
        self.failure_count = 0;
        self.updated_at = now;
    }
}

impl fmt::Debug for Webhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Webhook")
            .field("id", &self.id)
            .field("site_id", &self.site_id)
            .field("url", &self.url)
            .field("events", &self.events)
            .field("secret", &"<redacted>")
            .field("is_active", &self.is_active)
            .field("failure_count", &self.failure_count)
            .field("max_failures", &self.max_failures)
            .finish_non_exhaustive()
    }
}

/// Input for registering a webhook.
#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub site_id: Uuid,
    pub url: String,
    pub events: Vec<WebhookEvent>,
    pub max_failures: Option<u32>,
}

/// Partial update of a registered webhook.
#[derive(Debug, Clone, Default)]
pub struct WebhookUpdate {
    pub url: Option<String>,
    pub events: Option<Vec<WebhookEvent>>,
    pub max_failures: Option<u32>,
}

/// JSON body POSTed to a webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub site_id: Uuid,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl WebhookPayload {
    pub fn new(event: impl Into<String>, site_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            timestamp: Utc::now(),
            site_id,
            data,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn to_body(&self) -> Result<Vec<u8>, WebhookError> {
        serde_json::to_vec(self).map_err(|e| WebhookError::Serialization(e.to_string()))
    }
}

/// Append-only log entry for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Also sent as `X-ReCopyFast-Delivery`.
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event: String,
    /// 1 for the initial attempt.
    pub attempt: u32,
    pub is_test: bool,
    pub request_body: CompressedBody,
    pub response_status: Option<u16>,
    pub response_time_ms: u64,
    /// First bytes of the response body.
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub success: bool,
    pub delivered_at: DateTime<Utc>,
}

/// A failed delivery waiting for its next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryJob {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event: String,
    pub body: CompressedBody,
    /// Attempt number this job will make.
    pub attempt: u32,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook(max_failures: u32) -> Webhook {
        Webhook::new(
            Uuid::new_v4(),
            "https://hooks.example.com/recopy",
            vec![WebhookEvent::ContentUpdated],
            "s3cret",
        )
        .with_max_failures(max_failures)
    }

    #[test]
    fn test_event_names_round_trip() {
        for event in WebhookEvent::ALL {
            assert_eq!(event.as_str().parse::<WebhookEvent>().unwrap(), event);
            let json = serde_json::to_string(&event).unwrap();
            assert_eq!(json, format!("\"{}\"", event.as_str()));
        }
        assert!("content.exploded".parse::<WebhookEvent>().is_err());
    }

    #[test]
    fn test_breaker_trips_at_max_failures() {
        let mut hook = webhook(5);
        let now = Utc::now();
        for _ in 0..4 {
            assert!(!hook.record_failure(now));
            assert!(hook.is_active);
        }
        assert!(hook.record_failure(now));
        assert!(!hook.is_active);
        assert_eq!(hook.failure_count, 5);
        assert!(!hook.accepts(WebhookEvent::ContentUpdated));
    }

    #[test]
    fn test_interleaved_success_resets_counter() {
        let mut hook = webhook(3);
        let now = Utc::now();
        hook.record_failure(now);
        hook.record_failure(now);
        hook.record_success(now);
        assert_eq!(hook.failure_count, 0);
        hook.record_failure(now);
        hook.record_failure(now);
        assert!(hook.is_active);
    }

    #[test]
    fn test_lowered_threshold_trips_immediately() {
        let mut hook = webhook(5);
        let now = Utc::now();
        hook.record_failure(now);
        hook.record_failure(now);

        assert!(!hook.set_max_failures(3, now));
        assert!(hook.is_active);
        assert!(hook.set_max_failures(2, now));
        assert!(!hook.is_active);
        assert_eq!(hook.failure_count, 2);

        // Raising it again does not re-enable
        assert!(!hook.set_max_failures(10, now));
        assert!(!hook.is_active);
    }

    #[test]
    fn test_disabled_webhook_does_not_trip_again() {
        let mut hook = webhook(1);
        let now = Utc::now();
        assert!(hook.record_failure(now));
        assert!(!hook.record_failure(now));
        hook.reenable(now);
        assert!(hook.is_active);
        assert_eq!(hook.failure_count, 0);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let hook = webhook(5);
        let debug = format!("{hook:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_payload_wire_shape() {
        let site = Uuid::new_v4();
        let payload = WebhookPayload::new(
            WebhookEvent::ContentUpdated.as_str(),
            site,
            serde_json::json!({"elementId": "hero-title"}),
        );
        let json: serde_json::Value = serde_json::from_slice(&payload.to_body().unwrap()).unwrap();
        assert_eq!(json["event"], "content.updated");
        assert_eq!(json["site_id"], site.to_string());
        assert_eq!(json["data"]["elementId"], "hero-title");
        assert!(json.get("metadata").is_none());
        assert!(json.get("timestamp").is_some());
    }
}
