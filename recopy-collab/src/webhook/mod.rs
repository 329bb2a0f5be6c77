//! Outbound webhook delivery.
//!
//! Independent of the real-time path: a committed change is handed to
//! [`WebhookDispatcher::trigger_event`], which returns at once while one
//! task per subscribed webhook POSTs the signed payload. Every attempt is
//! logged as a [`WebhookDelivery`]. Failures are retried with exponential
//! backoff from persisted [`RetryJob`]s until the webhook's circuit
//! breaker trips.
//!
//! ```text
//! trigger_event ──► join_all(deliver) ──► append_delivery
//!                         │ failure
//!                         ▼
//!                    put_retry(due = now + backoff(n))
//!                         │
//! RetryScheduler ──► run_due_retries ──► deliver(attempt n + 1, X-ReCopyFast-Retry)
//! ```

pub mod dispatcher;
pub mod registry;
pub mod retry;
pub mod signature;
pub mod types;

use thiserror::Error;
use uuid::Uuid;

pub use dispatcher::WebhookDispatcher;
pub use registry::WebhookRegistry;
pub use retry::{Backoff, RetryScheduler};
pub use signature::{generate_secret, sign_payload, verify_signature};
pub use types::{
    NewWebhook, RetryJob, Webhook, WebhookDelivery, WebhookEvent, WebhookPayload, WebhookUpdate,
    DEFAULT_MAX_FAILURES,
};

use crate::storage::StoreError;

pub const HEADER_EVENT: &str = "X-ReCopyFast-Event";
pub const HEADER_SIGNATURE: &str = "X-ReCopyFast-Signature";
pub const HEADER_DELIVERY: &str = "X-ReCopyFast-Delivery";
pub const HEADER_RETRY: &str = "X-ReCopyFast-Retry";
pub const HEADER_TEST: &str = "X-ReCopyFast-Test";

#[derive(Debug, Clone, Error)]
pub enum WebhookError {
    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),
    #[error("A webhook must subscribe to at least one event")]
    NoEvents,
    #[error("Unknown webhook event: {0}")]
    UnknownEvent(String),
    #[error("Webhook not found: {0}")]
    NotFound(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Signature error: {0}")]
    Signature(String),
    #[error("HTTP client error: {0}")]
    Http(String),
    #[error("No async runtime to deliver on: {0}")]
    Runtime(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
