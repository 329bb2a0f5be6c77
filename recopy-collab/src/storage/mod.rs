//! Persistence layer for content elements, webhooks and their delivery log.
//!
//! ```text
//! ┌──────────────────┐   compare_and_swap   ┌──────────────────────────────┐
//! │ ConflictDetector │ ───────────────────► │ ContentStore                 │
//! └──────────────────┘                      │   elements                   │
//! ┌──────────────────┐   deliveries/retries │ WebhookStore                 │
//! │ WebhookDispatcher│ ───────────────────► │   webhooks deliveries retries│
//! └──────────────────┘                      └──────────────────────────────┘
//!                                             InMemoryStore | RocksStore
//! ```

pub mod codec;
pub mod memory;
pub mod rocks;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{ContentElement, ElementKey, VersionToken};
use crate::webhook::{RetryJob, Webhook, WebhookDelivery};

pub use codec::CompressedBody;
pub use memory::InMemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Unavailable(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Result of a compare-and-swap on one element.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The write happened.
    Swapped,
    /// The element's version was not the expected one; nothing was written.
    Mismatch { current: Option<ContentElement> },
}

/// Versioned content element storage.
pub trait ContentStore: Send + Sync {
    fn get_element(&self, key: &ElementKey) -> Result<Option<ContentElement>, StoreError>;

    /// Atomically replace the element at `key` if its current version is
    /// `expected` (`None` meaning "does not exist"). `new = None` deletes.
    ///
    /// Concurrent calls for one key are serialized, so at most one of
    /// several callers holding the same `expected` sees `Swapped`.
    fn compare_and_swap(
        &self,
        key: &ElementKey,
        expected: Option<VersionToken>,
        new: Option<ContentElement>,
    ) -> Result<CasOutcome, StoreError>;

    fn list_elements(&self, site_id: Uuid) -> Result<Vec<ContentElement>, StoreError>;
}

/// Webhook registrations, the append-only delivery log and pending retries.
pub trait WebhookStore: Send + Sync {
    fn put_webhook(&self, webhook: &Webhook) -> Result<(), StoreError>;

    fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>, StoreError>;

    /// Read-modify-write of one webhook. Returns the updated record, or
    /// `None` if it does not exist.
    fn modify_webhook(
        &self,
        id: Uuid,
        apply: &mut dyn FnMut(&mut Webhook),
    ) -> Result<Option<Webhook>, StoreError>;

    /// Removes the webhook with its deliveries and pending retries.
    fn delete_webhook(&self, id: Uuid) -> Result<bool, StoreError>;

    fn list_webhooks(&self, site_id: Uuid) -> Result<Vec<Webhook>, StoreError>;

    fn append_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError>;

    /// Newest first.
    fn list_deliveries(
        &self,
        webhook_id: Uuid,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError>;

    fn put_retry(&self, job: &RetryJob) -> Result<(), StoreError>;

    /// Jobs due at or before `now`, earliest first.
    fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryJob>, StoreError>;

    fn remove_retry(&self, job: &RetryJob) -> Result<(), StoreError>;

    fn pending_retries(&self) -> Result<usize, StoreError>;
}

/// Microsecond timestamp as a big-endian sortable key part.
pub(crate) fn time_key(ts: DateTime<Utc>) -> [u8; 8] {
    (ts.timestamp_micros().max(0) as u64).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_time_keys_sort_chronologically() {
        let now = Utc::now();
        let later = now + Duration::milliseconds(1);
        assert!(time_key(now) < time_key(later));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::Unavailable("down".into()).is_retryable());
        assert!(StoreError::Database("io".into()).is_retryable());
        assert!(!StoreError::Deserialization("bad".into()).is_retryable());
    }
}
