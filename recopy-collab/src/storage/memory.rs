//! In-process store for tests and embedding.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{CasOutcome, ContentStore, StoreError, WebhookStore};
use crate::model::{ContentElement, ElementKey, VersionToken};
use crate::webhook::{RetryJob, Webhook, WebhookDelivery};

#[derive(Default)]
struct Tables {
    elements: BTreeMap<ElementKey, ContentElement>,
    webhooks: HashMap<Uuid, Webhook>,
    deliveries: HashMap<Uuid, Vec<WebhookDelivery>>,
    retries: BTreeMap<(DateTime<Utc>, Uuid), RetryJob>,
}

/// Everything behind one mutex.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Seed an element without version checks.
    pub fn insert_element(&self, element: ContentElement) -> Result<(), StoreError> {
        self.lock()?.elements.insert(element.key(), element);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        self.tables
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl ContentStore for InMemoryStore {
    fn get_element(&self, key: &ElementKey) -> Result<Option<ContentElement>, StoreError> {
        Ok(self.lock()?.elements.get(key).cloned())
    }

    fn compare_and_swap(
        &self,
        key: &ElementKey,
        expected: Option<VersionToken>,
        new: Option<ContentElement>,
    ) -> Result<CasOutcome, StoreError> {
        let mut tables = self.lock()?;
        let current = tables.elements.get(key);
        if current.map(ContentElement::version) != expected {
            return Ok(CasOutcome::Mismatch {
                current: current.cloned(),
            });
        }
        match new {
            Some(element) => {
                tables.elements.insert(key.clone(), element);
            }
            None => {
                tables.elements.remove(key);
            }
        }
        Ok(CasOutcome::Swapped)
    }

    fn list_elements(&self, site_id: Uuid) -> Result<Vec<ContentElement>, StoreError> {
        Ok(self
            .lock()?
            .elements
            .values()
            .filter(|element| element.site_id == site_id)
            .cloned()
            .collect())
    }
}

impl WebhookStore for InMemoryStore {
    fn put_webhook(&self, webhook: &Webhook) -> Result<(), StoreError> {
        self.lock()?.webhooks.insert(webhook.id, webhook.clone());
        Ok(())
    }

    fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>, StoreError> {
        Ok(self.lock()?.webhooks.get(&id).cloned())
    }

    fn modify_webhook(
        &self,
        id: Uuid,
        apply: &mut dyn FnMut(&mut Webhook),
    ) -> Result<Option<Webhook>, StoreError> {
        let mut tables = self.lock()?;
        Ok(tables.webhooks.get_mut(&id).map(|webhook| {
            apply(webhook);
            webhook.clone()
        }))
    }

    fn delete_webhook(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        let existed = tables.webhooks.remove(&id).is_some();
        tables.deliveries.remove(&id);
        tables.retries.retain(|_, job| job.webhook_id != id);
        Ok(existed)
    }

    fn list_webhooks(&self, site_id: Uuid) -> Result<Vec<Webhook>, StoreError> {
        let mut webhooks: Vec<Webhook> = self
            .lock()?
            .webhooks
            .values()
            .filter(|webhook| webhook.site_id == site_id)
            .cloned()
            .collect();
        webhooks.sort_by_key(|webhook| webhook.created_at);
        Ok(webhooks)
    }

    fn append_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        self.lock()?
            .deliveries
            .entry(delivery.webhook_id)
            .or_default()
            .push(delivery.clone());
        Ok(())
    }

    fn list_deliveries(
        &self,
        webhook_id: Uuid,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let tables = self.lock()?;
        let mut deliveries = tables
            .deliveries
            .get(&webhook_id)
            .cloned()
            .unwrap_or_default();
        deliveries.sort_by(|a, b| b.delivered_at.cmp(&a.delivered_at));
        deliveries.truncate(limit);
        Ok(deliveries)
    }

    fn put_retry(&self, job: &RetryJob) -> Result<(), StoreError> {
        self.lock()?.retries.insert((job.due_at, job.id), job.clone());
        Ok(())
    }

    fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryJob>, StoreError> {
        Ok(self
            .lock()?
            .retries
            .values()
            .take_while(|job| job.due_at <= now)
            .take(limit)
            .cloned()
            .collect())
    }

    fn remove_retry(&self, job: &RetryJob) -> Result<(), StoreError> {
        self.lock()?.retries.remove(&(job.due_at, job.id));
        Ok(())
    }

    fn pending_retries(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.retries.len())
    }
}
