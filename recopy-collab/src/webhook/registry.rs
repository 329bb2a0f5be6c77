//! Webhook registration management.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::signature::generate_secret;
use super::{NewWebhook, Webhook, WebhookDelivery, WebhookError, WebhookEvent, WebhookUpdate};
use crate::storage::WebhookStore;

#[derive(Clone)]
pub struct WebhookRegistry {
    store: Arc<dyn WebhookStore>,
    default_max_failures: u32,
}

impl WebhookRegistry {
    pub fn new(store: Arc<dyn WebhookStore>, default_max_failures: u32) -> Self {
        Self {
            store,
            default_max_failures,
        }
    }

    /// Register a webhook with a freshly generated secret.
    pub fn create_webhook(&self, new: NewWebhook) -> Result<Webhook, WebhookError> {
        validate_url(&new.url)?;
        let events = normalize_events(new.events)?;
        let webhook = Webhook::new(new.site_id, new.url.trim(), events, generate_secret())
            .with_max_failures(new.max_failures.unwrap_or(self.default_max_failures));
        self.store.put_webhook(&webhook)?;
        log::info!(
            "registered webhook {} for site {} ({} events)",
            webhook.id,
            webhook.site_id,
            webhook.events.len()
        );
        Ok(webhook)
    }

    pub fn update_webhook(&self, id: Uuid, update: WebhookUpdate) -> Result<Webhook, WebhookError> {
        if let Some(url) = &update.url {
            validate_url(url)?;
        }
        let events = update.events.map(normalize_events).transpose()?;

        let mut tripped = false;
        let updated = self.store.modify_webhook(id, &mut |webhook: &mut Webhook| {
            let now = Utc::now();
            if let Some(url) = &update.url {
                webhook.url = url.trim().to_string();
            }
            if let Some(events) = &events {
                webhook.events = events.clone();
            }
            if let Some(max_failures) = update.max_failures {
                tripped = webhook.set_max_failures(max_failures, now);
            }
            webhook.updated_at = now;
        })?;
        let updated = updated.ok_or(WebhookError::NotFound(id))?;
        if tripped {
            log::error!(
                "webhook {id} disabled: {} failures reach the new limit of {}",
                updated.failure_count,
                updated.max_failures
            );
        }
        Ok(updated)
    }

    pub fn delete_webhook(&self, id: Uuid) -> Result<(), WebhookError> {
        if self.store.delete_webhook(id)? {
            log::info!("deleted webhook {id}");
            Ok(())
        } else {
            Err(WebhookError::NotFound(id))
        }
    }

    pub fn get_webhook(&self, id: Uuid) -> Result<Webhook, WebhookError> {
        self.store.get_webhook(id)?.ok_or(WebhookError::NotFound(id))
    }

    pub fn list_webhooks(&self, site_id: Uuid) -> Result<Vec<Webhook>, WebhookError> {
        Ok(self.store.list_webhooks(site_id)?)
    }

    /// Re-activate a webhook the circuit breaker disabled.
    pub fn reenable_webhook(&self, id: Uuid) -> Result<Webhook, WebhookError> {
        let updated = self
            .store
            .modify_webhook(id, &mut |webhook: &mut Webhook| webhook.reenable(Utc::now()))?
            .ok_or(WebhookError::NotFound(id))?;
        log::info!("re-enabled webhook {id}");
        Ok(updated)
    }

    /// Most recent deliveries first.
    pub fn list_deliveries(
        &self,
        webhook_id: Uuid,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        Ok(self.store.list_deliveries(webhook_id, limit)?)
    }
}

fn validate_url(url: &str) -> Result<(), WebhookError> {
    let parsed =
        reqwest::Url::parse(url.trim()).map_err(|e| WebhookError::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        _ => Err(WebhookError::InvalidUrl(format!(
            "{url}: only http(s) endpoints are supported"
        ))),
    }
}

fn normalize_events(mut events: Vec<WebhookEvent>) -> Result<Vec<WebhookEvent>, WebhookError> {
    let mut seen = Vec::with_capacity(events.len());
    events.retain(|event| {
        if seen.contains(event) {
            false
        } else {
            seen.push(*event);
            true
        }
    });
    if events.is_empty() {
        return Err(WebhookError::NoEvents);
    }
    Ok(events)
}
