//! RocksDB-backed store.
//!
//! Column families:
//! - `elements`: content elements, keyed `site_id ‖ element_id 0 language 0 variant`
//! - `webhooks`: registrations, keyed by webhook id
//! - `site_webhooks`: empty values keyed `site_id ‖ webhook_id`
//! - `deliveries`: delivery log, keyed `webhook_id ‖ delivered_at ‖ delivery_id`
//! - `retries`: pending retries, keyed `due_at ‖ job_id`
//! - `webhook_retries`: empty values keyed `webhook_id ‖ due_at ‖ job_id`
//! - `sessions`: edit sessions, keyed by token
//!
//! Values are bincode records. Writes that must observe the current value
//! (compare-and-swap, webhook read-modify-write) run under one mutex.

use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::codec::{decode, encode};
use super::{time_key, CasOutcome, ContentStore, StoreError, WebhookStore};
use crate::model::{ContentElement, ElementKey, VersionToken};
use crate::session::{EditSession, EditSessionValidator, SessionError, SessionRequest};
use crate::webhook::{RetryJob, Webhook, WebhookDelivery};

const CF_ELEMENTS: &str = "elements";
const CF_WEBHOOKS: &str = "webhooks";
const CF_SITE_WEBHOOKS: &str = "site_webhooks";
const CF_DELIVERIES: &str = "deliveries";
const CF_RETRIES: &str = "retries";
const CF_WEBHOOK_RETRIES: &str = "webhook_retries";
const CF_SESSIONS: &str = "sessions";

const COLUMN_FAMILIES: &[&str] = &[
    CF_ELEMENTS,
    CF_WEBHOOKS,
    CF_SITE_WEBHOOKS,
    CF_DELIVERIES,
    CF_RETRIES,
    CF_WEBHOOK_RETRIES,
    CF_SESSIONS,
];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("recopy_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("opened store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ELEMENTS | CF_WEBHOOKS | CF_SESSIONS => {
                // point lookups dominate
                opts.set_max_write_buffer_number(2);
            }
            CF_DELIVERIES => {
                // append-heavy, scanned by webhook id prefix
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_SITE_WEBHOOKS | CF_WEBHOOK_RETRIES => {
                // index only, scanned by 16-byte id prefix
                opts.set_max_write_buffer_number(2);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_RETRIES => {
                // bodies are already LZ4
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    pub fn put_session(&self, session: &EditSession) -> Result<(), StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        self.db
            .put_cf_opt(&cf, session.token.as_bytes(), encode(session)?, &self.write_opts())?;
        Ok(())
    }

    pub fn revoke_session(&self, token: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let existed = self.db.get_cf(&cf, token.as_bytes())?.is_some();
        if existed {
            self.db.delete_cf_opt(&cf, token.as_bytes(), &self.write_opts())?;
        }
        Ok(existed)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn element_key(key: &ElementKey) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            16 + key.element_id.len() + key.language.len() + key.variant.len() + 2,
        );
        out.extend_from_slice(key.site_id.as_bytes());
        out.extend_from_slice(key.element_id.as_bytes());
        out.push(0);
        out.extend_from_slice(key.language.as_bytes());
        out.push(0);
        out.extend_from_slice(key.variant.as_bytes());
        out
    }

    fn delivery_key(delivery: &WebhookDelivery) -> Vec<u8> {
        let mut key = Vec::with_capacity(40);
        key.extend_from_slice(delivery.webhook_id.as_bytes());
        key.extend_from_slice(&time_key(delivery.delivered_at));
        key.extend_from_slice(delivery.id.as_bytes());
        key
    }

    fn retry_key(job: &RetryJob) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(&time_key(job.due_at));
        key.extend_from_slice(job.id.as_bytes());
        key
    }

    /// `webhook_id ‖ retry_key`, so the retry key is the suffix after 16 bytes.
    fn webhook_retry_key(job: &RetryJob) -> Vec<u8> {
        let mut key = Vec::with_capacity(40);
        key.extend_from_slice(job.webhook_id.as_bytes());
        key.extend_from_slice(&Self::retry_key(job));
        key
    }

    fn site_webhook_key(site_id: Uuid, webhook_id: Uuid) -> [u8; 32] {
        let mut key = [0u8; 32];
        key[..16].copy_from_slice(site_id.as_bytes());
        key[16..].copy_from_slice(webhook_id.as_bytes());
        key
    }

    /// Keys of every record whose key starts with `prefix`.
    fn keys_with_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut keys = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

impl ContentStore for RocksStore {
    fn get_element(&self, key: &ElementKey) -> Result<Option<ContentElement>, StoreError> {
        let cf = self.cf(CF_ELEMENTS)?;
        match self.db.get_cf(&cf, Self::element_key(key))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn compare_and_swap(
        &self,
        key: &ElementKey,
        expected: Option<VersionToken>,
        new: Option<ContentElement>,
    ) -> Result<CasOutcome, StoreError> {
        let _guard = self.lock()?;
        let current = self.get_element(key)?;
        if current.as_ref().map(ContentElement::version) != expected {
            return Ok(CasOutcome::Mismatch { current });
        }

        let cf = self.cf(CF_ELEMENTS)?;
        let raw_key = Self::element_key(key);
        match new {
            Some(element) => self
                .db
                .put_cf_opt(&cf, &raw_key, encode(&element)?, &self.write_opts())?,
            None => self.db.delete_cf_opt(&cf, &raw_key, &self.write_opts())?,
        }
        Ok(CasOutcome::Swapped)
    }

    fn list_elements(&self, site_id: Uuid) -> Result<Vec<ContentElement>, StoreError> {
        let cf = self.cf(CF_ELEMENTS)?;
        let prefix = site_id.as_bytes();
        let mut elements = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            elements.push(decode(&value)?);
        }
        Ok(elements)
    }
}

impl WebhookStore for RocksStore {
    fn put_webhook(&self, webhook: &Webhook) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_WEBHOOKS)?, webhook.id.as_bytes(), encode(webhook)?);
        batch.put_cf(
            self.cf(CF_SITE_WEBHOOKS)?,
            Self::site_webhook_key(webhook.site_id, webhook.id),
            b"",
        );
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>, StoreError> {
        let cf = self.cf(CF_WEBHOOKS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn modify_webhook(
        &self,
        id: Uuid,
        apply: &mut dyn FnMut(&mut Webhook),
    ) -> Result<Option<Webhook>, StoreError> {
        let _guard = self.lock()?;
        let Some(mut webhook) = self.get_webhook(id)? else {
            return Ok(None);
        };
        apply(&mut webhook);
        self.put_webhook(&webhook)?;
        Ok(Some(webhook))
    }

    fn delete_webhook(&self, id: Uuid) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        let Some(webhook) = self.get_webhook(id)? else {
            return Ok(false);
        };

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_WEBHOOKS)?, id.as_bytes());
        batch.delete_cf(
            self.cf(CF_SITE_WEBHOOKS)?,
            Self::site_webhook_key(webhook.site_id, id),
        );

        let cf_deliveries = self.cf(CF_DELIVERIES)?;
        for key in self.keys_with_prefix(CF_DELIVERIES, id.as_bytes())? {
            batch.delete_cf(cf_deliveries, &key);
        }

        let cf_retries = self.cf(CF_RETRIES)?;
        let cf_index = self.cf(CF_WEBHOOK_RETRIES)?;
        for key in self.keys_with_prefix(CF_WEBHOOK_RETRIES, id.as_bytes())? {
            batch.delete_cf(cf_retries, &key[16..]);
            batch.delete_cf(cf_index, &key);
        }

        self.db.write_opt(batch, &self.write_opts())?;
        Ok(true)
    }

    fn list_webhooks(&self, site_id: Uuid) -> Result<Vec<Webhook>, StoreError> {
        let mut webhooks = Vec::new();
        for key in self.keys_with_prefix(CF_SITE_WEBHOOKS, site_id.as_bytes())? {
            let id = Uuid::from_slice(&key[16..])
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            if let Some(webhook) = self.get_webhook(id)? {
                webhooks.push(webhook);
            }
        }
        webhooks.sort_by_key(|webhook| webhook.created_at);
        Ok(webhooks)
    }

    fn append_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let cf = self.cf(CF_DELIVERIES)?;
        self.db.put_cf_opt(
            &cf,
            Self::delivery_key(delivery),
            encode(delivery)?,
            &self.write_opts(),
        )?;
        Ok(())
    }

    fn list_deliveries(
        &self,
        webhook_id: Uuid,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let cf = self.cf(CF_DELIVERIES)?;
        let prefix = webhook_id.as_bytes();
        let mut upper = prefix.to_vec();
        upper.extend_from_slice(&[0xff; 24]);

        let mut deliveries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));
        for item in iter {
            if deliveries.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            deliveries.push(decode(&value)?);
        }
        Ok(deliveries)
    }

    fn put_retry(&self, job: &RetryJob) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_RETRIES)?, Self::retry_key(job), encode(job)?);
        batch.put_cf(self.cf(CF_WEBHOOK_RETRIES)?, Self::webhook_retry_key(job), b"");
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryJob>, StoreError> {
        let cf = self.cf(CF_RETRIES)?;
        let horizon = time_key(now);
        let mut jobs = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            if jobs.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if key.len() < 8 || key[..8] > horizon[..] {
                break;
            }
            jobs.push(decode(&value)?);
        }
        Ok(jobs)
    }

    fn remove_retry(&self, job: &RetryJob) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_RETRIES)?, Self::retry_key(job));
        batch.delete_cf(self.cf(CF_WEBHOOK_RETRIES)?, Self::webhook_retry_key(job));
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn pending_retries(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_RETRIES)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

impl EditSessionValidator for RocksStore {
    fn validate_edit_session(
        &self,
        request: &SessionRequest,
    ) -> Result<Option<EditSession>, SessionError> {
        let cf = self
            .cf(CF_SESSIONS)
            .map_err(|e| SessionError::Unavailable(e.to_string()))?;
        let bytes = self
            .db
            .get_cf(&cf, request.token.as_bytes())
            .map_err(|e| SessionError::Unavailable(e.to_string()))?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let session: EditSession =
            decode(&bytes).map_err(|e| SessionError::Corrupt(e.to_string()))?;
        Ok(session.permits(request, Utc::now()).then_some(session))
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
