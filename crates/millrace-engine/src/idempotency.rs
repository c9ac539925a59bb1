//! Idempotency store
//!
//! Content-addressed result cache keyed `(execution, node, key)` with a
//! 24h TTL. Two backends behind one trait: the in-memory map is both the
//! reference implementation and the authoritative fallback when a durable
//! primary goes away mid-process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use millrace_kernel::hash;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Store-level errors, distinct from engine errors so the failover wrapper
/// can react to them.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store error: {0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Default record TTL.
pub fn default_ttl() -> Duration {
    Duration::hours(24)
}

/// One cached node result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub execution_id: Uuid,
    pub node_id: String,
    pub key: String,
    pub result_hash: String,
    pub result_data: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(
        execution_id: Uuid,
        node_id: impl Into<String>,
        key: impl Into<String>,
        result: &Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            key: key.into(),
            result_hash: hash::result_hash(Some(result)),
            result_data: result.clone(),
            created_at: now,
            expires_at: now + default_ttl(),
        }
    }

    /// Expired the instant `now` reaches `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Backend contract. The durable implementation is injected by the host.
#[async_trait]
pub trait IdempotencyBackend: Send + Sync {
    /// Expired records are never returned.
    async fn find(
        &self,
        execution_id: Uuid,
        node_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<IdempotencyRecord>>;

    /// Idempotent by primary key; conflicts overwrite hash/data/expiry.
    async fn upsert(&self, record: IdempotencyRecord) -> StoreResult<()>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Cached; invalidated by upserts and expiry sweeps.
    async fn count_active(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

type RecordKey = (Uuid, String, String);

/// In-memory backend.
#[derive(Default)]
pub struct MemoryIdempotencyBackend {
    records: DashMap<RecordKey, IdempotencyRecord>,
    active_count: Mutex<Option<usize>>,
}

impl MemoryIdempotencyBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyBackend for MemoryIdempotencyBackend {
    async fn find(
        &self,
        execution_id: Uuid,
        node_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let record = self
            .records
            .get(&(execution_id, node_id.to_string(), key.to_string()))
            .map(|r| r.clone());
        Ok(record.filter(|r| !r.is_expired(now)))
    }

    async fn upsert(&self, record: IdempotencyRecord) -> StoreResult<()> {
        let key = (
            record.execution_id,
            record.node_id.clone(),
            record.key.clone(),
        );
        // Last writer wins on hash/data/expiry.
        self.records.insert(key, record);
        *self.active_count.lock() = None;
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired(now));
        let removed = before - self.records.len();
        if removed > 0 {
            *self.active_count.lock() = None;
        }
        Ok(removed)
    }

    async fn count_active(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut cache = self.active_count.lock();
        if let Some(count) = *cache {
            return Ok(count);
        }
        let count = self.records.iter().filter(|r| !r.is_expired(now)).count();
        *cache = Some(count);
        Ok(count)
    }
}

/// Primary-with-fallback store.
///
/// The fallback is not a cache: once the primary errors, the in-memory map
/// becomes the authoritative store for this process, and `count_active`
/// answers from whichever backend is live.
pub struct IdempotencyStore {
    primary: Option<Arc<dyn IdempotencyBackend>>,
    fallback: MemoryIdempotencyBackend,
    degraded: AtomicBool,
}

impl IdempotencyStore {
    /// Memory-only store (single-node mode).
    pub fn in_memory() -> Self {
        Self {
            primary: None,
            fallback: MemoryIdempotencyBackend::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Durable primary with the in-memory fallback armed.
    pub fn with_primary(primary: Arc<dyn IdempotencyBackend>) -> Self {
        Self {
            primary: Some(primary),
            fallback: MemoryIdempotencyBackend::new(),
            degraded: AtomicBool::new(false),
        }
    }

    fn live_primary(&self) -> Option<&Arc<dyn IdempotencyBackend>> {
        if self.degraded.load(Ordering::Relaxed) {
            None
        } else {
            self.primary.as_ref()
        }
    }

    fn degrade(&self, context: &str, error: &StoreError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(context, error = %error, "primary idempotency store failed, falling back to memory");
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub async fn find(
        &self,
        execution_id: Uuid,
        node_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<IdempotencyRecord> {
        if let Some(primary) = self.live_primary() {
            match primary.find(execution_id, node_id, key, now).await {
                Ok(found) => return found,
                Err(e) => self.degrade("find", &e),
            }
        }
        self.fallback
            .find(execution_id, node_id, key, now)
            .await
            .unwrap_or_default()
    }

    pub async fn upsert(&self, record: IdempotencyRecord) {
        if let Some(primary) = self.live_primary() {
            match primary.upsert(record.clone()).await {
                Ok(()) => return,
                Err(e) => self.degrade("upsert", &e),
            }
        }
        // Infallible for the memory backend.
        let _ = self.fallback.upsert(record).await;
    }

    pub async fn delete_expired(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        if let Some(primary) = self.live_primary() {
            match primary.delete_expired(now).await {
                Ok(count) => removed = count,
                Err(e) => self.degrade("delete_expired", &e),
            }
        }
        removed + self.fallback.delete_expired(now).await.unwrap_or(0)
    }

    pub async fn count_active(&self, now: DateTime<Utc>) -> usize {
        if let Some(primary) = self.live_primary() {
            match primary.count_active(now).await {
                Ok(count) => return count,
                Err(e) => self.degrade("count_active", &e),
            }
        }
        self.fallback.count_active(now).await.unwrap_or(0)
    }

    /// Cache a successful result under its idempotency key.
    pub async fn store_result(
        &self,
        execution_id: Uuid,
        node_id: &str,
        key: &str,
        result: &Value,
    ) -> String {
        let record = IdempotencyRecord::new(execution_id, node_id, key, result, Utc::now());
        let result_hash = record.result_hash.clone();
        debug!(%execution_id, node_id, key, "caching node result");
        self.upsert(record).await;
        result_hash
    }
}
