//! The storage adapter: one uniform interface over the memory,
//! filesystem, and object-store backends.
//!
//! Dispatch is a tagged enum rather than a trait object; the backend set
//! is closed and the match sites keep every suspension point visible.
//! Retryable backend failures (throttling, transient I/O) are absorbed
//! here with bounded, jittered backoff and surface in the throttling
//! telemetry instead of failing the caller outright.

use crate::changes::{Change, ChangeFeed, ChangeOperation, EntityKind};
use crate::filesystem::FilesystemBackend;
use crate::memory::MemoryBackend;
use crate::object_store::{ObjectClient, ObjectStoreBackend};
use crate::pagination::{Cursor, NounFilter, Page, Pagination, VerbFilter};
use crate::stats::{StatisticsRegistry, ThrottleReason};
use engram_core::{
    EngramError, EngramId, Noun, NounMetadata, NounWithMetadata, Result, TimestampMs, Verb,
    VerbMetadata, VerbWithMetadata,
};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Storage key layout. Mirrors the on-disk reference layout, so the
/// filesystem backend maps keys straight to paths.
pub mod keys {
    use engram_core::EngramId;

    pub fn noun(id: &EngramId) -> String {
        format!("nouns/{id}.json")
    }

    pub fn noun_metadata(id: &EngramId) -> String {
        format!("metadata/{id}.json")
    }

    pub fn verb(id: &EngramId) -> String {
        format!("verbs/{id}.json")
    }

    pub fn verb_metadata(id: &EngramId) -> String {
        format!("verb-metadata/{id}.json")
    }

    pub fn blob(hash: &str) -> String {
        format!("blob/{hash}")
    }

    pub fn blob_meta(hash: &str) -> String {
        format!("blob-meta/{hash}.json")
    }

    pub fn commit(hash: &str) -> String {
        format!("commits/{hash}.json")
    }

    pub fn branch(name: &str) -> String {
        format!("branches/{name}")
    }

    pub fn statistics() -> String {
        "statistics.json".to_string()
    }

    pub const NOUN_PREFIX: &str = "nouns/";
    pub const VERB_PREFIX: &str = "verbs/";
    pub const BLOB_META_PREFIX: &str = "blob-meta/";
}

/// Options for [`StorageAdapter::batch_delete`].
#[derive(Debug, Clone)]
pub struct BatchDeleteOptions {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Keep going after a per-key failure and report it in the result.
    pub continue_on_error: bool,
}

impl Default for BatchDeleteOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 50,
            continue_on_error: true,
        }
    }
}

/// Outcome of a batch delete.
#[derive(Debug, Clone, Default)]
pub struct BatchDeleteResult {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<BatchDeleteError>,
}

#[derive(Debug, Clone)]
pub struct BatchDeleteError {
    pub key: String,
    pub message: String,
}

enum Backend {
    Memory(MemoryBackend),
    Filesystem(FilesystemBackend),
    ObjectStore(ObjectStoreBackend),
}

impl Backend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Memory(b) => Ok(b.get(key)),
            Self::Filesystem(b) => b.get(key).await,
            Self::ObjectStore(b) => b.get(key).await,
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        match self {
            Self::Memory(b) => {
                b.put(key.to_string(), bytes);
                Ok(())
            }
            Self::Filesystem(b) => b.put(key, &bytes).await,
            Self::ObjectStore(b) => b.put(key, bytes).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match self {
            Self::Memory(b) => Ok(b.delete(key)),
            Self::Filesystem(b) => b.delete(key).await,
            Self::ObjectStore(b) => b.delete(key).await,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            Self::Memory(b) => Ok(b.exists(key)),
            Self::Filesystem(b) => b.exists(key).await,
            Self::ObjectStore(b) => b.exists(key).await,
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        match self {
            Self::Memory(b) => b.list_keys(prefix),
            Self::Filesystem(b) => b.list_keys(prefix).await,
            Self::ObjectStore(b) => b.list_keys(prefix).await,
        }
    }
}

/// The uniform storage interface the rest of the system builds on.
pub struct StorageAdapter {
    backend: Backend,
    stats: StatisticsRegistry,
    changes: ChangeFeed,
    max_retries: u32,
    retry_base_delay_ms: u64,
}

impl StorageAdapter {
    /// Process-memory adapter.
    pub fn memory() -> Self {
        Self::from_backend(Backend::Memory(MemoryBackend::new()))
    }

    /// Filesystem adapter rooted at `root`; restores the statistics
    /// snapshot when one exists.
    pub async fn filesystem(root: impl Into<PathBuf>) -> Result<Self> {
        let adapter = Self::from_backend(Backend::Filesystem(FilesystemBackend::new(root)?));
        adapter.load_statistics().await;
        Ok(adapter)
    }

    /// Object-store adapter over a registered client.
    pub async fn object_store(
        client: Arc<dyn ObjectClient>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Result<Self> {
        let adapter =
            Self::from_backend(Backend::ObjectStore(ObjectStoreBackend::new(client, bucket, prefix)));
        adapter.load_statistics().await;
        Ok(adapter)
    }

    fn from_backend(backend: Backend) -> Self {
        Self {
            backend,
            stats: StatisticsRegistry::new(),
            changes: ChangeFeed::default(),
            max_retries: 3,
            retry_base_delay_ms: 50,
        }
    }

    pub fn statistics(&self) -> &StatisticsRegistry {
        &self.stats
    }

    // ----- raw key-value ---------------------------------------------------

    /// Missing keys are `None`, never an error.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.backend.get(key).await
    }

    /// Atomic per-key write, with bounded retry on throttling.
    pub async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.backend.put(key, bytes.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        self.stats.record_throttle_recovered();
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    self.stats.record_throttle(throttle_reason(&e), delay.as_millis() as u64);
                    self.stats.record_operation_retried();
                    self.stats.record_operation_delayed(delay.as_millis() as u64);
                    warn!(key, attempt, error = %e, "retrying put after backoff");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.stats.record_operation_failed();
                    }
                    return Err(e);
                }
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.backend.exists(key).await
    }

    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.backend.list_keys(prefix).await
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_base_delay_ms << attempt.min(8);
        let jitter = rand::rng().random_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }

    /// Delete many keys. The object-store backend goes through the
    /// provider's batch API in one round trip; the other backends loop
    /// with per-key retries.
    pub async fn batch_delete(
        &self,
        keys: &[String],
        options: &BatchDeleteOptions,
    ) -> BatchDeleteResult {
        let mut result = BatchDeleteResult {
            requested: keys.len(),
            ..Default::default()
        };

        if let Backend::ObjectStore(store) = &self.backend {
            match store.delete_batch(keys).await {
                Ok(failed) => {
                    result.failed = failed.len();
                    result.succeeded = keys.len() - failed.len();
                    result.errors = failed
                        .into_iter()
                        .map(|(key, message)| BatchDeleteError { key, message })
                        .collect();
                    return result;
                }
                Err(e) => {
                    warn!(error = %e, "native batch delete failed; falling back to per-key");
                }
            }
        }

        for key in keys {
            let mut attempt = 0u32;
            let outcome = loop {
                match self.backend.delete(key).await {
                    Ok(_) => break Ok(()),
                    Err(e) if e.is_retryable() && attempt < options.max_retries => {
                        self.stats.record_operation_retried();
                        tokio::time::sleep(Duration::from_millis(options.retry_delay_ms)).await;
                        attempt += 1;
                    }
                    Err(e) => break Err(e),
                }
            };
            match outcome {
                Ok(()) => result.succeeded += 1,
                Err(e) => {
                    result.failed += 1;
                    result.errors.push(BatchDeleteError {
                        key: key.clone(),
                        message: e.to_string(),
                    });
                    if !options.continue_on_error {
                        break;
                    }
                }
            }
        }
        result
    }

    // ----- nouns -----------------------------------------------------------

    /// Persist the indexed noun record. Returns `true` when the id was new.
    pub async fn save_noun(&self, noun: &Noun) -> Result<bool> {
        let key = keys::noun(&noun.id);
        let existed = self.backend.exists(&key).await?;
        let json = serde_json::to_value(noun)?;
        self.put(&key, serde_json::to_vec(&json)?).await?;
        self.changes.record(
            noun.id.to_string(),
            EntityKind::Noun,
            if existed {
                ChangeOperation::Update
            } else {
                ChangeOperation::Create
            },
            Some(json),
        );
        Ok(!existed)
    }

    /// Indexed record only; no sidecar fetch.
    pub async fn get_noun_raw(&self, id: &EngramId) -> Result<Option<Noun>> {
        match self.backend.get(&keys::noun(id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Canonical combined read: indexed record merged with its sidecar.
    pub async fn get_noun(&self, id: &EngramId) -> Result<Option<NounWithMetadata>> {
        let Some(noun) = self.get_noun_raw(id).await? else {
            return Ok(None);
        };
        let sidecar = self.get_noun_metadata(id).await?;
        Ok(Some(NounWithMetadata::combine(noun, sidecar)))
    }

    pub async fn save_noun_metadata(&self, id: &EngramId, metadata: &NounMetadata) -> Result<()> {
        self.put(&keys::noun_metadata(id), serde_json::to_vec(metadata)?)
            .await
    }

    pub async fn get_noun_metadata(&self, id: &EngramId) -> Result<Option<NounMetadata>> {
        match self.backend.get(&keys::noun_metadata(id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_noun_metadata(&self, id: &EngramId) -> Result<bool> {
        self.backend.delete(&keys::noun_metadata(id)).await
    }

    /// Remove a noun record and its sidecar. Returns whether the record
    /// existed.
    pub async fn delete_noun(&self, id: &EngramId) -> Result<bool> {
        let removed = self.backend.delete(&keys::noun(id)).await?;
        let _ = self.backend.delete(&keys::noun_metadata(id)).await?;
        if removed {
            self.changes
                .record(id.to_string(), EntityKind::Noun, ChangeOperation::Delete, None);
        }
        Ok(removed)
    }

    /// Paginated, filtered noun listing.
    pub async fn get_nouns(
        &self,
        filter: &NounFilter,
        pagination: &Pagination,
    ) -> Result<Page<NounWithMetadata>> {
        let limit = pagination.effective_limit();
        let after = match &pagination.cursor {
            Some(encoded) => Some(Cursor::decode(encoded)?.last_key),
            None => None,
        };

        let keys = self.backend.list_keys(keys::NOUN_PREFIX).await?;
        let mut items = Vec::with_capacity(limit.min(keys.len()));
        let mut last_key: Option<String> = None;
        let mut has_more = false;

        for key in keys {
            if let Some(after) = &after {
                if key.as_str() <= after.as_str() {
                    continue;
                }
            }
            let Some(id) = noun_id_from_key(&key) else {
                continue;
            };
            let Some(combined) = self.get_noun(&id).await? else {
                // Deleted between list and read; part of graceful
                // degradation under concurrent mutation.
                continue;
            };
            if !filter.matches(combined.noun.noun, &combined.service, &combined.metadata) {
                continue;
            }
            if items.len() == limit {
                has_more = true;
                break;
            }
            last_key = Some(key);
            items.push(combined);
        }

        let total_count = filter.is_empty().then(|| self.stats.noun_count());
        Ok(Page {
            items,
            next_cursor: if has_more {
                last_key.map(|k| Cursor::after(k).encode())
            } else {
                None
            },
            has_more,
            total_count,
        })
    }

    // ----- verbs -----------------------------------------------------------

    /// Persist the indexed verb record. Returns `true` when the id was new.
    pub async fn save_verb(&self, verb: &Verb) -> Result<bool> {
        let key = keys::verb(&verb.id);
        let existed = self.backend.exists(&key).await?;
        let json = serde_json::to_value(verb)?;
        self.put(&key, serde_json::to_vec(&json)?).await?;
        self.changes.record(
            verb.id.to_string(),
            EntityKind::Verb,
            if existed {
                ChangeOperation::Update
            } else {
                ChangeOperation::Create
            },
            Some(json),
        );
        Ok(!existed)
    }

    pub async fn get_verb_raw(&self, id: &EngramId) -> Result<Option<Verb>> {
        match self.backend.get(&keys::verb(id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get_verb(&self, id: &EngramId) -> Result<Option<VerbWithMetadata>> {
        let Some(verb) = self.get_verb_raw(id).await? else {
            return Ok(None);
        };
        let sidecar = self.get_verb_metadata(id).await?;
        Ok(Some(VerbWithMetadata::combine(verb, sidecar)))
    }

    pub async fn save_verb_metadata(&self, id: &EngramId, metadata: &VerbMetadata) -> Result<()> {
        self.put(&keys::verb_metadata(id), serde_json::to_vec(metadata)?)
            .await
    }

    pub async fn get_verb_metadata(&self, id: &EngramId) -> Result<Option<VerbMetadata>> {
        match self.backend.get(&keys::verb_metadata(id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_verb_metadata(&self, id: &EngramId) -> Result<bool> {
        self.backend.delete(&keys::verb_metadata(id)).await
    }

    pub async fn delete_verb(&self, id: &EngramId) -> Result<bool> {
        let removed = self.backend.delete(&keys::verb(id)).await?;
        let _ = self.backend.delete(&keys::verb_metadata(id)).await?;
        if removed {
            self.changes
                .record(id.to_string(), EntityKind::Verb, ChangeOperation::Delete, None);
        }
        Ok(removed)
    }

    /// Paginated, filtered verb listing.
    pub async fn get_verbs(
        &self,
        filter: &VerbFilter,
        pagination: &Pagination,
    ) -> Result<Page<VerbWithMetadata>> {
        let limit = pagination.effective_limit();
        let after = match &pagination.cursor {
            Some(encoded) => Some(Cursor::decode(encoded)?.last_key),
            None => None,
        };

        let keys = self.backend.list_keys(keys::VERB_PREFIX).await?;
        let mut items = Vec::with_capacity(limit.min(keys.len()));
        let mut last_key: Option<String> = None;
        let mut has_more = false;

        for key in keys {
            if let Some(after) = &after {
                if key.as_str() <= after.as_str() {
                    continue;
                }
            }
            let Some(id) = verb_id_from_key(&key) else {
                continue;
            };
            let Some(combined) = self.get_verb(&id).await? else {
                continue;
            };
            if !filter.matches(
                combined.verb.verb,
                &combined.verb.source_id,
                &combined.verb.target_id,
                &combined.service,
                &combined.metadata,
            ) {
                continue;
            }
            if items.len() == limit {
                has_more = true;
                break;
            }
            last_key = Some(key);
            items.push(combined);
        }

        let total_count = filter.is_empty().then(|| self.stats.verb_count());
        Ok(Page {
            items,
            next_cursor: if has_more {
                last_key.map(|k| Cursor::after(k).encode())
            } else {
                None
            },
            has_more,
            total_count,
        })
    }

    // ----- counts and changes ----------------------------------------------

    /// O(1), backed by the statistics counters.
    pub fn get_noun_count(&self) -> u64 {
        self.stats.noun_count()
    }

    /// O(1), backed by the statistics counters.
    pub fn get_verb_count(&self) -> u64 {
        self.stats.verb_count()
    }

    /// Mutations at or after `since`, oldest first.
    pub fn changes_since(&self, since: TimestampMs, limit: Option<usize>) -> Vec<Change> {
        self.changes.changes_since(since, limit)
    }

    // ----- statistics persistence ------------------------------------------

    /// Persist one JSON statistics snapshot. Never called from the write
    /// path; failures are logged by the flush task and swallowed.
    pub async fn flush_statistics_to_storage(&self) -> Result<()> {
        let snapshot = self.stats.snapshot();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        self.put(&keys::statistics(), bytes).await?;
        debug!("flushed statistics snapshot");
        Ok(())
    }

    async fn load_statistics(&self) {
        match self.backend.get(&keys::statistics()).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(snapshot) => self.stats.load_snapshot(&snapshot),
                Err(e) => warn!(error = %e, "ignoring unreadable statistics snapshot"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "could not read statistics snapshot"),
        }
    }

    /// Background flush loop: persists the snapshot at `interval` whenever
    /// counters changed, and once more on shutdown via task abort.
    pub fn spawn_statistics_flush(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if adapter.stats.take_dirty() {
                    if let Err(e) = adapter.flush_statistics_to_storage().await {
                        warn!(error = %e, "statistics flush failed");
                    }
                }
            }
        })
    }
}

fn throttle_reason(error: &EngramError) -> ThrottleReason {
    match error {
        EngramError::Throttled(_) => ThrottleReason::RateLimited,
        _ => ThrottleReason::ServiceUnavailable,
    }
}

fn noun_id_from_key(key: &str) -> Option<EngramId> {
    key.strip_prefix(keys::NOUN_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

fn verb_id_from_key(key: &str) -> Option<EngramId> {
    key.strip_prefix(keys::VERB_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectClient;
    use engram_core::{NounType, VerbType};
    use serde_json::json;

    fn sample_noun(noun_type: NounType) -> Noun {
        Noun::new(noun_type, vec![1.0, 0.0, 0.0])
    }

    #[tokio::test]
    async fn test_noun_roundtrip_combined_read() {
        let adapter = StorageAdapter::memory();
        let noun = sample_noun(NounType::Document);
        let mut sidecar = NounMetadata {
            service: "svc".to_string(),
            ..Default::default()
        };
        sidecar.fields.insert("title".to_string(), json!("hello"));

        assert!(adapter.save_noun(&noun).await.unwrap());
        adapter.save_noun_metadata(&noun.id, &sidecar).await.unwrap();

        let combined = adapter.get_noun(&noun.id).await.unwrap().unwrap();
        assert_eq!(combined.noun.vector, noun.vector);
        assert_eq!(combined.service, "svc");
        assert_eq!(combined.metadata["title"], json!("hello"));

        // Second save of the same id reports an update.
        assert!(!adapter.save_noun(&noun).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let adapter = StorageAdapter::memory();
        assert!(adapter.get("nope").await.unwrap().is_none());
        assert!(adapter.get_noun(&EngramId::new()).await.unwrap().is_none());
        assert!(adapter.get_verb(&EngramId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_noun_removes_sidecar() {
        let adapter = StorageAdapter::memory();
        let noun = sample_noun(NounType::Person);
        adapter.save_noun(&noun).await.unwrap();
        adapter
            .save_noun_metadata(&noun.id, &NounMetadata::default())
            .await
            .unwrap();

        assert!(adapter.delete_noun(&noun.id).await.unwrap());
        assert!(adapter.get_noun(&noun.id).await.unwrap().is_none());
        assert!(adapter.get_noun_metadata(&noun.id).await.unwrap().is_none());
        assert!(!adapter.delete_noun(&noun.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_pagination_walks_all_nouns() {
        let adapter = StorageAdapter::memory();
        let mut expected = Vec::new();
        for _ in 0..25 {
            let noun = sample_noun(NounType::Note);
            adapter.save_noun(&noun).await.unwrap();
            adapter
                .save_noun_metadata(&noun.id, &NounMetadata::default())
                .await
                .unwrap();
            expected.push(noun.id);
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = adapter
                .get_nouns(
                    &NounFilter::default(),
                    &Pagination {
                        limit: Some(10),
                        cursor,
                    },
                )
                .await
                .unwrap();
            seen.extend(page.items.iter().map(|n| n.id()));
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }
        expected.sort();
        seen.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_filtered_listing() {
        let adapter = StorageAdapter::memory();
        for i in 0..6 {
            let noun = sample_noun(if i % 2 == 0 {
                NounType::Document
            } else {
                NounType::Person
            });
            adapter.save_noun(&noun).await.unwrap();
            adapter
                .save_noun_metadata(
                    &noun.id,
                    &NounMetadata {
                        service: if i < 3 { "a" } else { "b" }.to_string(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let filter = NounFilter {
            noun_types: vec![NounType::Document],
            services: vec!["a".to_string()],
            ..Default::default()
        };
        let page = adapter
            .get_nouns(&filter, &Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page
            .items
            .iter()
            .all(|n| n.noun.noun == NounType::Document && n.service == "a"));
        // Filtered listings do not report a total.
        assert!(page.total_count.is_none());
    }

    #[tokio::test]
    async fn test_verb_listing_by_endpoint() {
        let adapter = StorageAdapter::memory();
        let hub = EngramId::new();
        for _ in 0..3 {
            let verb = Verb::new(VerbType::RelatedTo, hub, EngramId::new(), vec![1.0]);
            adapter.save_verb(&verb).await.unwrap();
        }
        let other = Verb::new(VerbType::RelatedTo, EngramId::new(), hub, vec![1.0]);
        adapter.save_verb(&other).await.unwrap();

        let outgoing = adapter
            .get_verbs(
                &VerbFilter {
                    source_id: Some(hub),
                    ..Default::default()
                },
                &Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(outgoing.items.len(), 3);

        let incoming = adapter
            .get_verbs(
                &VerbFilter {
                    target_id: Some(hub),
                    ..Default::default()
                },
                &Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(incoming.items.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_delete_memory_backend() {
        let adapter = StorageAdapter::memory();
        let keys: Vec<String> = (0..20).map(|i| format!("blob/{i:02}")).collect();
        for key in &keys {
            adapter.put(key, vec![1]).await.unwrap();
        }
        let result = adapter
            .batch_delete(&keys, &BatchDeleteOptions::default())
            .await;
        assert_eq!(result.requested, 20);
        assert_eq!(result.succeeded, 20);
        assert_eq!(result.failed, 0);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_batch_delete_object_store_uses_native_path() {
        let client = Arc::new(InMemoryObjectClient::new());
        let adapter = StorageAdapter::object_store(client.clone(), "bucket", "p")
            .await
            .unwrap();
        let keys: Vec<String> = (0..10).map(|i| format!("blob/{i}")).collect();
        for key in &keys {
            adapter.put(key, vec![1]).await.unwrap();
        }
        let result = adapter
            .batch_delete(&keys, &BatchDeleteOptions::default())
            .await;
        assert_eq!(result.succeeded, 10);
        // statistics.json may remain; all blob objects must be gone.
        for key in &keys {
            assert!(!adapter.exists(key).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_changes_feed_records_lifecycle() {
        let adapter = StorageAdapter::memory();
        let noun = sample_noun(NounType::Event);
        adapter.save_noun(&noun).await.unwrap();
        adapter.save_noun(&noun).await.unwrap();
        adapter.delete_noun(&noun.id).await.unwrap();

        let changes = adapter.changes_since(0, None);
        let ops: Vec<ChangeOperation> = changes.iter().map(|c| c.operation).collect();
        assert_eq!(
            ops,
            vec![
                ChangeOperation::Create,
                ChangeOperation::Update,
                ChangeOperation::Delete
            ]
        );
        assert!(changes[0].data.is_some());
        assert!(changes[2].data.is_none());
    }

    #[tokio::test]
    async fn test_statistics_flush_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let adapter = StorageAdapter::filesystem(dir.path()).await.unwrap();
            adapter
                .statistics()
                .record_noun_added(NounType::Document, "svc", false);
            adapter.flush_statistics_to_storage().await.unwrap();
        }
        let reopened = StorageAdapter::filesystem(dir.path()).await.unwrap();
        assert_eq!(reopened.get_noun_count(), 1);
        assert_eq!(
            reopened.statistics().noun_count_for(NounType::Document),
            1
        );
    }
}
