//! The database coordinator.
//!
//! `Engram` sequences every compound operation: add (embed → index →
//! persist → stat), search (route → fan out → rerank → filter), delete
//! (cascade → unindex), commits and history. It owns the wiring between
//! the index, graph, blob, and statistics layers; each layer keeps
//! owning its own state.

use crate::embedding::{EmbeddingGateway, EmbeddingProvider};
use async_trait::async_trait;
use engram_blob::{BlobStore, Commit, HistoryFilter, Tree, VersionStore};
use engram_core::{
    now_ms, CascadePolicy, DatabaseConfig, EngramError, EngramId, MetadataMap, Noun, NounMetadata,
    NounType, NounWithMetadata, Result, StorageConfig, Verb, VerbMetadata, VerbType,
    VerbWithMetadata, VectorStorageMode,
};
use engram_index::{
    normalize, HnswIndex, IndexHealth, PartitionedHealth, PartitionedIndex, ScoredId,
    SearchOptions, VectorFetcher,
};
use engram_storage::{
    keys, Change, NounFilter, ObjectClient, Page, Pagination, ServiceStatistics,
    StatisticsSnapshot, StorageAdapter, VerbFilter,
};
use futures::stream::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How often the statistics snapshot is persisted.
const STATS_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// ANN overfetch factor when a vector query carries metadata predicates.
const FIND_OVERFETCH: usize = 4;

/// Query/data input for `add` and `update`.
#[derive(Debug, Clone)]
pub enum AddData {
    /// Embedded through the gateway.
    Text(String),
    /// Used as-is.
    Vector(Vec<f32>),
}

/// Parameters for [`Engram::add`].
#[derive(Debug, Clone)]
pub struct AddRequest {
    pub data: AddData,
    pub noun_type: NounType,
    pub metadata: Option<MetadataMap>,
    pub service: Option<String>,
    pub confidence: Option<f32>,
    pub weight: Option<f32>,
    /// Explicit id; subject to the configured duplicate policy.
    pub id: Option<EngramId>,
    pub cancel: Option<CancellationToken>,
}

impl AddRequest {
    pub fn text(text: impl Into<String>, noun_type: NounType) -> Self {
        Self::new(AddData::Text(text.into()), noun_type)
    }

    pub fn vector(vector: Vec<f32>, noun_type: NounType) -> Self {
        Self::new(AddData::Vector(vector), noun_type)
    }

    fn new(data: AddData, noun_type: NounType) -> Self {
        Self {
            data,
            noun_type,
            metadata: None,
            service: None,
            confidence: None,
            weight: None,
            id: None,
            cancel: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_id(mut self, id: EngramId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Parameters for [`Engram::update`].
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// New vector (or text to embed); absent leaves the vector alone.
    pub data: Option<AddData>,
    /// New metadata fields.
    pub metadata: Option<MetadataMap>,
    /// Merge into existing fields instead of replacing them.
    pub merge: bool,
    pub cancel: Option<CancellationToken>,
}

/// Parameters for [`Engram::relate`].
#[derive(Debug, Clone)]
pub struct RelateRequest {
    pub from: EngramId,
    pub to: EngramId,
    pub verb_type: VerbType,
    pub weight: Option<f32>,
    pub confidence: Option<f32>,
    pub metadata: Option<MetadataMap>,
    pub service: Option<String>,
    /// Explicit edge vector; derived from the endpoints when absent.
    pub vector: Option<Vec<f32>>,
}

impl RelateRequest {
    pub fn new(from: EngramId, to: EngramId, verb_type: VerbType) -> Self {
        Self {
            from,
            to,
            verb_type,
            weight: None,
            confidence: None,
            metadata: None,
            service: None,
            vector: None,
        }
    }
}

/// Parameters for [`Engram::find`]: combined vector + metadata query.
#[derive(Debug, Clone, Default)]
pub struct FindRequest {
    pub text: Option<String>,
    pub vector: Option<Vec<f32>>,
    pub noun_types: Vec<NounType>,
    pub services: Vec<String>,
    /// key = value predicates over user metadata.
    pub where_metadata: Vec<(String, serde_json::Value)>,
    pub limit: usize,
    /// Only meaningful for metadata-only queries; vector queries rank by
    /// distance and do not paginate.
    pub cursor: Option<String>,
    pub cancel: Option<CancellationToken>,
}

/// One `find` result.
#[derive(Debug, Clone)]
pub struct FindHit {
    pub noun: NounWithMetadata,
    /// Present for vector-driven queries; lower is closer.
    pub distance: Option<f32>,
}

/// A page of `find` results.
#[derive(Debug, Clone)]
pub struct FindResult {
    pub hits: Vec<FindHit>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Health of whichever index shape is configured.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexHealthReport {
    Single(IndexHealth),
    Partitioned(PartitionedHealth),
}

/// Aggregate statistics across the subsystems.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseStatistics {
    pub statistics: StatisticsSnapshot,
    pub index: IndexHealthReport,
    pub blobs: engram_blob::BlobStoreStats,
}

enum IndexHandle {
    Single(HnswIndex),
    Partitioned(PartitionedIndex),
}

impl IndexHandle {
    fn insert(&self, id: EngramId, vector: Vec<f32>) -> Result<()> {
        match self {
            Self::Single(index) => index.insert(id, vector),
            Self::Partitioned(index) => index.insert(id, vector),
        }
    }

    fn remove(&self, id: &EngramId) -> bool {
        match self {
            Self::Single(index) => index.remove(id),
            Self::Partitioned(index) => index.remove(id),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Single(index) => index.len(),
            Self::Partitioned(index) => index.len(),
        }
    }

    fn topology(&self, id: &EngramId) -> Option<(engram_core::LayerConnections, u8)> {
        match self {
            Self::Single(index) => index.topology(id),
            Self::Partitioned(index) => index.topology(id),
        }
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&(dyn Fn(&EngramId) -> bool + Sync)>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<ScoredId>> {
        match self {
            Self::Single(index) => {
                index
                    .search(query, SearchOptions { k, filter, cancel })
                    .await
            }
            Self::Partitioned(index) => index.search_filtered(query, k, filter).await,
        }
    }

    fn health(&self) -> IndexHealthReport {
        match self {
            Self::Single(index) => IndexHealthReport::Single(index.health()),
            Self::Partitioned(index) => IndexHealthReport::Partitioned(index.health()),
        }
    }
}

/// Reloads evicted full-precision vectors from the persisted noun record.
struct AdapterVectorFetcher {
    adapter: Arc<StorageAdapter>,
}

#[async_trait]
impl VectorFetcher for AdapterVectorFetcher {
    async fn fetch_vector(&self, id: EngramId) -> Result<Option<Vec<f32>>> {
        Ok(self.adapter.get_noun_raw(&id).await?.map(|n| n.vector))
    }
}

/// The hybrid semantic database.
pub struct Engram {
    config: DatabaseConfig,
    adapter: Arc<StorageAdapter>,
    graph: engram_graph::GraphLayer,
    nouns_index: IndexHandle,
    verbs_index: HnswIndex,
    blobs: Arc<BlobStore>,
    versions: Arc<VersionStore>,
    embeddings: Arc<EmbeddingGateway>,
    flush_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Engram {
    /// Open a database over the memory or filesystem backend.
    pub async fn init(config: DatabaseConfig, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let adapter = match &config.storage {
            StorageConfig::Memory => Arc::new(StorageAdapter::memory()),
            StorageConfig::Filesystem { root } => {
                Arc::new(StorageAdapter::filesystem(root.clone()).await?)
            }
            StorageConfig::ObjectStore { .. } => {
                return Err(EngramError::invalid_configuration(
                    "object-store backend requires a registered client; use init_with_object_client",
                ));
            }
        };
        Self::with_adapter(config, provider, adapter).await
    }

    /// Open a database over an object-store backend.
    pub async fn init_with_object_client(
        config: DatabaseConfig,
        provider: Arc<dyn EmbeddingProvider>,
        client: Arc<dyn ObjectClient>,
    ) -> Result<Self> {
        let StorageConfig::ObjectStore { bucket, prefix } = &config.storage else {
            return Err(EngramError::invalid_configuration(
                "init_with_object_client requires an object_store storage config",
            ));
        };
        let adapter =
            Arc::new(StorageAdapter::object_store(client, bucket.clone(), prefix.clone()).await?);
        Self::with_adapter(config, provider, adapter).await
    }

    async fn with_adapter(
        config: DatabaseConfig,
        provider: Arc<dyn EmbeddingProvider>,
        adapter: Arc<StorageAdapter>,
    ) -> Result<Self> {
        if config.hnsw.quantization.rerank_multiplier == 0 {
            return Err(EngramError::invalid_configuration(
                "rerank_multiplier must be at least 1",
            ));
        }

        let fetcher: Arc<dyn VectorFetcher> = Arc::new(AdapterVectorFetcher {
            adapter: Arc::clone(&adapter),
        });

        let nouns_index = if config.partitioning.max_nodes_per_partition > 0 {
            IndexHandle::Partitioned(PartitionedIndex::with_fetcher(
                config.hnsw.clone(),
                config.partitioning.clone(),
                Arc::clone(&fetcher),
            ))
        } else {
            IndexHandle::Single(HnswIndex::with_fetcher(
                config.hnsw.clone(),
                Arc::clone(&fetcher),
            ))
        };

        // The verb index stays resident: edge vectors are small and the
        // lazy fetch path only resolves noun records.
        let mut verb_hnsw = config.hnsw.clone();
        verb_hnsw.vector_storage = VectorStorageMode::Memory;
        let verbs_index = HnswIndex::new(verb_hnsw);

        let blobs = Arc::new(BlobStore::new(Arc::clone(&adapter)));
        let versions = Arc::new(VersionStore::new(Arc::clone(&blobs)));
        let graph = engram_graph::GraphLayer::new(Arc::clone(&adapter), config.cascade_policy);

        let db = Self {
            embeddings: Arc::new(EmbeddingGateway::new(provider)),
            config,
            graph,
            nouns_index,
            verbs_index,
            blobs,
            versions,
            flush_task: parking_lot::Mutex::new(None),
            adapter,
        };
        db.rebuild_indexes_from_storage().await?;
        db.persist_index_config().await?;
        *db.flush_task.lock() = Some(db.adapter.spawn_statistics_flush(STATS_FLUSH_INTERVAL));
        Ok(db)
    }

    /// Record the index configuration under `index/` so a reopened store
    /// can be checked against the parameters it was built with.
    async fn persist_index_config(&self) -> Result<()> {
        let record = serde_json::json!({
            "dimensions": self.config.dimensions,
            "hnsw": self.config.hnsw,
            "partitioning": self.config.partitioning,
        });
        self.adapter
            .put("index/config.json", serde_json::to_vec_pretty(&record)?)
            .await
    }

    /// Re-populate the in-memory indexes from persisted records. A no-op
    /// on a fresh store.
    async fn rebuild_indexes_from_storage(&self) -> Result<()> {
        let mut cursor = None;
        let mut restored = 0usize;
        loop {
            let page = self
                .adapter
                .get_nouns(
                    &NounFilter::default(),
                    &Pagination {
                        limit: Some(500),
                        cursor,
                    },
                )
                .await?;
            for noun in &page.items {
                self.nouns_index
                    .insert(noun.noun.id, noun.noun.vector.clone())?;
                restored += 1;
            }
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }

        let mut cursor = None;
        loop {
            let page = self
                .adapter
                .get_verbs(
                    &VerbFilter::default(),
                    &Pagination {
                        limit: Some(500),
                        cursor,
                    },
                )
                .await?;
            for verb in &page.items {
                self.verbs_index.insert(verb.verb.id, verb.verb.vector.clone())?;
                restored += 1;
            }
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }

        if restored > 0 {
            info!(restored, "rebuilt indexes from storage");
            self.adapter
                .statistics()
                .update_hnsw_index_size(self.nouns_index.len() as u64);
        }
        Ok(())
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<StorageAdapter> {
        &self.adapter
    }

    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    // ----- entity lifecycle ------------------------------------------------

    /// Add an entity. Text is embedded; vectors are used as-is. Returns
    /// the assigned id.
    pub async fn add(&self, request: AddRequest) -> Result<EngramId> {
        // Embedding happens before any write: a provider failure leaves
        // the store unchanged.
        let vector = self.resolve_vector(&request.data).await?;
        ensure_not_cancelled(request.cancel.as_ref(), "add")?;
        self.check_dimensions(&vector)?;

        let id = match request.id {
            Some(id) => {
                if self.config.strict_ids && self.adapter.get_noun_raw(&id).await?.is_some() {
                    return Err(EngramError::DuplicateId(id.to_string()));
                }
                id
            }
            None => EngramId::new(),
        };

        self.nouns_index.insert(id, vector.clone())?;

        let mut noun = Noun::with_id(id, request.noun_type, vector);
        if let Some((connections, top_layer)) = self.nouns_index.topology(&id) {
            noun.connections = connections;
            noun.top_layer = top_layer;
        }

        let service = request
            .service
            .unwrap_or_else(|| self.config.default_service.clone());
        let sidecar = NounMetadata {
            noun: Some(request.noun_type),
            service,
            confidence: request.confidence,
            weight: request.weight,
            created_at: Some(noun.created_at),
            updated_at: Some(noun.updated_at),
            fields: request.metadata.unwrap_or_default(),
        };

        if let Err(e) = self.graph.add_noun(&noun, &sidecar).await {
            // Keep index and storage in step when persistence fails.
            self.nouns_index.remove(&id);
            return Err(e);
        }

        if self.config.track_entity_versions {
            self.versions
                .write_entity_version(&id, &serde_json::to_vec(&noun)?)
                .await?;
        }

        self.adapter
            .statistics()
            .update_hnsw_index_size(self.nouns_index.len() as u64);
        debug!(%id, noun_type = %request.noun_type, "added noun");
        Ok(id)
    }

    /// Canonical combined read.
    pub async fn get(&self, id: &EngramId) -> Result<Option<NounWithMetadata>> {
        self.graph.get_noun(id).await
    }

    /// Update vector and/or metadata. A vector update removes and
    /// re-inserts the node (overwrite semantics; neighbor history is
    /// rebuilt from scratch).
    pub async fn update(&self, id: &EngramId, request: UpdateRequest) -> Result<()> {
        let Some(mut noun) = self.adapter.get_noun_raw(id).await? else {
            return Err(EngramError::not_found("noun", id));
        };

        if let Some(data) = &request.data {
            let vector = self.resolve_vector(data).await?;
            ensure_not_cancelled(request.cancel.as_ref(), "update")?;
            self.check_dimensions(&vector)?;

            self.nouns_index.remove(id);
            self.nouns_index.insert(*id, vector.clone())?;

            noun.vector = vector;
            noun.updated_at = now_ms();
            if let Some((connections, top_layer)) = self.nouns_index.topology(id) {
                noun.connections = connections;
                noun.top_layer = top_layer;
            }
            self.adapter.save_noun(&noun).await?;

            let service = self
                .adapter
                .get_noun_metadata(id)
                .await?
                .map(|m| m.service)
                .unwrap_or_else(|| self.config.default_service.clone());
            self.adapter
                .statistics()
                .record_noun_added(noun.noun, &service, true);
        }

        if let Some(fields) = request.metadata {
            self.graph
                .update_noun_metadata(id, fields, request.merge)
                .await?;
        }

        if self.config.track_entity_versions {
            self.versions
                .write_entity_version(id, &serde_json::to_vec(&noun)?)
                .await?;
        }
        Ok(())
    }

    /// Delete an entity, applying the cascade policy to incident verbs.
    pub async fn delete(
        &self,
        id: &EngramId,
        cascade_policy: Option<CascadePolicy>,
    ) -> Result<bool> {
        let policy = cascade_policy.unwrap_or(self.config.cascade_policy);
        let incident: Vec<EngramId> = if policy == CascadePolicy::Cascade {
            self.graph
                .incident_verbs(id)
                .await?
                .iter()
                .map(|v| v.id())
                .collect()
        } else {
            Vec::new()
        };

        let removed = self.graph.delete_noun(id, Some(policy)).await?;
        if removed {
            self.nouns_index.remove(id);
            for verb_id in incident {
                self.verbs_index.remove(&verb_id);
            }
            self.adapter
                .statistics()
                .update_hnsw_index_size(self.nouns_index.len() as u64);
        }
        Ok(removed)
    }

    // ----- relationships ---------------------------------------------------

    /// Create a typed edge. Returns the verb id.
    pub async fn relate(&self, request: RelateRequest) -> Result<EngramId> {
        let vector = match request.vector {
            Some(vector) => {
                self.check_dimensions(&vector)?;
                vector
            }
            None => self.derive_edge_vector(&request.from, &request.to).await?,
        };

        let verb = Verb::new(request.verb_type, request.from, request.to, vector.clone());
        let verb_id = verb.id;
        let sidecar = VerbMetadata {
            verb: Some(request.verb_type),
            service: request
                .service
                .unwrap_or_else(|| self.config.default_service.clone()),
            weight: request.weight,
            confidence: request.confidence,
            created_at: Some(verb.created_at),
            updated_at: Some(verb.updated_at),
            fields: request.metadata.unwrap_or_default(),
        };

        self.graph.add_verb(&verb, &sidecar).await?;
        self.verbs_index.insert(verb_id, vector)?;
        debug!(%verb_id, verb_type = %request.verb_type, "related nouns");
        Ok(verb_id)
    }

    /// Remove a typed edge. Returns whether it existed.
    pub async fn unrelate(&self, verb_id: &EngramId) -> Result<bool> {
        let removed = self.graph.delete_verb(verb_id).await?;
        if removed {
            self.verbs_index.remove(verb_id);
        }
        Ok(removed)
    }

    pub async fn get_verb(&self, id: &EngramId) -> Result<Option<VerbWithMetadata>> {
        self.graph.get_verb(id).await
    }

    /// Relations of an entity, filtered and paginated.
    pub async fn get_relations(
        &self,
        id: &EngramId,
        direction: engram_graph::Direction,
        verb_types: &[VerbType],
        pagination: &Pagination,
    ) -> Result<Page<VerbWithMetadata>> {
        self.graph
            .get_relations(id, direction, verb_types, pagination)
            .await
    }

    /// Graph traversal from an entity.
    pub async fn traverse(
        &self,
        source: &EngramId,
        direction: engram_graph::Direction,
        max_depth: Option<usize>,
        verb_types: Option<&[VerbType]>,
    ) -> Result<Vec<engram_graph::TraversalHit>> {
        self.graph
            .traverse(source, direction, max_depth, verb_types)
            .await
    }

    /// Edges whose vector representation is closest to the given verb's.
    pub async fn find_similar_relations(
        &self,
        verb_id: &EngramId,
        k: usize,
    ) -> Result<Vec<(VerbWithMetadata, f32)>> {
        let Some(origin) = self.adapter.get_verb_raw(verb_id).await? else {
            return Err(EngramError::not_found("verb", verb_id));
        };
        let exclude = *verb_id;
        let filter = move |candidate: &EngramId| *candidate != exclude;
        let hits = self
            .verbs_index
            .search(
                &origin.vector,
                SearchOptions {
                    k,
                    filter: Some(&filter),
                    cancel: None,
                },
            )
            .await?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(verb) = self.graph.get_verb(&hit.id).await? {
                results.push((verb, hit.distance));
            }
        }
        Ok(results)
    }

    // ----- search ----------------------------------------------------------

    /// Pure ANN: the k nearest entity ids with distances.
    pub async fn find_nearest(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        self.nouns_index.search(vector, k, None, None).await
    }

    /// ANN with a candidate predicate.
    pub async fn find_nearest_filtered(
        &self,
        vector: &[f32],
        k: usize,
        filter: &(dyn Fn(&EngramId) -> bool + Sync),
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<ScoredId>> {
        self.nouns_index.search(vector, k, Some(filter), cancel).await
    }

    /// Combined vector + metadata query.
    ///
    /// With a query (text or vector), candidates come from the index and
    /// are post-filtered against types, services, and metadata
    /// predicates. Without one, this is a filtered listing with cursor
    /// pagination.
    pub async fn find(&self, request: FindRequest) -> Result<FindResult> {
        let limit = if request.limit == 0 { 10 } else { request.limit };
        let filter = NounFilter {
            noun_types: request.noun_types.clone(),
            services: request.services.clone(),
            metadata: request.where_metadata.clone(),
        };

        let query = match (&request.vector, &request.text) {
            (Some(vector), _) => Some(vector.clone()),
            (None, Some(text)) => Some(self.resolve_vector(&AddData::Text(text.clone())).await?),
            (None, None) => None,
        };

        let Some(query) = query else {
            let page = self
                .adapter
                .get_nouns(
                    &filter,
                    &Pagination {
                        limit: Some(limit),
                        cursor: request.cursor.clone(),
                    },
                )
                .await?;
            return Ok(FindResult {
                hits: page
                    .items
                    .into_iter()
                    .map(|noun| FindHit {
                        noun,
                        distance: None,
                    })
                    .collect(),
                next_cursor: page.next_cursor,
                has_more: page.has_more,
            });
        };

        ensure_not_cancelled(request.cancel.as_ref(), "find")?;
        let fetch_k = if filter.is_empty() {
            limit
        } else {
            limit.saturating_mul(FIND_OVERFETCH)
        };
        let candidates = self
            .nouns_index
            .search(&query, fetch_k, None, request.cancel.as_ref())
            .await?;

        let mut hits = Vec::with_capacity(limit);
        let mut matched_beyond_limit = false;
        for candidate in candidates {
            ensure_not_cancelled(request.cancel.as_ref(), "find")?;
            let Some(noun) = self.graph.get_noun(&candidate.id).await? else {
                continue;
            };
            if !filter.matches(noun.noun.noun, &noun.service, &noun.metadata) {
                continue;
            }
            if hits.len() == limit {
                matched_beyond_limit = true;
                break;
            }
            hits.push(FindHit {
                noun,
                distance: Some(candidate.distance),
            });
        }
        Ok(FindResult {
            hits,
            next_cursor: None,
            has_more: matched_beyond_limit,
        })
    }

    // ----- versioning ------------------------------------------------------

    /// Create a commit; `capture_state` snapshots the live entity ids
    /// into the commit's tree.
    pub async fn commit(
        &self,
        message: impl Into<String>,
        author: impl Into<String>,
        capture_state: bool,
    ) -> Result<Commit> {
        let tree = if capture_state {
            let noun_ids = self
                .adapter
                .list_keys(keys::NOUN_PREFIX)
                .await?
                .into_iter()
                .filter_map(|k| id_from_record_key(&k, keys::NOUN_PREFIX))
                .collect();
            let verb_ids = self
                .adapter
                .list_keys(keys::VERB_PREFIX)
                .await?
                .into_iter()
                .filter_map(|k| id_from_record_key(&k, keys::VERB_PREFIX))
                .collect();
            Tree::new(noun_ids, verb_ids)
        } else {
            Tree::default()
        };
        self.versions.commit(message, author, tree).await
    }

    /// Lazy newest-first history stream.
    pub fn stream_history(&self, filter: HistoryFilter) -> impl Stream<Item = Result<Commit>> + '_ {
        self.versions.stream_history(filter)
    }

    /// Eager history, for callers that genuinely want the whole list.
    pub async fn get_history(&self, filter: &HistoryFilter) -> Result<Vec<Commit>> {
        self.versions.get_history(filter).await
    }

    // ----- statistics ------------------------------------------------------

    pub fn get_statistics(&self) -> DatabaseStatistics {
        DatabaseStatistics {
            statistics: self.adapter.statistics().snapshot(),
            index: self.nouns_index.health(),
            blobs: self.blobs.stats(),
        }
    }

    pub fn list_services(&self) -> Vec<String> {
        self.adapter.statistics().list_services()
    }

    pub fn get_service_statistics(&self, name: &str) -> Option<ServiceStatistics> {
        self.adapter.statistics().service_statistics(name)
    }

    /// O(1) entity counts.
    pub fn get_noun_count(&self) -> u64 {
        self.adapter.get_noun_count()
    }

    pub fn get_verb_count(&self) -> u64 {
        self.adapter.get_verb_count()
    }

    /// Mutations observed at or after `since`.
    pub fn changes_since(&self, since: engram_core::TimestampMs, limit: Option<usize>) -> Vec<Change> {
        self.adapter.changes_since(since, limit)
    }

    /// Stop background work and persist a final statistics snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(task) = self.flush_task.lock().take() {
            task.abort();
        }
        self.adapter.flush_statistics_to_storage().await
    }

    // ----- internals -------------------------------------------------------

    async fn resolve_vector(&self, data: &AddData) -> Result<Vec<f32>> {
        match data {
            AddData::Text(text) => self.embeddings.embed(text).await,
            AddData::Vector(vector) => {
                let mut vector = vector.clone();
                normalize(&mut vector);
                Ok(vector)
            }
        }
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if self.config.dimensions > 0 && vector.len() != self.config.dimensions {
            return Err(EngramError::dimension_mismatch(
                self.config.dimensions,
                vector.len(),
            ));
        }
        Ok(())
    }

    /// Endpoint-derived edge vector: the normalized midpoint.
    async fn derive_edge_vector(&self, from: &EngramId, to: &EngramId) -> Result<Vec<f32>> {
        let Some(source) = self.adapter.get_noun_raw(from).await? else {
            return Err(EngramError::not_found("noun", from));
        };
        let Some(target) = self.adapter.get_noun_raw(to).await? else {
            return Err(EngramError::not_found("noun", to));
        };
        if source.vector.len() != target.vector.len() {
            return Err(EngramError::dimension_mismatch(
                source.vector.len(),
                target.vector.len(),
            ));
        }
        let mut vector: Vec<f32> = source
            .vector
            .iter()
            .zip(target.vector.iter())
            .map(|(a, b)| (a + b) / 2.0)
            .collect();
        normalize(&mut vector);
        Ok(vector)
    }
}

impl Drop for Engram {
    fn drop(&mut self) {
        if let Some(task) = self.flush_task.lock().take() {
            task.abort();
        }
    }
}

fn ensure_not_cancelled(cancel: Option<&CancellationToken>, operation: &str) -> Result<()> {
    if let Some(token) = cancel {
        if token.is_cancelled() {
            return Err(EngramError::cancelled(operation));
        }
    }
    Ok(())
}

fn id_from_record_key(key: &str, prefix: &str) -> Option<String> {
    key.strip_prefix(prefix)?
        .strip_suffix(".json")
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use futures::{pin_mut, StreamExt};
    use serde_json::json;

    async fn open_db() -> Engram {
        let config = DatabaseConfig::default();
        Engram::init(config, Arc::new(HashEmbedder::new(64)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_and_get_roundtrip() {
        let db = open_db().await;
        let mut metadata = MetadataMap::new();
        metadata.insert("title".to_string(), json!("Hello"));

        let id = db
            .add(
                AddRequest::text("Hello world", NounType::Document)
                    .with_metadata(metadata)
                    .with_service("tester"),
            )
            .await
            .unwrap();

        let noun = db.get(&id).await.unwrap().unwrap();
        assert_eq!(noun.noun.noun, NounType::Document);
        assert_eq!(noun.service, "tester");
        assert_eq!(noun.metadata["title"], json!("Hello"));

        // Embedded vectors are unit-normalized.
        let norm: f32 = noun.noun.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);

        assert_eq!(db.get_noun_count(), 1);
        let stats = db.get_statistics();
        assert_eq!(stats.statistics.noun_counts.get("document"), Some(&1));
    }

    #[tokio::test]
    async fn test_strict_ids_reject_duplicates() {
        let mut config = DatabaseConfig::default();
        config.strict_ids = true;
        let db = Engram::init(config, Arc::new(HashEmbedder::new(16)))
            .await
            .unwrap();

        let id = EngramId::new();
        db.add(AddRequest::vector(vec![1.0; 16], NounType::Thing).with_id(id))
            .await
            .unwrap();
        let err = db
            .add(AddRequest::vector(vec![0.5; 16], NounType::Thing).with_id(id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngramError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_dimension_enforcement() {
        let mut config = DatabaseConfig::default();
        config.dimensions = 8;
        let db = Engram::init(config, Arc::new(HashEmbedder::new(8)))
            .await
            .unwrap();

        db.add(AddRequest::vector(vec![1.0; 8], NounType::Thing))
            .await
            .unwrap();
        let err = db
            .add(AddRequest::vector(vec![1.0; 4], NounType::Thing))
            .await
            .unwrap_err();
        assert!(matches!(err, EngramError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_find_nearest_returns_self() {
        let db = open_db().await;
        let id = db
            .add(AddRequest::text("the quick brown fox", NounType::Note))
            .await
            .unwrap();
        let query = db.get(&id).await.unwrap().unwrap().noun.vector;

        let hits = db.find_nearest(&query, 1).await.unwrap();
        assert_eq!(hits[0].id, id);
        assert!(hits[0].distance < 1e-5);
    }

    #[tokio::test]
    async fn test_find_with_metadata_filter() {
        let db = open_db().await;
        for (text, lang) in [
            ("rust systems programming", "en"),
            ("rust game development", "en"),
            ("rust web frameworks", "fr"),
        ] {
            let mut metadata = MetadataMap::new();
            metadata.insert("lang".to_string(), json!(lang));
            db.add(AddRequest::text(text, NounType::Document).with_metadata(metadata))
                .await
                .unwrap();
        }

        let result = db
            .find(FindRequest {
                text: Some("rust programming".to_string()),
                where_metadata: vec![("lang".to_string(), json!("en"))],
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.hits.len(), 2);
        assert!(result
            .hits
            .iter()
            .all(|h| h.noun.metadata["lang"] == json!("en")));
        assert!(result.hits.iter().all(|h| h.distance.is_some()));
    }

    #[tokio::test]
    async fn test_find_without_query_lists_by_type() {
        let db = open_db().await;
        db.add(AddRequest::text("a", NounType::Person)).await.unwrap();
        db.add(AddRequest::text("b", NounType::Document))
            .await
            .unwrap();

        let result = db
            .find(FindRequest {
                noun_types: vec![NounType::Person],
                limit: 100,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.hits.len(), 1);
        assert!(result.hits[0].distance.is_none());

        // No entities of the requested type: empty, not an error.
        let result = db
            .find(FindRequest {
                noun_types: vec![NounType::Currency],
                limit: 100,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.hits.is_empty());
    }

    #[tokio::test]
    async fn test_relate_traverse_unrelate() {
        let db = open_db().await;
        let a = db
            .add(AddRequest::text("compiler", NounType::Tool))
            .await
            .unwrap();
        let b = db
            .add(AddRequest::text("linker", NounType::Tool))
            .await
            .unwrap();

        let verb_id = db
            .relate(RelateRequest::new(a, b, VerbType::DependsOn))
            .await
            .unwrap();
        assert_eq!(db.get_verb_count(), 1);

        let verb = db.get_verb(&verb_id).await.unwrap().unwrap();
        assert_eq!(verb.verb.source_id, a);
        assert_eq!(verb.verb.target_id, b);
        // Derived edge vector is normalized.
        let norm: f32 = verb.verb.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);

        let hits = db
            .traverse(&a, engram_graph::Direction::Out, None, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].noun.id(), b);
        assert_eq!(hits[0].path, vec![verb_id]);

        assert!(db.unrelate(&verb_id).await.unwrap());
        assert_eq!(db.get_verb_count(), 0);
    }

    #[tokio::test]
    async fn test_cascade_delete_cleans_both_indexes() {
        let db = open_db().await;
        let a = db.add(AddRequest::text("a", NounType::Thing)).await.unwrap();
        let b = db.add(AddRequest::text("b", NounType::Thing)).await.unwrap();
        let verb_id = db
            .relate(RelateRequest::new(a, b, VerbType::RelatedTo))
            .await
            .unwrap();

        assert!(db.delete(&a, None).await.unwrap());
        assert!(db.get(&a).await.unwrap().is_none());
        assert!(db.get_verb(&verb_id).await.unwrap().is_none());
        assert_eq!(db.get_noun_count(), 1);
        assert_eq!(db.get_verb_count(), 0);

        // The deleted entity no longer surfaces in searches.
        let query = db.get(&b).await.unwrap().unwrap().noun.vector;
        let hits = db.find_nearest(&query, 2).await.unwrap();
        assert!(hits.iter().all(|h| h.id != a));
    }

    #[tokio::test]
    async fn test_update_vector_delete_then_reinsert() {
        let db = open_db().await;
        let id = db
            .add(AddRequest::text("original text", NounType::Note))
            .await
            .unwrap();

        db.update(
            &id,
            UpdateRequest {
                data: Some(AddData::Text("completely different subject".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let updated = db.get(&id).await.unwrap().unwrap();
        let hits = db.find_nearest(&updated.noun.vector, 1).await.unwrap();
        assert_eq!(hits[0].id, id);
        assert!(hits[0].distance < 1e-5);
        assert!(updated.noun.updated_at >= updated.noun.created_at);
    }

    #[tokio::test]
    async fn test_commit_and_stream_history() {
        let db = open_db().await;
        db.add(AddRequest::text("x", NounType::Thing)).await.unwrap();
        let commit = db.commit("snapshot", "tester", true).await.unwrap();
        assert_eq!(db.versions().head().await.unwrap(), Some(commit.hash.clone()));

        let tree = db.versions().get_tree(&commit).await.unwrap();
        assert_eq!(tree.noun_ids.len(), 1);

        let stream = db.stream_history(HistoryFilter {
            limit: Some(1),
            ..Default::default()
        });
        pin_mut!(stream);
        let latest = stream.next().await.unwrap().unwrap();
        assert_eq!(latest, commit);
    }

    #[tokio::test]
    async fn test_cancelled_add_leaves_store_unchanged() {
        let db = open_db().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut request = AddRequest::text("doomed", NounType::Thing);
        request.cancel = Some(cancel);
        let err = db.add(request).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(db.get_noun_count(), 0);
    }

    #[tokio::test]
    async fn test_similar_relations() {
        let db = open_db().await;
        let a = db.add(AddRequest::text("alpha service", NounType::Service)).await.unwrap();
        let b = db.add(AddRequest::text("beta service", NounType::Service)).await.unwrap();
        let c = db.add(AddRequest::text("gamma database", NounType::Service)).await.unwrap();

        let ab = db
            .relate(RelateRequest::new(a, b, VerbType::DependsOn))
            .await
            .unwrap();
        let ac = db
            .relate(RelateRequest::new(a, c, VerbType::DependsOn))
            .await
            .unwrap();

        let similar = db.find_similar_relations(&ab, 1).await.unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].0.id(), ac);
    }

    #[tokio::test]
    async fn test_reopen_restores_index_from_filesystem() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DatabaseConfig {
            storage: StorageConfig::Filesystem {
                root: dir.path().to_path_buf(),
            },
            ..Default::default()
        };

        let id;
        let vector;
        {
            let db = Engram::init(config.clone(), Arc::new(HashEmbedder::new(32)))
                .await
                .unwrap();
            id = db
                .add(AddRequest::text("persistent entity", NounType::Document))
                .await
                .unwrap();
            vector = db.get(&id).await.unwrap().unwrap().noun.vector;
            db.shutdown().await.unwrap();
        }

        let reopened = Engram::init(config, Arc::new(HashEmbedder::new(32)))
            .await
            .unwrap();
        assert_eq!(reopened.get_noun_count(), 1);
        let hits = reopened.find_nearest(&vector, 1).await.unwrap();
        assert_eq!(hits[0].id, id);
    }
}
