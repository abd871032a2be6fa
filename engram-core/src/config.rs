//! Configuration types for the database core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Expected embedding dimension. Zero means "fix on first insert".
    #[serde(default)]
    pub dimensions: usize,
    /// Storage backend selection.
    #[serde(default)]
    pub storage: StorageConfig,
    /// HNSW index parameters.
    #[serde(default)]
    pub hnsw: HnswConfig,
    /// Partitioning; disabled unless `max_nodes_per_partition > 0`.
    #[serde(default)]
    pub partitioning: PartitionConfig,
    /// What happens to incident verbs when a noun is deleted.
    #[serde(default)]
    pub cascade_policy: CascadePolicy,
    /// Service attribution used when a caller does not supply one.
    #[serde(default = "default_service")]
    pub default_service: String,
    /// When true, explicit-id inserts over an existing id error instead of
    /// overwriting.
    #[serde(default)]
    pub strict_ids: bool,
    /// When true, every add/update also records the entity state as a
    /// content-addressed version blob.
    #[serde(default)]
    pub track_entity_versions: bool,
}

fn default_service() -> String {
    "default".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dimensions: 0,
            storage: StorageConfig::default(),
            hnsw: HnswConfig::default(),
            partitioning: PartitionConfig::default(),
            cascade_policy: CascadePolicy::default(),
            default_service: default_service(),
            strict_ids: false,
            track_entity_versions: false,
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Everything in process memory; dropped on shutdown.
    Memory,
    /// One JSON file per record under `root`.
    Filesystem { root: PathBuf },
    /// S3-style object store reached through a registered client.
    ObjectStore { bucket: String, prefix: String },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// HNSW index parameters.
///
/// The defaults favor recall at 384-dimensional embedding scale; lower
/// `ef_search` for latency-sensitive deployments or enable
/// `dynamic_parameter_tuning` and let the index adjust itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Maximum connections per node per layer (M). Typical range 16-48.
    pub m: usize,
    /// Candidate list size during construction. Higher = better graph,
    /// slower inserts.
    pub ef_construction: usize,
    /// Candidate list size during search. Higher = better recall, slower
    /// queries.
    pub ef_search: usize,
    /// Maximum layer a node may be assigned to.
    pub max_level: u8,
    /// Scalar quantization settings.
    #[serde(default)]
    pub quantization: QuantizationConfig,
    /// Where full-precision vectors live after insert.
    #[serde(default)]
    pub vector_storage: VectorStorageMode,
    /// When true, `ef_search` is lowered after queries that breach
    /// `target_search_latency_ms`.
    #[serde(default)]
    pub dynamic_parameter_tuning: bool,
    /// Soft latency cap for a single search, in milliseconds.
    #[serde(default = "default_target_latency")]
    pub target_search_latency_ms: u64,
}

fn default_target_latency() -> u64 {
    150
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 100,
            max_level: 16,
            quantization: QuantizationConfig::default(),
            vector_storage: VectorStorageMode::default(),
            dynamic_parameter_tuning: false,
            target_search_latency_ms: default_target_latency(),
        }
    }
}

/// SQ8 scalar quantization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizationConfig {
    /// Use quantized distances during graph traversal.
    pub enabled: bool,
    /// How many candidates (multiple of k) to rerank against exact
    /// distances. 1 disables the rerank pass.
    pub rerank_multiplier: usize,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rerank_multiplier: 3,
        }
    }
}

/// Where the index keeps full-precision vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorStorageMode {
    /// Full vectors stay resident in the index.
    #[default]
    Memory,
    /// Vectors are evicted after insert and fetched from storage when a
    /// rerank needs them. Requires a storage adapter; silently degrades to
    /// `Memory` without one.
    Lazy,
}

/// Partitioning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Split threshold. Zero disables partitioning entirely.
    pub max_nodes_per_partition: usize,
    /// How inserts are routed to partitions.
    pub strategy: PartitionStrategy,
    /// How searches pick partitions to visit.
    pub search: SearchFanout,
    /// Fraction of partitions visited by an adaptive search.
    pub coverage_ratio: f64,
    /// Adaptive search always visits at least this many partitions.
    pub min_partitions_searched: usize,
    /// Parallelism cap for cross-partition search fan-out.
    pub max_concurrent_searches: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            max_nodes_per_partition: 0,
            strategy: PartitionStrategy::Semantic,
            search: SearchFanout::Adaptive,
            coverage_ratio: 0.25,
            min_partitions_searched: 3,
            max_concurrent_searches: 8,
        }
    }
}

/// Insert-routing strategy for a partitioned index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Stable hash of the id modulo partition count.
    Hash,
    /// Nearest-centroid assignment with auto-tuned partition count.
    Semantic,
    /// Semantic for the hot set, hash overflow for outliers.
    Hybrid,
}

/// Search fan-out strategy across partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchFanout {
    /// Score partitions by centroid distance and visit the closest subset.
    Adaptive,
    /// Visit every partition.
    Broadcast,
}

/// What happens to incident verbs when a noun is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Delete all incident verbs with the noun.
    #[default]
    Cascade,
    /// Keep incident verbs, mark them orphaned; traversals skip them.
    Orphan,
    /// Refuse to delete a noun that still has incident verbs.
    Deny,
}
