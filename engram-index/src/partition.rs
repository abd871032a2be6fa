//! Partitioned HNSW.
//!
//! Bounds any single graph at `max_nodes_per_partition` nodes. Inserts
//! route by stable id hash, nearest centroid, or a hybrid of both;
//! oversized partitions split with a 2-means pass. Searches fan out over
//! a centroid-scored subset of partitions (or all of them) and merge by
//! ascending distance.
//!
//! Each partition wraps its own [`HnswIndex`], so inserts serialize per
//! partition behind that index's write lock while proceeding concurrently
//! across partitions.

use crate::hnsw::{HnswIndex, ScoredId, SearchOptions, VectorFetcher};
use engram_core::{
    EngramError, EngramId, HnswConfig, PartitionConfig, PartitionStrategy, Result, SearchFanout,
};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info};

/// Lower bound on the auto-tuned partition count.
const MIN_PARTITIONS: usize = 4;
/// Upper bound on the auto-tuned partition count.
const MAX_PARTITIONS: usize = 64;
/// 2-means refinement rounds during a split.
const SPLIT_ROUNDS: usize = 4;

struct Partition {
    index: HnswIndex,
    /// Running mean of member vectors; empty until the first insert.
    centroid: RwLock<Vec<f32>>,
}

impl Partition {
    fn new(config: HnswConfig, fetcher: Option<Arc<dyn VectorFetcher>>) -> Self {
        let index = match fetcher {
            Some(f) => HnswIndex::with_fetcher(config, f),
            None => HnswIndex::new(config),
        };
        Self {
            index,
            centroid: RwLock::new(Vec::new()),
        }
    }

    fn centroid_distance(&self, query: &[f32]) -> f32 {
        let centroid = self.centroid.read();
        if centroid.is_empty() || centroid.len() != query.len() {
            return f32::MAX;
        }
        crate::distance::cosine_unchecked(query, &centroid)
    }

    /// Fold one vector into the running centroid mean.
    fn absorb(&self, vector: &[f32]) {
        let mut centroid = self.centroid.write();
        let n = self.index.len() as f32;
        if centroid.len() != vector.len() {
            *centroid = vector.to_vec();
            return;
        }
        for (c, v) in centroid.iter_mut().zip(vector.iter()) {
            *c += (v - *c) / n.max(1.0);
        }
    }

    fn set_centroid(&self, centroid: Vec<f32>) {
        *self.centroid.write() = centroid;
    }
}

/// Health metrics across all partitions.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PartitionedHealth {
    pub partition_count: usize,
    pub total_nodes: usize,
    pub nodes_per_partition: Vec<usize>,
    pub max_nodes_per_partition: usize,
}

/// An HNSW index sharded into bounded partitions.
pub struct PartitionedIndex {
    hnsw_config: HnswConfig,
    config: PartitionConfig,
    partitions: RwLock<Vec<Arc<Partition>>>,
    /// id → partition slot, kept stable across splits.
    assignments: dashmap::DashMap<EngramId, usize>,
    fetcher: Option<Arc<dyn VectorFetcher>>,
}

impl PartitionedIndex {
    pub fn new(hnsw_config: HnswConfig, config: PartitionConfig) -> Self {
        Self::build(hnsw_config, config, None)
    }

    pub fn with_fetcher(
        hnsw_config: HnswConfig,
        config: PartitionConfig,
        fetcher: Arc<dyn VectorFetcher>,
    ) -> Self {
        Self::build(hnsw_config, config, Some(fetcher))
    }

    fn build(
        hnsw_config: HnswConfig,
        config: PartitionConfig,
        fetcher: Option<Arc<dyn VectorFetcher>>,
    ) -> Self {
        let initial: Vec<Arc<Partition>> = (0..MIN_PARTITIONS)
            .map(|_| Arc::new(Partition::new(hnsw_config.clone(), fetcher.clone())))
            .collect();
        Self {
            hnsw_config,
            config,
            partitions: RwLock::new(initial),
            assignments: dashmap::DashMap::new(),
            fetcher,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn len(&self) -> usize {
        self.partitions.read().iter().map(|p| p.index.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &EngramId) -> bool {
        self.assignments.contains_key(id)
    }

    /// Topology snapshot of a node, wherever it lives.
    pub fn topology(&self, id: &EngramId) -> Option<(engram_core::LayerConnections, u8)> {
        let slot = *self.assignments.get(id)?;
        let partitions = self.partitions.read();
        partitions.get(slot)?.index.topology(id)
    }

    /// Desired partition count for the semantic strategy.
    fn target_partition_count(&self, total: usize) -> usize {
        if self.config.max_nodes_per_partition == 0 {
            return MIN_PARTITIONS;
        }
        total
            .div_ceil(self.config.max_nodes_per_partition)
            .clamp(MIN_PARTITIONS, MAX_PARTITIONS)
    }

    fn stable_hash(id: &EngramId) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    /// Pick the insert partition per the configured strategy.
    fn route(&self, id: &EngramId, vector: &[f32]) -> usize {
        let partitions = self.partitions.read();
        match self.config.strategy {
            PartitionStrategy::Hash => Self::stable_hash(id) as usize % partitions.len(),
            PartitionStrategy::Semantic => Self::nearest_partition(&partitions, vector)
                .unwrap_or(Self::stable_hash(id) as usize % partitions.len()),
            PartitionStrategy::Hybrid => {
                // Semantic when a centroid matches the query space, hash
                // overflow for outliers no centroid covers yet.
                match Self::nearest_partition(&partitions, vector) {
                    Some(slot) => slot,
                    None => Self::stable_hash(id) as usize % partitions.len(),
                }
            }
        }
    }

    fn nearest_partition(partitions: &[Arc<Partition>], vector: &[f32]) -> Option<usize> {
        partitions
            .iter()
            .enumerate()
            .map(|(i, p)| (p.centroid_distance(vector), i))
            .filter(|(d, _)| *d < f32::MAX)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, i)| i)
    }

    /// Insert a vector, splitting the target partition if it is full.
    pub fn insert(&self, id: EngramId, vector: Vec<f32>) -> Result<()> {
        // Re-inserts leave their old partition first so the id maps to
        // exactly one slot.
        if let Some(previous) = self.assignments.get(&id).map(|slot| *slot) {
            let partitions = self.partitions.read();
            if let Some(p) = partitions.get(previous) {
                p.index.remove(&id);
            }
        }

        // Grow toward the auto-tuned count before routing so new space is
        // available to semantic routing.
        self.ensure_capacity();

        let slot = self.route(&id, &vector);
        {
            let partitions = self.partitions.read();
            let partition = partitions
                .get(slot)
                .ok_or_else(|| EngramError::index(format!("partition {slot} out of range")))?;
            partition.index.insert(id, vector.clone())?;
            partition.absorb(&vector);
        }
        self.assignments.insert(id, slot);

        if self.config.max_nodes_per_partition > 0 {
            let over_limit = {
                let partitions = self.partitions.read();
                partitions
                    .get(slot)
                    .map(|p| p.index.len() > self.config.max_nodes_per_partition)
                    .unwrap_or(false)
            };
            if over_limit {
                self.split_partition(slot)?;
            }
        }
        Ok(())
    }

    /// Grow the partition list toward the auto-tuned target. New
    /// partitions start empty; semantic routing adopts them as their
    /// centroids form.
    fn ensure_capacity(&self) {
        if self.config.strategy == PartitionStrategy::Hash {
            return;
        }
        let total = self.len();
        let target = self.target_partition_count(total + 1);
        let mut partitions = self.partitions.write();
        while partitions.len() < target {
            partitions.push(Arc::new(Partition::new(
                self.hnsw_config.clone(),
                self.fetcher.clone(),
            )));
        }
    }

    /// Split an oversized partition by 2-means over its members.
    ///
    /// One cluster stays in place, the other moves to a fresh partition.
    /// Members whose vectors are fully evicted keep their slot.
    fn split_partition(&self, slot: usize) -> Result<()> {
        let source = {
            let partitions = self.partitions.read();
            match partitions.get(slot) {
                Some(p) => Arc::clone(p),
                None => return Ok(()),
            }
        };

        let members: Vec<(EngramId, Vec<f32>)> = source
            .index
            .ids()
            .into_iter()
            .filter_map(|id| source.index.vector_approximation(&id).map(|v| (id, v)))
            .collect();
        if members.len() < 2 {
            return Ok(());
        }

        let (centroid_a, centroid_b, assignments) = two_means(&members);

        let new_slot = {
            let mut partitions = self.partitions.write();
            partitions.push(Arc::new(Partition::new(
                self.hnsw_config.clone(),
                self.fetcher.clone(),
            )));
            partitions.len() - 1
        };

        let mut moved = 0usize;
        {
            let partitions = self.partitions.read();
            let target = Arc::clone(&partitions[new_slot]);
            drop(partitions);

            for ((id, vector), cluster) in members.iter().zip(assignments.iter()) {
                if *cluster == 1 {
                    source.index.remove(id);
                    target.index.insert(*id, vector.clone())?;
                    self.assignments.insert(*id, new_slot);
                    moved += 1;
                }
            }
            target.set_centroid(centroid_b);
        }
        source.set_centroid(centroid_a);

        info!(
            partition = slot,
            new_partition = new_slot,
            moved,
            remaining = source.index.len(),
            "split oversized partition"
        );
        Ok(())
    }

    /// Remove an id from whichever partition holds it.
    pub fn remove(&self, id: &EngramId) -> bool {
        let Some((_, slot)) = self.assignments.remove(id) else {
            return false;
        };
        let partitions = self.partitions.read();
        partitions
            .get(slot)
            .map(|p| p.index.remove(id))
            .unwrap_or(false)
    }

    /// Partitions an adaptive search should visit, closest centroid first.
    fn select_partitions(&self, query: &[f32]) -> Vec<Arc<Partition>> {
        let partitions = self.partitions.read();
        let populated: Vec<Arc<Partition>> = partitions
            .iter()
            .filter(|p| !p.index.is_empty())
            .cloned()
            .collect();
        drop(partitions);

        match self.config.search {
            SearchFanout::Broadcast => populated,
            SearchFanout::Adaptive => {
                let want = ((populated.len() as f64 * self.config.coverage_ratio).ceil() as usize)
                    .max(self.config.min_partitions_searched)
                    .min(populated.len());
                let mut scored: Vec<(f32, Arc<Partition>)> = populated
                    .into_iter()
                    .map(|p| (p.centroid_distance(query), p))
                    .collect();
                scored.sort_by(|a, b| a.0.total_cmp(&b.0));
                scored.into_iter().take(want).map(|(_, p)| p).collect()
            }
        }
    }

    /// Fan a search out over the selected partitions and merge the local
    /// top-k lists by ascending distance (ties toward the smaller id).
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        self.search_filtered(query, k, None).await
    }

    pub async fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&(dyn Fn(&EngramId) -> bool + Sync)>,
    ) -> Result<Vec<ScoredId>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let selected = self.select_partitions(query);
        if selected.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            partitions = selected.len(),
            total = self.partition_count(),
            "fanning out search"
        );

        let concurrency = self.config.max_concurrent_searches.max(1);
        let mut merged: Vec<ScoredId> = Vec::new();
        for chunk in selected.chunks(concurrency) {
            let mut in_flight: FuturesUnordered<_> = chunk
                .iter()
                .map(|p| {
                    let partition = Arc::clone(p);
                    async move {
                        partition
                            .index
                            .search(
                                query,
                                SearchOptions {
                                    k,
                                    filter,
                                    cancel: None,
                                },
                            )
                            .await
                    }
                })
                .collect();
            while let Some(result) = in_flight.next().await {
                merged.extend(result?);
            }
        }

        merged.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        merged.truncate(k);
        Ok(merged)
    }

    pub fn health(&self) -> PartitionedHealth {
        let partitions = self.partitions.read();
        let nodes_per_partition: Vec<usize> = partitions.iter().map(|p| p.index.len()).collect();
        PartitionedHealth {
            partition_count: partitions.len(),
            total_nodes: nodes_per_partition.iter().sum(),
            nodes_per_partition,
            max_nodes_per_partition: self.config.max_nodes_per_partition,
        }
    }
}

/// One 2-means pass: seed with the two farthest-ish members, refine a few
/// rounds, return both centroids and a 0/1 cluster per member.
fn two_means(members: &[(EngramId, Vec<f32>)]) -> (Vec<f32>, Vec<f32>, Vec<u8>) {
    let dim = members[0].1.len();
    let mut seed_a = members[0].1.clone();
    // Second seed: the member farthest from the first.
    let mut seed_b = members
        .iter()
        .max_by(|x, y| {
            crate::distance::cosine_unchecked(&seed_a, &x.1)
                .total_cmp(&crate::distance::cosine_unchecked(&seed_a, &y.1))
        })
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| members[members.len() - 1].1.clone());

    let mut assignments = vec![0u8; members.len()];
    for _ in 0..SPLIT_ROUNDS {
        for (i, (_, v)) in members.iter().enumerate() {
            let da = crate::distance::cosine_unchecked(v, &seed_a);
            let db = crate::distance::cosine_unchecked(v, &seed_b);
            assignments[i] = u8::from(db < da);
        }
        let mut sum_a = vec![0.0f32; dim];
        let mut sum_b = vec![0.0f32; dim];
        let mut count_a = 0usize;
        let mut count_b = 0usize;
        for ((_, v), cluster) in members.iter().zip(assignments.iter()) {
            let (sum, count) = if *cluster == 0 {
                (&mut sum_a, &mut count_a)
            } else {
                (&mut sum_b, &mut count_b)
            };
            for (s, x) in sum.iter_mut().zip(v.iter()) {
                *s += x;
            }
            *count += 1;
        }
        if count_a == 0 || count_b == 0 {
            // Degenerate clustering; halve by index instead.
            for (i, a) in assignments.iter_mut().enumerate() {
                *a = u8::from(i >= members.len() / 2);
            }
            break;
        }
        seed_a = sum_a.iter().map(|s| s / count_a as f32).collect();
        seed_b = sum_b.iter().map(|s| s / count_b as f32).collect();
    }
    (seed_a, seed_b, assignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::PartitionStrategy;

    fn small_config() -> (HnswConfig, PartitionConfig) {
        let hnsw = HnswConfig {
            m: 8,
            ef_construction: 64,
            ef_search: 32,
            max_level: 8,
            ..Default::default()
        };
        let partitioning = PartitionConfig {
            max_nodes_per_partition: 100,
            ..Default::default()
        };
        (hnsw, partitioning)
    }

    fn spread_vector(i: usize) -> Vec<f32> {
        let angle = i as f32 * 0.025;
        vec![angle.cos(), angle.sin(), (i as f32 * 0.013).sin()]
    }

    #[tokio::test]
    async fn test_split_keeps_everything_retrievable() {
        let (hnsw, partitioning) = small_config();
        let index = PartitionedIndex::new(hnsw, partitioning);

        let ids: Vec<EngramId> = (0..250).map(|_| EngramId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            index.insert(*id, spread_vector(i)).unwrap();
        }

        assert_eq!(index.len(), 250);
        assert!(
            index.partition_count() >= 3,
            "expected >= 3 partitions, got {}",
            index.partition_count()
        );
        let health = index.health();
        for (slot, count) in health.nodes_per_partition.iter().enumerate() {
            assert!(
                *count <= 100 + 1,
                "partition {slot} holds {count} nodes over the limit"
            );
        }

        for (i, id) in ids.iter().enumerate() {
            let hits = index.search(&spread_vector(i), 1).await.unwrap();
            assert_eq!(hits[0].id, *id, "vector {i} lost after splits");
        }
    }

    #[tokio::test]
    async fn test_hash_routing_is_stable() {
        let (hnsw, mut partitioning) = small_config();
        partitioning.strategy = PartitionStrategy::Hash;
        partitioning.max_nodes_per_partition = 0; // no splits
        let index = PartitionedIndex::new(hnsw, partitioning);

        let id = EngramId::new();
        index.insert(id, spread_vector(1)).unwrap();
        let first = *index.assignments.get(&id).unwrap();
        index.insert(id, spread_vector(2)).unwrap();
        let second = *index.assignments.get(&id).unwrap();
        assert_eq!(first, second);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_across_partitions() {
        let (hnsw, mut partitioning) = small_config();
        partitioning.strategy = PartitionStrategy::Hash;
        let index = Arc::new(PartitionedIndex::new(hnsw, partitioning));

        let mut tasks = Vec::new();
        let mut expected = Vec::new();
        for i in 0..64 {
            let id = EngramId::new();
            expected.push((id, spread_vector(i)));
            let index = Arc::clone(&index);
            let vector = spread_vector(i);
            tasks.push(tokio::spawn(async move { index.insert(id, vector) }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(index.len(), 64);
        for (id, vector) in expected {
            let hits = index.search(&vector, 1).await.unwrap();
            assert_eq!(hits[0].id, id);
        }
    }

    #[tokio::test]
    async fn test_remove() {
        let (hnsw, partitioning) = small_config();
        let index = PartitionedIndex::new(hnsw, partitioning);
        let id = EngramId::new();
        index.insert(id, spread_vector(0)).unwrap();
        assert!(index.contains(&id));
        assert!(index.remove(&id));
        assert!(!index.contains(&id));
        assert!(!index.remove(&id));
        assert_eq!(index.len(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_search_covers_all_partitions() {
        let (hnsw, mut partitioning) = small_config();
        partitioning.search = SearchFanout::Broadcast;
        partitioning.strategy = PartitionStrategy::Hash;
        partitioning.max_nodes_per_partition = 0;
        let index = PartitionedIndex::new(hnsw, partitioning);

        let ids: Vec<EngramId> = (0..40).map(|_| EngramId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            index.insert(*id, spread_vector(i)).unwrap();
        }
        // Hash routing scatters ids over all four partitions; broadcast
        // search must still find each exact vector.
        for (i, id) in ids.iter().enumerate() {
            let hits = index.search(&spread_vector(i), 1).await.unwrap();
            assert_eq!(hits[0].id, *id);
        }
    }

    #[test]
    fn test_two_means_separates_clusters() {
        let mut members = Vec::new();
        for i in 0..20 {
            let jitter = i as f32 * 0.001;
            members.push((EngramId::new(), vec![1.0, jitter, 0.0]));
        }
        for i in 0..20 {
            let jitter = i as f32 * 0.001;
            members.push((EngramId::new(), vec![0.0, jitter, 1.0]));
        }
        let (_, _, assignments) = two_means(&members);
        let first: Vec<u8> = assignments[..20].to_vec();
        let second: Vec<u8> = assignments[20..].to_vec();
        assert!(first.iter().all(|&c| c == first[0]));
        assert!(second.iter().all(|&c| c == second[0]));
        assert_ne!(first[0], second[0]);
    }
}
