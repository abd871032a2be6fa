//! Hierarchical Navigable Small World index.
//!
//! A layered proximity graph over entity ids. Layer 0 holds every node;
//! upper layers hold geometrically fewer nodes and provide long-range
//! hops for the greedy descent. Inserts serialize behind the state write
//! lock (one writer per index), searches share the read lock.
//!
//! Vector payloads live in one of three shapes depending on configuration:
//! full f32, SQ8 quantized, or both. In lazy mode only the quantized
//! projection stays resident; the rerank pass fetches full-precision
//! vectors back through a [`VectorFetcher`].

use crate::distance::cosine_unchecked;
use crate::quant::{distance_sq8, dequantize, quantize, QuantizedVector};
use async_trait::async_trait;
use engram_core::{EngramError, EngramId, HnswConfig, Result, VectorStorageMode};
use parking_lot::RwLock;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Searches never tune `ef_search` below this.
const MIN_EF_SEARCH: usize = 16;

/// Fetches full-precision vectors for nodes whose payload was evicted.
#[async_trait]
pub trait VectorFetcher: Send + Sync {
    async fn fetch_vector(&self, id: EngramId) -> Result<Option<Vec<f32>>>;
}

/// A search hit: entity id plus its distance to the query (lower is closer).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredId {
    pub id: EngramId,
    pub distance: f32,
}

/// Options for a single search.
#[derive(Default)]
pub struct SearchOptions<'a> {
    pub k: usize,
    /// Candidate predicate applied while collecting results. Rejected
    /// candidates do not count toward `k`; the number of draws is capped
    /// at `ef * rerank_multiplier`.
    pub filter: Option<&'a (dyn Fn(&EngramId) -> bool + Sync)>,
    /// Checked at suspension points (rerank fetches).
    pub cancel: Option<&'a CancellationToken>,
}

impl<'a> SearchOptions<'a> {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            filter: None,
            cancel: None,
        }
    }
}

/// Health metrics for one index.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexHealth {
    pub node_count: usize,
    pub dimension: Option<usize>,
    pub entry_point: Option<EngramId>,
    pub max_layer: u8,
    /// Average layer-0 degree.
    pub avg_connections: f64,
    /// Node count per layer, layer 0 first.
    pub layer_counts: Vec<usize>,
    pub ef_search: usize,
}

/// In-memory vector payload of a node.
#[derive(Debug, Clone)]
struct NodeVectors {
    full: Option<Vec<f32>>,
    quantized: Option<QuantizedVector>,
}

impl NodeVectors {
    /// Best available f32 view: full if resident, else dequantized.
    fn approximate(&self) -> Option<Vec<f32>> {
        if let Some(v) = &self.full {
            return Some(v.clone());
        }
        self.quantized.as_ref().map(dequantize)
    }
}

#[derive(Debug)]
struct Node {
    vectors: NodeVectors,
    /// Neighbor sets, one per layer this node participates in.
    connections: Vec<HashSet<EngramId>>,
    top_layer: u8,
}

impl Node {
    fn neighbors(&self, layer: u8) -> Option<&HashSet<EngramId>> {
        self.connections.get(layer as usize)
    }
}

/// Query-side distance context: the exact query plus its quantized
/// projection when the index runs on SQ8 distances.
struct Probe<'a> {
    exact: &'a [f32],
    quantized: Option<QuantizedVector>,
}

struct IndexState {
    nodes: HashMap<EngramId, Node>,
    entry_point: Option<EngramId>,
    max_layer: u8,
    dimension: Option<usize>,
    rng: SmallRng,
}

impl IndexState {
    fn distance_to(&self, probe: &Probe<'_>, id: &EngramId) -> f32 {
        let Some(node) = self.nodes.get(id) else {
            return f32::MAX;
        };
        if let (Some(pq), Some(nq)) = (&probe.quantized, &node.vectors.quantized) {
            return distance_sq8(pq, nq).unwrap_or(f32::MAX);
        }
        if let Some(full) = &node.vectors.full {
            return cosine_unchecked(probe.exact, full);
        }
        if let Some(nq) = &node.vectors.quantized {
            return cosine_unchecked(probe.exact, &dequantize(nq));
        }
        f32::MAX
    }

    /// Distance between two stored nodes, for the diversity heuristic.
    fn node_distance(&self, a: &EngramId, b: &EngramId) -> f32 {
        let (Some(na), Some(nb)) = (self.nodes.get(a), self.nodes.get(b)) else {
            return f32::MAX;
        };
        if let (Some(qa), Some(qb)) = (&na.vectors.quantized, &nb.vectors.quantized) {
            return distance_sq8(qa, qb).unwrap_or(f32::MAX);
        }
        match (na.vectors.approximate(), nb.vectors.approximate()) {
            (Some(va), Some(vb)) => cosine_unchecked(&va, &vb),
            _ => f32::MAX,
        }
    }

    /// Greedy ef=1 walk on one layer starting from `ep`.
    fn greedy_closest(&self, probe: &Probe<'_>, mut ep: EngramId, mut ep_dist: f32, layer: u8) -> (f32, EngramId) {
        loop {
            let mut improved = false;
            if let Some(node) = self.nodes.get(&ep) {
                if let Some(neighbors) = node.neighbors(layer) {
                    for n in neighbors {
                        let d = self.distance_to(probe, n);
                        if d < ep_dist {
                            ep = *n;
                            ep_dist = d;
                            improved = true;
                        }
                    }
                }
            }
            if !improved {
                return (ep_dist, ep);
            }
        }
    }

    /// Best-first expansion on one layer with a dynamic candidate list of
    /// size `ef`. Returns hits sorted ascending by distance.
    fn search_layer(
        &self,
        probe: &Probe<'_>,
        entry_points: &[(f32, EngramId)],
        ef: usize,
        layer: u8,
    ) -> Vec<(f32, EngramId)> {
        let mut visited: HashSet<EngramId> = entry_points.iter().map(|(_, id)| *id).collect();
        let mut candidates: BinaryHeap<Reverse<Scored>> = entry_points
            .iter()
            .map(|&(d, id)| Reverse(Scored { distance: d, id }))
            .collect();
        let mut results: BinaryHeap<Scored> = entry_points
            .iter()
            .map(|&(d, id)| Scored { distance: d, id })
            .collect();

        while let Some(Reverse(current)) = candidates.pop() {
            if results.len() >= ef {
                if let Some(worst) = results.peek() {
                    if current.distance > worst.distance {
                        break;
                    }
                }
            }
            let Some(node) = self.nodes.get(&current.id) else {
                continue;
            };
            let Some(neighbors) = node.neighbors(layer) else {
                continue;
            };
            for n in neighbors {
                if !visited.insert(*n) {
                    continue;
                }
                let d = self.distance_to(probe, n);
                let admit = results.len() < ef
                    || results
                        .peek()
                        .map(|worst| d < worst.distance)
                        .unwrap_or(true);
                if admit {
                    candidates.push(Reverse(Scored { distance: d, id: *n }));
                    results.push(Scored { distance: d, id: *n });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results
            .into_sorted_vec()
            .into_iter()
            .map(|s| (s.distance, s.id))
            .collect()
    }

    /// Neighbor selection with the diversity heuristic: a candidate is
    /// kept only if it is closer to the query than to every neighbor
    /// already selected, so links spread across directions instead of
    /// clustering. Skipped candidates backfill any remaining slots.
    fn select_neighbors(&self, candidates: &[(f32, EngramId)], m: usize) -> Vec<(f32, EngramId)> {
        if candidates.len() <= m {
            return candidates.to_vec();
        }
        let mut selected: Vec<(f32, EngramId)> = Vec::with_capacity(m);
        let mut skipped: Vec<(f32, EngramId)> = Vec::new();
        for &(d, id) in candidates {
            if selected.len() >= m {
                break;
            }
            let diverse = selected
                .iter()
                .all(|(_, s)| d < self.node_distance(&id, s));
            if diverse {
                selected.push((d, id));
            } else {
                skipped.push((d, id));
            }
        }
        for extra in skipped {
            if selected.len() >= m {
                break;
            }
            selected.push(extra);
        }
        selected
    }

    /// Re-select the best `m` neighbors of an over-connected node.
    fn prune_connections(&mut self, id: EngramId, layer: u8, m: usize) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let Some(neighbors) = node.neighbors(layer) else {
            return;
        };
        if neighbors.len() <= m {
            return;
        }
        let mut scored: Vec<(f32, EngramId)> = neighbors
            .iter()
            .map(|n| (self.node_distance(&id, n), *n))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let keep = self.select_neighbors(&scored, m);
        let keep_set: HashSet<EngramId> = keep.iter().map(|(_, n)| *n).collect();

        let dropped: Vec<EngramId> = neighbors
            .iter()
            .filter(|n| !keep_set.contains(n))
            .copied()
            .collect();
        if let Some(node) = self.nodes.get_mut(&id) {
            if let Some(set) = node.connections.get_mut(layer as usize) {
                set.retain(|n| keep_set.contains(n));
            }
        }
        // Pruned links are removed from both sides.
        for other in dropped {
            if let Some(other_node) = self.nodes.get_mut(&other) {
                if let Some(set) = other_node.connections.get_mut(layer as usize) {
                    set.remove(&id);
                }
            }
        }
    }

    fn link(&mut self, a: EngramId, b: EngramId, layer: u8) {
        if let Some(node) = self.nodes.get_mut(&a) {
            if let Some(set) = node.connections.get_mut(layer as usize) {
                set.insert(b);
            }
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            if let Some(set) = node.connections.get_mut(layer as usize) {
                set.insert(a);
            }
        }
    }

    fn remove_node(&mut self, id: &EngramId) -> bool {
        let Some(node) = self.nodes.remove(id) else {
            return false;
        };
        for (layer, neighbors) in node.connections.iter().enumerate() {
            for n in neighbors {
                if let Some(other) = self.nodes.get_mut(n) {
                    if let Some(set) = other.connections.get_mut(layer) {
                        set.remove(id);
                    }
                }
            }
        }
        if self.entry_point == Some(*id) {
            // Promote the highest remaining node, smallest id on ties.
            let replacement = self
                .nodes
                .iter()
                .map(|(nid, n)| (n.top_layer, *nid))
                .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
            match replacement {
                Some((top, nid)) => {
                    self.entry_point = Some(nid);
                    self.max_layer = top;
                }
                None => {
                    self.entry_point = None;
                    self.max_layer = 0;
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    distance: f32,
    id: EngramId,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Equal distances break toward the smaller id.
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The HNSW index.
pub struct HnswIndex {
    config: HnswConfig,
    state: RwLock<IndexState>,
    ef_search: AtomicUsize,
    fetcher: Option<Arc<dyn VectorFetcher>>,
}

impl HnswIndex {
    pub fn new(config: HnswConfig) -> Self {
        Self::build(config, None)
    }

    /// An index that can reload evicted vectors from storage; required for
    /// lazy vector mode to actually evict.
    pub fn with_fetcher(config: HnswConfig, fetcher: Arc<dyn VectorFetcher>) -> Self {
        Self::build(config, Some(fetcher))
    }

    fn build(config: HnswConfig, fetcher: Option<Arc<dyn VectorFetcher>>) -> Self {
        if config.vector_storage == VectorStorageMode::Lazy && fetcher.is_none() {
            // Configuration no-op, not a fatal error: without an adapter to
            // reload vectors, eviction would lose data.
            debug!("lazy vector storage requested without a fetcher; keeping vectors in memory");
        }
        let ef_search = config.ef_search.max(MIN_EF_SEARCH);
        Self {
            config,
            state: RwLock::new(IndexState {
                nodes: HashMap::new(),
                entry_point: None,
                max_layer: 0,
                dimension: None,
                rng: SmallRng::from_os_rng(),
            }),
            ef_search: AtomicUsize::new(ef_search),
            fetcher,
        }
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().nodes.is_empty()
    }

    pub fn contains(&self, id: &EngramId) -> bool {
        self.state.read().nodes.contains_key(id)
    }

    pub fn ids(&self) -> Vec<EngramId> {
        self.state.read().nodes.keys().copied().collect()
    }

    /// Dimension fixed by the first insert, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.state.read().dimension
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.nodes.clear();
        state.entry_point = None;
        state.max_layer = 0;
        state.dimension = None;
    }

    /// Current `ef_search`, including any adaptive adjustments.
    pub fn ef_search(&self) -> usize {
        self.ef_search.load(Ordering::Relaxed)
    }

    pub fn set_ef_search(&self, ef: usize) {
        self.ef_search.store(ef.max(MIN_EF_SEARCH), Ordering::Relaxed);
    }

    /// Best available f32 view of a stored vector (full or dequantized).
    pub fn vector_approximation(&self, id: &EngramId) -> Option<Vec<f32>> {
        self.state.read().nodes.get(id).and_then(|n| n.vectors.approximate())
    }

    /// Snapshot of a node's neighbor sets and top layer, in the shape the
    /// persisted record carries.
    pub fn topology(&self, id: &EngramId) -> Option<(engram_core::LayerConnections, u8)> {
        let state = self.state.read();
        state.nodes.get(id).map(|node| {
            let connections = node
                .connections
                .iter()
                .enumerate()
                .map(|(layer, set)| (layer as u8, set.iter().copied().collect()))
                .collect();
            (connections, node.top_layer)
        })
    }

    fn lazy_eviction_active(&self) -> bool {
        self.config.vector_storage == VectorStorageMode::Lazy
            && self.config.quantization.enabled
            && self.fetcher.is_some()
    }

    fn make_vectors(&self, vector: Vec<f32>) -> NodeVectors {
        let quantized = self
            .config
            .quantization
            .enabled
            .then(|| quantize(&vector));
        let full = if self.lazy_eviction_active() {
            // The canonical copy lives in storage; the quantized
            // projection is enough for graph traversal.
            None
        } else {
            Some(vector)
        };
        NodeVectors { full, quantized }
    }

    /// Insert a vector under the given id.
    ///
    /// An existing id is removed and re-inserted (overwrite semantics;
    /// callers enforcing strict ids check before calling).
    pub fn insert(&self, id: EngramId, vector: Vec<f32>) -> Result<()> {
        let mut state = self.state.write();

        match state.dimension {
            Some(dim) if dim != vector.len() => {
                return Err(EngramError::dimension_mismatch(dim, vector.len()));
            }
            None => state.dimension = Some(vector.len()),
            _ => {}
        }

        if state.nodes.contains_key(&id) {
            state.remove_node(&id);
        }

        let ml_factor = 1.0 / (self.config.m.max(2) as f64).ln();
        let uniform: f64 = state.rng.random();
        let level = ((-uniform.ln() * ml_factor).floor() as u64)
            .min(u64::from(self.config.max_level)) as u8;

        let probe = Probe {
            exact: &vector,
            quantized: self
                .config
                .quantization
                .enabled
                .then(|| quantize(&vector)),
        };

        let node = Node {
            vectors: self.make_vectors(vector.clone()),
            connections: (0..=level).map(|_| HashSet::new()).collect(),
            top_layer: level,
        };

        let Some(entry) = state.entry_point else {
            state.nodes.insert(id, node);
            state.entry_point = Some(id);
            state.max_layer = level;
            return Ok(());
        };

        let mut ep_dist = state.distance_to(&probe, &entry);
        let mut ep = entry;
        let max_layer = state.max_layer;

        // Greedy descent through layers above the new node's top.
        let mut layer = max_layer;
        while layer > level {
            (ep_dist, ep) = state.greedy_closest(&probe, ep, ep_dist, layer);
            layer -= 1;
        }

        state.nodes.insert(id, node);

        let mut eps = vec![(ep_dist, ep)];
        let top = level.min(max_layer);
        for layer in (0..=top).rev() {
            let candidates = state.search_layer(&probe, &eps, self.config.ef_construction, layer);
            let neighbors = state.select_neighbors(&candidates, self.config.m);
            for &(_, n) in &neighbors {
                state.link(id, n, layer);
            }
            for &(_, n) in &neighbors {
                let degree = state
                    .nodes
                    .get(&n)
                    .and_then(|node| node.neighbors(layer))
                    .map(|s| s.len())
                    .unwrap_or(0);
                if degree > self.config.m {
                    state.prune_connections(n, layer, self.config.m);
                }
            }
            eps = candidates;
        }

        if level > state.max_layer {
            state.entry_point = Some(id);
            state.max_layer = level;
        }
        Ok(())
    }

    /// Insert many vectors in caller order.
    pub fn insert_batch(&self, items: Vec<(EngramId, Vec<f32>)>) -> Result<()> {
        for (id, vector) in items {
            self.insert(id, vector)?;
        }
        Ok(())
    }

    /// Remove a node, unlinking it from all layers. Returns whether it
    /// existed.
    pub fn remove(&self, id: &EngramId) -> bool {
        self.state.write().remove_node(id)
    }

    /// k-nearest-neighbor search.
    ///
    /// Empty index returns an empty result, not an error. With SQ8 enabled
    /// and `rerank_multiplier > 1`, the quantized candidate list is
    /// reranked against exact distances before the filter and cut to `k`.
    pub async fn search(&self, query: &[f32], opts: SearchOptions<'_>) -> Result<Vec<ScoredId>> {
        let started = Instant::now();
        let k = opts.k;
        if k == 0 {
            return Ok(Vec::new());
        }

        let rerank_multiplier = if self.config.quantization.enabled {
            self.config.quantization.rerank_multiplier.max(1)
        } else {
            1
        };
        let ef = self
            .ef_search
            .load(Ordering::Relaxed)
            .max(k.saturating_mul(rerank_multiplier));

        // Phase 1: graph traversal under the read lock. Collects the
        // candidate list plus any resident full vectors for the rerank.
        let candidates: Vec<(f32, EngramId, Option<Vec<f32>>)> = {
            let state = self.state.read();
            if state.nodes.is_empty() {
                return Ok(Vec::new());
            }
            if let Some(dim) = state.dimension {
                if dim != query.len() {
                    return Err(EngramError::dimension_mismatch(dim, query.len()));
                }
            }
            let probe = Probe {
                exact: query,
                quantized: self
                    .config
                    .quantization
                    .enabled
                    .then(|| quantize(query)),
            };
            let entry = match state.entry_point {
                Some(e) => e,
                None => return Ok(Vec::new()),
            };
            let mut ep_dist = state.distance_to(&probe, &entry);
            let mut ep = entry;
            for layer in (1..=state.max_layer).rev() {
                (ep_dist, ep) = state.greedy_closest(&probe, ep, ep_dist, layer);
            }
            let found = state.search_layer(&probe, &[(ep_dist, ep)], ef, 0);
            found
                .into_iter()
                .map(|(d, id)| {
                    let full = state.nodes.get(&id).and_then(|n| n.vectors.full.clone());
                    (d, id, full)
                })
                .collect()
        };

        // Phase 2: exact rerank of the top k * multiplier candidates.
        let mut scored: Vec<(f32, EngramId)> = if rerank_multiplier > 1 {
            let take = k.saturating_mul(rerank_multiplier).min(candidates.len());
            let mut reranked = Vec::with_capacity(candidates.len());
            for (approx, id, full) in candidates.into_iter().take(take) {
                if let Some(cancel) = opts.cancel {
                    if cancel.is_cancelled() {
                        return Err(EngramError::cancelled("search rerank"));
                    }
                }
                let exact = match full {
                    Some(v) => Some(v),
                    None => match &self.fetcher {
                        Some(fetcher) => fetcher.fetch_vector(id).await?,
                        None => None,
                    },
                };
                match exact {
                    Some(v) if v.len() == query.len() => {
                        reranked.push((cosine_unchecked(query, &v), id));
                    }
                    // Canonical vector unavailable: fall back to the
                    // quantized estimate rather than dropping the hit.
                    _ => reranked.push((approx, id)),
                }
            }
            reranked
        } else {
            candidates.into_iter().map(|(d, id, _)| (d, id)).collect()
        };

        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let max_draws = ef.saturating_mul(rerank_multiplier);
        let mut results = Vec::with_capacity(k);
        for (drawn, (distance, id)) in scored.into_iter().enumerate() {
            if results.len() >= k || drawn >= max_draws {
                break;
            }
            if let Some(filter) = opts.filter {
                if !filter(&id) {
                    continue;
                }
            }
            results.push(ScoredId { id, distance });
        }

        self.observe_latency(started.elapsed());
        Ok(results)
    }

    /// Feed the adaptive tuner; lowers `ef_search` after a breach of the
    /// target latency. The in-progress query is unaffected.
    fn observe_latency(&self, elapsed: Duration) {
        if !self.config.dynamic_parameter_tuning {
            return;
        }
        if elapsed.as_micros() as u64 > self.config.target_search_latency_ms * 1000 {
            let current = self.ef_search.load(Ordering::Relaxed);
            let reduced = (current * 9 / 10).max(MIN_EF_SEARCH);
            if reduced < current {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    ef_search = reduced,
                    "search latency over target; reducing ef_search"
                );
                self.ef_search.store(reduced, Ordering::Relaxed);
            }
        }
    }

    /// Health metrics snapshot.
    pub fn health(&self) -> IndexHealth {
        let state = self.state.read();
        let node_count = state.nodes.len();
        let mut layer_counts = vec![0usize; state.max_layer as usize + 1];
        let mut total_connections = 0usize;
        for node in state.nodes.values() {
            for layer in 0..=node.top_layer.min(state.max_layer) {
                layer_counts[layer as usize] += 1;
            }
            total_connections += node.neighbors(0).map(|s| s.len()).unwrap_or(0);
        }
        IndexHealth {
            node_count,
            dimension: state.dimension,
            entry_point: state.entry_point,
            max_layer: state.max_layer,
            avg_connections: if node_count == 0 {
                0.0
            } else {
                total_connections as f64 / node_count as f64
            },
            layer_counts,
            ef_search: self.ef_search.load(Ordering::Relaxed),
        }
    }
}
