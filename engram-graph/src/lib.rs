//! The typed property graph over the storage adapter.
//!
//! Nouns and verbs are ids-into-storage; the graph never holds entity
//! references across await points, it re-resolves by id. Deleting a noun
//! applies the configured cascade policy to its incident verbs: cascade
//! them away, orphan them (traversals skip orphans), or refuse.

use engram_core::{
    now_ms, CascadePolicy, EngramError, EngramId, MetadataMap, Noun, NounMetadata,
    NounWithMetadata, Result, Verb, VerbMetadata, VerbType, VerbWithMetadata,
};
use engram_storage::{NounFilter, Page, Pagination, StorageAdapter, VerbFilter};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Default BFS depth cap for traversals.
pub const DEFAULT_MAX_DEPTH: usize = 3;

/// Edge direction relative to the traversal origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Out,
    In,
    Both,
}

/// One traversal result: a reached noun and the verb path to it.
#[derive(Debug, Clone)]
pub struct TraversalHit {
    pub noun: NounWithMetadata,
    /// Verb ids along the path from the origin, in hop order.
    pub path: Vec<EngramId>,
}

/// The graph layer.
pub struct GraphLayer {
    adapter: Arc<StorageAdapter>,
    cascade_policy: CascadePolicy,
}

impl GraphLayer {
    pub fn new(adapter: Arc<StorageAdapter>, cascade_policy: CascadePolicy) -> Self {
        Self {
            adapter,
            cascade_policy,
        }
    }

    pub fn adapter(&self) -> &Arc<StorageAdapter> {
        &self.adapter
    }

    // ----- nouns -----------------------------------------------------------

    /// Persist a noun and its sidecar. Returns `true` when the id was new.
    pub async fn add_noun(&self, noun: &Noun, metadata: &NounMetadata) -> Result<bool> {
        let created = self.adapter.save_noun(noun).await?;
        self.adapter.save_noun_metadata(&noun.id, metadata).await?;

        let stats = self.adapter.statistics();
        stats.record_noun_added(noun.noun, &metadata.service, !created);
        if !metadata.fields.is_empty() {
            stats.record_metadata_written(&metadata.service);
            stats.track_field_names(
                &metadata.service,
                &serde_json::Value::Object(metadata.fields.clone().into_iter().collect()),
            );
        }
        Ok(created)
    }

    pub async fn get_noun(&self, id: &EngramId) -> Result<Option<NounWithMetadata>> {
        self.adapter.get_noun(id).await
    }

    pub async fn get_nouns(
        &self,
        filter: &NounFilter,
        pagination: &Pagination,
    ) -> Result<Page<NounWithMetadata>> {
        self.adapter.get_nouns(filter, pagination).await
    }

    /// Update a noun's user metadata; merged into the existing fields or
    /// replacing them wholesale.
    pub async fn update_noun_metadata(
        &self,
        id: &EngramId,
        fields: MetadataMap,
        merge: bool,
    ) -> Result<NounMetadata> {
        if self.adapter.get_noun_raw(id).await?.is_none() {
            return Err(EngramError::not_found("noun", id));
        }
        let mut sidecar = self.adapter.get_noun_metadata(id).await?.unwrap_or_default();
        if merge {
            sidecar.fields.extend(fields);
        } else {
            sidecar.fields = fields;
        }
        sidecar.updated_at = Some(now_ms());
        self.adapter.save_noun_metadata(id, &sidecar).await?;

        let stats = self.adapter.statistics();
        stats.record_metadata_written(&sidecar.service);
        stats.track_field_names(
            &sidecar.service,
            &serde_json::Value::Object(sidecar.fields.clone().into_iter().collect()),
        );
        Ok(sidecar)
    }

    /// Delete a noun, applying the cascade policy (or an override) to its
    /// incident verbs. Returns whether the noun existed.
    pub async fn delete_noun(
        &self,
        id: &EngramId,
        policy_override: Option<CascadePolicy>,
    ) -> Result<bool> {
        let Some(existing) = self.adapter.get_noun(id).await? else {
            return Ok(false);
        };
        let policy = policy_override.unwrap_or(self.cascade_policy);
        let incident = self.incident_verbs(id).await?;

        match policy {
            CascadePolicy::Deny => {
                if !incident.is_empty() {
                    return Err(EngramError::CascadeRequired {
                        id: id.to_string(),
                        verb_count: incident.len(),
                    });
                }
            }
            CascadePolicy::Cascade => {
                for verb in &incident {
                    self.remove_verb_record(verb).await?;
                }
            }
            CascadePolicy::Orphan => {
                for verb in &incident {
                    let mut record = verb.verb.clone();
                    if !record.orphaned {
                        record.orphaned = true;
                        record.updated_at = now_ms();
                        self.adapter.save_verb(&record).await?;
                    }
                }
            }
        }

        self.adapter.delete_noun(id).await?;
        self.adapter
            .statistics()
            .record_noun_removed(existing.noun.noun, &existing.service);
        debug!(%id, ?policy, incident = incident.len(), "deleted noun");
        Ok(true)
    }

    // ----- verbs -----------------------------------------------------------

    /// Persist a verb and its sidecar. Both endpoints must exist.
    pub async fn add_verb(&self, verb: &Verb, metadata: &VerbMetadata) -> Result<bool> {
        if self.adapter.get_noun_raw(&verb.source_id).await?.is_none() {
            return Err(EngramError::not_found("noun", verb.source_id));
        }
        if self.adapter.get_noun_raw(&verb.target_id).await?.is_none() {
            return Err(EngramError::not_found("noun", verb.target_id));
        }

        let created = self.adapter.save_verb(verb).await?;
        self.adapter.save_verb_metadata(&verb.id, metadata).await?;

        let stats = self.adapter.statistics();
        stats.record_verb_added(verb.verb, &metadata.service, !created);
        if !metadata.fields.is_empty() {
            stats.record_metadata_written(&metadata.service);
            stats.track_field_names(
                &metadata.service,
                &serde_json::Value::Object(metadata.fields.clone().into_iter().collect()),
            );
        }
        Ok(created)
    }

    pub async fn get_verb(&self, id: &EngramId) -> Result<Option<VerbWithMetadata>> {
        self.adapter.get_verb(id).await
    }

    pub async fn get_verbs(
        &self,
        filter: &VerbFilter,
        pagination: &Pagination,
    ) -> Result<Page<VerbWithMetadata>> {
        self.adapter.get_verbs(filter, pagination).await
    }

    /// Delete a verb by id. Returns whether it existed.
    pub async fn delete_verb(&self, id: &EngramId) -> Result<bool> {
        let Some(existing) = self.adapter.get_verb(id).await? else {
            return Ok(false);
        };
        self.remove_verb_record(&existing).await?;
        Ok(true)
    }

    async fn remove_verb_record(&self, verb: &VerbWithMetadata) -> Result<()> {
        self.adapter.delete_verb(&verb.verb.id).await?;
        self.adapter
            .statistics()
            .record_verb_removed(verb.verb.verb, &verb.service);
        Ok(())
    }

    /// Verbs incident on a noun from either side.
    pub async fn incident_verbs(&self, id: &EngramId) -> Result<Vec<VerbWithMetadata>> {
        let unbounded = Pagination {
            limit: Some(usize::MAX),
            cursor: None,
        };
        let mut verbs = self
            .adapter
            .get_verbs(
                &VerbFilter {
                    source_id: Some(*id),
                    ..Default::default()
                },
                &unbounded,
            )
            .await?
            .items;
        let incoming = self
            .adapter
            .get_verbs(
                &VerbFilter {
                    target_id: Some(*id),
                    ..Default::default()
                },
                &unbounded,
            )
            .await?
            .items;
        // Self-loops appear in both queries; keep one copy.
        let mut seen: HashSet<EngramId> = verbs.iter().map(|v| v.id()).collect();
        for verb in incoming {
            if seen.insert(verb.id()) {
                verbs.push(verb);
            }
        }
        Ok(verbs)
    }

    /// Relations of an entity in one direction, newest first.
    pub async fn get_relations(
        &self,
        id: &EngramId,
        direction: Direction,
        verb_types: &[VerbType],
        pagination: &Pagination,
    ) -> Result<Page<VerbWithMetadata>> {
        let filter_for = |direction: Direction| {
            let mut filter = VerbFilter {
                verb_types: verb_types.to_vec(),
                ..Default::default()
            };
            match direction {
                Direction::Out => filter.source_id = Some(*id),
                Direction::In => filter.target_id = Some(*id),
                Direction::Both => unreachable!("both handled separately"),
            }
            filter
        };

        match direction {
            Direction::Out | Direction::In => {
                self.adapter
                    .get_verbs(&filter_for(direction), pagination)
                    .await
            }
            Direction::Both => {
                // Merged view over both endpoint queries; cursors do not
                // compose across the pair, so this path paginates by limit
                // only.
                let limit = pagination.effective_limit();
                let unbounded = Pagination {
                    limit: Some(limit),
                    cursor: None,
                };
                let out = self
                    .adapter
                    .get_verbs(&filter_for(Direction::Out), &unbounded)
                    .await?;
                let inbound = self
                    .adapter
                    .get_verbs(&filter_for(Direction::In), &unbounded)
                    .await?;
                let mut items = out.items;
                let mut seen: HashSet<EngramId> = items.iter().map(|v| v.id()).collect();
                for verb in inbound.items {
                    if seen.insert(verb.id()) {
                        items.push(verb);
                    }
                }
                items.sort_by(|a, b| b.verb.created_at.cmp(&a.verb.created_at));
                let has_more = items.len() > limit || out.has_more || inbound.has_more;
                items.truncate(limit);
                Ok(Page {
                    items,
                    next_cursor: None,
                    has_more,
                    total_count: None,
                })
            }
        }
    }

    // ----- traversal -------------------------------------------------------

    /// Breadth-first traversal from `source`.
    ///
    /// Follows non-orphaned verbs in the requested direction, optionally
    /// restricted to `verb_types`, visiting each noun once. Stops when the
    /// frontier empties or `max_depth` hops are exhausted. The origin noun
    /// itself is not included in the results.
    pub async fn traverse(
        &self,
        source: &EngramId,
        direction: Direction,
        max_depth: Option<usize>,
        verb_types: Option<&[VerbType]>,
    ) -> Result<Vec<TraversalHit>> {
        let max_depth = max_depth.unwrap_or(DEFAULT_MAX_DEPTH);
        if self.adapter.get_noun_raw(source).await?.is_none() {
            return Err(EngramError::not_found("noun", source));
        }

        let mut results = Vec::new();
        let mut visited: HashSet<EngramId> = HashSet::from([*source]);
        let mut frontier: VecDeque<(EngramId, Vec<EngramId>)> =
            VecDeque::from([(*source, Vec::new())]);
        let mut depth = 0usize;

        while !frontier.is_empty() && depth < max_depth {
            let mut next_frontier = VecDeque::new();
            while let Some((current, path)) = frontier.pop_front() {
                for verb in self.incident_verbs(&current).await? {
                    if verb.verb.orphaned {
                        continue;
                    }
                    if let Some(types) = verb_types {
                        if !types.contains(&verb.verb.verb) {
                            continue;
                        }
                    }
                    let neighbor = match direction {
                        Direction::Out if verb.verb.source_id == current => verb.verb.target_id,
                        Direction::In if verb.verb.target_id == current => verb.verb.source_id,
                        Direction::Both => {
                            if verb.verb.source_id == current {
                                verb.verb.target_id
                            } else {
                                verb.verb.source_id
                            }
                        }
                        _ => continue,
                    };
                    if !visited.insert(neighbor) {
                        continue;
                    }
                    // Endpoint may have been deleted under the orphan
                    // policy without the verb being flagged yet.
                    let Some(noun) = self.adapter.get_noun(&neighbor).await? else {
                        continue;
                    };
                    let mut hop_path = path.clone();
                    hop_path.push(verb.id());
                    next_frontier.push_back((neighbor, hop_path.clone()));
                    results.push(TraversalHit {
                        noun,
                        path: hop_path,
                    });
                }
            }
            frontier = next_frontier;
            depth += 1;
        }
        Ok(results)
    }
}
