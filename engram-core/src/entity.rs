//! The noun/verb entity model.
//!
//! A noun's *indexed core* (vector, per-layer neighbor sets, top layer) is
//! persisted separately from its *sidecar metadata* (service attribution,
//! confidence, weight, user fields). Reads combine the two into a
//! `NounWithMetadata`; verbs follow the same split, except that the core
//! relational fields (`verb`, `source_id`, `target_id`) always live on the
//! indexed record so traversal never needs a second fetch.

use crate::id::EngramId;
use crate::time::{de_timestamp_ms, now_ms, TimestampMs};
use crate::types::{NounType, VerbType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A dense embedding vector.
pub type Vector = Vec<f32>;

/// User-defined metadata fields. Values are free-form JSON.
pub type MetadataMap = HashMap<String, serde_json::Value>;

/// Per-layer neighbor sets of an HNSW node.
///
/// Keys are layer numbers (0 = base layer); `BTreeMap`/`BTreeSet` keep the
/// persisted JSON deterministic.
pub type LayerConnections = BTreeMap<u8, BTreeSet<EngramId>>;

/// The indexed core of an entity: vector plus graph topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Noun {
    pub id: EngramId,
    pub noun: NounType,
    /// The embedding vector. Fixed dimension per database.
    pub vector: Vector,
    /// HNSW neighbor sets by layer.
    #[serde(default)]
    pub connections: LayerConnections,
    /// Highest layer this node participates in.
    #[serde(default)]
    pub top_layer: u8,
    #[serde(deserialize_with = "de_timestamp_ms")]
    pub created_at: TimestampMs,
    #[serde(deserialize_with = "de_timestamp_ms")]
    pub updated_at: TimestampMs,
}

impl Noun {
    /// Create a new noun with a fresh id and current timestamps.
    pub fn new(noun: NounType, vector: Vector) -> Self {
        Self::with_id(EngramId::new(), noun, vector)
    }

    /// Create a noun with an explicit id.
    pub fn with_id(id: EngramId, noun: NounType, vector: Vector) -> Self {
        let now = now_ms();
        Self {
            id,
            noun,
            vector,
            connections: LayerConnections::new(),
            top_layer: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Sidecar metadata for a noun.
///
/// Carries the user-defined fields plus a stored copy of the standard
/// fields so older storage layouts remain readable on their own.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NounMetadata {
    pub noun: Option<NounType>,
    /// Which upstream caller produced this entity.
    #[serde(default)]
    pub service: String,
    pub confidence: Option<f32>,
    pub weight: Option<f32>,
    #[serde(default, deserialize_with = "de_opt_timestamp_ms")]
    pub created_at: Option<TimestampMs>,
    #[serde(default, deserialize_with = "de_opt_timestamp_ms")]
    pub updated_at: Option<TimestampMs>,
    /// Free-form user fields.
    #[serde(default)]
    pub fields: MetadataMap,
}

/// A noun combined with its sidecar metadata: the canonical read shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NounWithMetadata {
    #[serde(flatten)]
    pub noun: Noun,
    pub service: String,
    pub confidence: Option<f32>,
    pub weight: Option<f32>,
    #[serde(default)]
    pub metadata: MetadataMap,
}

impl NounWithMetadata {
    /// Combine an indexed record with its sidecar.
    pub fn combine(noun: Noun, sidecar: Option<NounMetadata>) -> Self {
        let sidecar = sidecar.unwrap_or_default();
        Self {
            noun,
            service: sidecar.service,
            confidence: sidecar.confidence,
            weight: sidecar.weight,
            metadata: sidecar.fields,
        }
    }

    pub fn id(&self) -> EngramId {
        self.noun.id
    }
}

/// The indexed core of a typed edge.
///
/// `verb`, `source_id` and `target_id` are first-class fields: traversal
/// reads them straight off this record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verb {
    pub id: EngramId,
    pub verb: VerbType,
    pub source_id: EngramId,
    pub target_id: EngramId,
    /// Vector representation; derived from the endpoints when not supplied.
    pub vector: Vector,
    #[serde(default)]
    pub connections: LayerConnections,
    #[serde(default)]
    pub top_layer: u8,
    /// Set when an endpoint was deleted under the `orphan` cascade policy.
    /// Orphaned verbs are excluded from traversal results.
    #[serde(default)]
    pub orphaned: bool,
    #[serde(deserialize_with = "de_timestamp_ms")]
    pub created_at: TimestampMs,
    #[serde(deserialize_with = "de_timestamp_ms")]
    pub updated_at: TimestampMs,
}

impl Verb {
    pub fn new(verb: VerbType, source_id: EngramId, target_id: EngramId, vector: Vector) -> Self {
        let now = now_ms();
        Self {
            id: EngramId::new(),
            verb,
            source_id,
            target_id,
            vector,
            connections: LayerConnections::new(),
            top_layer: 0,
            orphaned: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Sidecar metadata for a verb.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VerbMetadata {
    pub verb: Option<VerbType>,
    #[serde(default)]
    pub service: String,
    pub weight: Option<f32>,
    pub confidence: Option<f32>,
    #[serde(default, deserialize_with = "de_opt_timestamp_ms")]
    pub created_at: Option<TimestampMs>,
    #[serde(default, deserialize_with = "de_opt_timestamp_ms")]
    pub updated_at: Option<TimestampMs>,
    #[serde(default)]
    pub fields: MetadataMap,
}

/// A verb combined with its sidecar metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerbWithMetadata {
    #[serde(flatten)]
    pub verb: Verb,
    pub service: String,
    pub weight: Option<f32>,
    pub confidence: Option<f32>,
    #[serde(default)]
    pub metadata: MetadataMap,
}

impl VerbWithMetadata {
    pub fn combine(verb: Verb, sidecar: Option<VerbMetadata>) -> Self {
        let sidecar = sidecar.unwrap_or_default();
        Self {
            verb,
            service: sidecar.service,
            weight: sidecar.weight,
            confidence: sidecar.confidence,
            metadata: sidecar.fields,
        }
    }

    pub fn id(&self) -> EngramId {
        self.verb.id
    }
}

fn de_opt_timestamp_ms<'de, D>(deserializer: D) -> Result<Option<TimestampMs>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "de_timestamp_ms")] TimestampMs);
    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}
