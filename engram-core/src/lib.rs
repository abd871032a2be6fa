//! Core types and abstractions for the Engram hybrid semantic database.
//!
//! This crate provides the foundational types, configuration, and error
//! handling used across all Engram components.

pub mod config;
pub mod entity;
pub mod error;
pub mod id;
pub mod time;
pub mod types;

pub use config::{
    CascadePolicy, DatabaseConfig, HnswConfig, PartitionConfig, PartitionStrategy,
    QuantizationConfig, SearchFanout, StorageConfig, VectorStorageMode,
};
pub use entity::{
    LayerConnections, MetadataMap, Noun, NounMetadata, NounWithMetadata, Vector, Verb,
    VerbMetadata, VerbWithMetadata,
};
pub use error::{EngramError, Result};
pub use id::EngramId;
pub use time::{now_ms, TimestampMs};
pub use types::{NounType, VerbType};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{
        CascadePolicy, DatabaseConfig, HnswConfig, PartitionConfig, PartitionStrategy,
        QuantizationConfig, SearchFanout, StorageConfig, VectorStorageMode,
    };
    pub use crate::entity::{
        MetadataMap, Noun, NounMetadata, NounWithMetadata, Vector, Verb, VerbMetadata,
        VerbWithMetadata,
    };
    pub use crate::error::{EngramError, Result};
    pub use crate::id::EngramId;
    pub use crate::time::{now_ms, TimestampMs};
    pub use crate::types::{NounType, VerbType};
}
