//! Engram: a hybrid semantic database core.
//!
//! An HNSW vector index coupled to a typed property graph, with
//! content-addressed copy-on-write persistence and per-service
//! statistics. This crate is the coordinator tier: it owns the public
//! API and sequences compound operations across the index, graph, blob,
//! and storage layers.
//!
//! # Example
//!
//! ```no_run
//! use engram_db::prelude::*;
//! use engram_core::{DatabaseConfig, NounType, VerbType};
//! use std::sync::Arc;
//!
//! # async fn example() -> engram_core::Result<()> {
//! let db = Engram::init(
//!     DatabaseConfig::default(),
//!     Arc::new(HashEmbedder::new(384)),
//! )
//! .await?;
//!
//! let doc = db
//!     .add(AddRequest::text("HNSW indexes are fast", NounType::Document))
//!     .await?;
//! let topic = db
//!     .add(AddRequest::text("vector search", NounType::Topic))
//!     .await?;
//! db.relate(RelateRequest::new(doc, topic, VerbType::References))
//!     .await?;
//!
//! let results = db
//!     .find(FindRequest {
//!         text: Some("approximate nearest neighbors".to_string()),
//!         limit: 5,
//!         ..Default::default()
//!     })
//!     .await?;
//! for hit in results.hits {
//!     println!("{} ({:?})", hit.noun.id(), hit.distance);
//! }
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod embedding;

pub use database::{
    AddData, AddRequest, DatabaseStatistics, Engram, FindHit, FindRequest, FindResult,
    IndexHealthReport, RelateRequest, UpdateRequest,
};
pub use embedding::{
    global_gateway, install_global_gateway, EmbeddingGateway, EmbeddingProvider, HashEmbedder,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::database::{
        AddData, AddRequest, Engram, FindHit, FindRequest, FindResult, RelateRequest,
        UpdateRequest,
    };
    pub use crate::embedding::{EmbeddingGateway, EmbeddingProvider, HashEmbedder};
    pub use engram_blob::HistoryFilter;
    pub use engram_core::prelude::*;
    pub use engram_graph::Direction;
}
