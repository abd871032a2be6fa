//! Content-addressed blob storage and copy-on-write versioning.
//!
//! # Architecture
//!
//! - [`cache`]: LRU read cache with hit/miss accounting
//! - [`store`]: SHA-256-keyed blob store: dedup via reference counts,
//!   optional zstd compression, integrity-verified reads, ref-counted GC
//! - [`version`]: commit chains over the blob store with lazy
//!   `stream_history`

pub mod cache;
pub mod store;
pub mod version;

pub use cache::{BlobCache, CacheStatistics};
pub use store::{
    BlobClass, BlobMetadata, BlobStore, BlobStoreConfig, BlobStoreStats, Compression,
    CompressionMode,
};
pub use version::{Commit, HistoryFilter, Tree, VersionStore, DEFAULT_BRANCH};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{BlobCache, CacheStatistics};
    pub use crate::store::{BlobClass, BlobStore, BlobStoreConfig, BlobStoreStats};
    pub use crate::version::{Commit, HistoryFilter, Tree, VersionStore};
}
