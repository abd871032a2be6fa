//! The embedding gateway.
//!
//! The embedding model is the one process-global resource in the system.
//! Exactly one instance exists; its (potentially expensive) initialization
//! is fused so concurrent first callers share a single in-flight init,
//! and model calls serialize through the gateway mutex. The gateway only
//! ever sees the [`EmbeddingProvider`] trait, never a concrete model.

use async_trait::async_trait;
use engram_core::Result;
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// Maps text to a fixed-dimension vector. Out-of-process models implement
/// this; the core never learns their concrete type.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One-time heavy setup (model load, session spin-up). Must be
    /// idempotent; the gateway calls it exactly once.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Embed one text. The returned vector must have [`Self::dimension`]
    /// components.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// Serializes access to the one model instance and fuses its init.
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    init: tokio::sync::OnceCell<()>,
    call_lock: tokio::sync::Mutex<()>,
}

impl EmbeddingGateway {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            init: tokio::sync::OnceCell::new(),
            call_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    /// Embed text, initializing the provider on first use.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.init
            .get_or_try_init(|| async {
                debug!("initializing embedding provider");
                self.provider.init().await
            })
            .await?;
        let _serialized = self.call_lock.lock().await;
        self.provider.embed(text).await
    }
}

static GLOBAL_GATEWAY: OnceCell<Arc<EmbeddingGateway>> = OnceCell::new();

/// Install the process-wide gateway. The first installation wins; later
/// calls return the already-installed instance.
pub fn install_global_gateway(provider: Arc<dyn EmbeddingProvider>) -> Arc<EmbeddingGateway> {
    GLOBAL_GATEWAY
        .get_or_init(|| Arc::new(EmbeddingGateway::new(provider)))
        .clone()
}

/// The process-wide gateway, if one was installed.
pub fn global_gateway() -> Option<Arc<EmbeddingGateway>> {
    GLOBAL_GATEWAY.get().cloned()
}

/// Deterministic bag-of-tokens embedder for tests and local development.
///
/// Each lowercase token hashes to a handful of signed components, so
/// texts sharing vocabulary land near each other while disjoint texts
/// stay far apart. Output vectors are unit-normalized.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn token_components(&self, token: &str) -> Vec<(usize, f32)> {
        let digest = Sha256::digest(token.as_bytes());
        // Four (index, sign) pairs per token.
        (0..4)
            .map(|i| {
                let chunk = &digest[i * 8..i * 8 + 8];
                let raw = u64::from_le_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
                ]);
                let index = (raw % self.dimension as u64) as usize;
                let sign = if raw >> 63 == 0 { 1.0 } else { -1.0 };
                (index, sign)
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            for (index, sign) in self.token_components(token) {
                vector[index] += sign;
            }
        }
        engram_index::normalize(&mut vector);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
