//! Object-store storage backend.
//!
//! Talks to an S3-style service through the [`ObjectClient`] trait so the
//! core stays free of any one vendor SDK. The backend prefers the
//! provider's batch APIs where they exist: `delete_objects` removes up to
//! a thousand keys per round trip instead of one.

use async_trait::async_trait;
use dashmap::DashMap;
use engram_core::Result;
use std::sync::Arc;

/// Minimal S3-style client surface.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put_object(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool>;
    /// Batch delete. Returns `(key, error)` pairs for keys that failed.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<(String, String)>>;
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
    async fn head_object(&self, bucket: &str, key: &str) -> Result<bool>;
}

/// Object-store backend bound to one bucket and key prefix.
pub struct ObjectStoreBackend {
    client: Arc<dyn ObjectClient>,
    bucket: String,
    prefix: String,
}

impl ObjectStoreBackend {
    pub fn new(client: Arc<dyn ObjectClient>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self {
            client,
            bucket: bucket.into(),
            prefix,
        }
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.client.get_object(&self.bucket, &self.object_key(key)).await
    }

    pub async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.client.put_object(&self.bucket, &self.object_key(key), bytes).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.client.delete_object(&self.bucket, &self.object_key(key)).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.client.head_object(&self.bucket, &self.object_key(key)).await
    }

    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.object_key(prefix);
        let mut keys: Vec<String> = self
            .client
            .list_objects(&self.bucket, &full_prefix)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Native batch delete through the provider API. Returns `(key,
    /// error)` pairs for per-key failures, with backend keys restored to
    /// adapter keys.
    pub async fn delete_batch(&self, keys: &[String]) -> Result<Vec<(String, String)>> {
        let object_keys: Vec<String> = keys.iter().map(|k| self.object_key(k)).collect();
        let failed = self.client.delete_objects(&self.bucket, &object_keys).await?;
        Ok(failed
            .into_iter()
            .map(|(k, err)| {
                let key = k.strip_prefix(&self.prefix).map(str::to_string).unwrap_or(k);
                (key, err)
            })
            .collect())
    }
}

/// In-process [`ObjectClient`] used in tests and as the reference
/// implementation of the client contract.
#[derive(Debug, Default)]
pub struct InMemoryObjectClient {
    objects: DashMap<String, Vec<u8>>,
}

impl InMemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_key(bucket: &str, key: &str) -> String {
        format!("{bucket}\u{0}{key}")
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

#[async_trait]
impl ObjectClient for InMemoryObjectClient {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .get(&Self::full_key(bucket, key))
            .map(|e| e.value().clone()))
    }

    async fn put_object(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects.insert(Self::full_key(bucket, key), bytes);
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.objects.remove(&Self::full_key(bucket, key)).is_some())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<(String, String)>> {
        for key in keys {
            self.objects.remove(&Self::full_key(bucket, key));
        }
        Ok(Vec::new())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let bucket_prefix = Self::full_key(bucket, prefix);
        Ok(self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(&bucket_prefix))
            .filter_map(|e| e.key().split('\u{0}').nth(1).map(str::to_string))
            .collect())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.objects.contains_key(&Self::full_key(bucket, key)))
    }
}
