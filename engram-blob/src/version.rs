//! Copy-on-write versioning over the blob store.
//!
//! A commit snapshots the live entity set as a tree blob and chains to
//! its parent, one linear chain per branch. Trees and version content go
//! through the blob store, so unchanged state deduplicates across
//! commits. History walks are lazy: [`VersionStore::stream_history`]
//! holds one commit at a time no matter how long the chain is.

use crate::store::{BlobClass, BlobStore};
use engram_core::{now_ms, EngramError, EngramId, Result, TimestampMs};
use engram_storage::{keys, StorageAdapter};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Default branch name.
pub const DEFAULT_BRANCH: &str = "main";

/// An immutable commit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commit {
    /// Content hash of the serialized record (excluding this field).
    pub hash: String,
    /// Parent commit hash; `None` for the root commit.
    pub parent: Option<String>,
    pub timestamp: TimestampMs,
    pub author: String,
    pub message: String,
    /// Hash of the tree blob this commit snapshots.
    pub tree: String,
}

/// The id set constituting one commit's snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Tree {
    pub noun_ids: Vec<String>,
    pub verb_ids: Vec<String>,
}

impl Tree {
    pub fn new(mut noun_ids: Vec<String>, mut verb_ids: Vec<String>) -> Self {
        // Sorted ids make identical states hash identically.
        noun_ids.sort();
        verb_ids.sort();
        Self { noun_ids, verb_ids }
    }
}

/// Filters for history walks.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Exact author match.
    pub author: Option<String>,
    /// Only commits at or after this timestamp.
    pub since: Option<TimestampMs>,
    /// Only commits at or before this timestamp.
    pub until: Option<TimestampMs>,
    /// Maximum commits yielded.
    pub limit: Option<usize>,
}

#[derive(Serialize)]
struct CommitDigest<'a> {
    parent: &'a Option<String>,
    timestamp: TimestampMs,
    author: &'a str,
    message: &'a str,
    tree: &'a str,
}

/// Commit history and version content over one branch.
pub struct VersionStore {
    blobs: Arc<BlobStore>,
    adapter: Arc<StorageAdapter>,
    branch: String,
}

impl VersionStore {
    pub fn new(blobs: Arc<BlobStore>) -> Self {
        Self::with_branch(blobs, DEFAULT_BRANCH)
    }

    pub fn with_branch(blobs: Arc<BlobStore>, branch: impl Into<String>) -> Self {
        let adapter = Arc::clone(blobs.adapter());
        Self {
            blobs,
            adapter,
            branch: branch.into(),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Head commit hash of this branch, if any commit exists.
    pub async fn head(&self) -> Result<Option<String>> {
        match self.adapter.get(&keys::branch(&self.branch)).await? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let hash = text.trim();
                Ok((!hash.is_empty()).then(|| hash.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Create a commit snapshotting `tree`, advancing the branch head.
    pub async fn commit(
        &self,
        message: impl Into<String>,
        author: impl Into<String>,
        tree: Tree,
    ) -> Result<Commit> {
        let message = message.into();
        let author = author.into();

        let tree_bytes = serde_json::to_vec(&tree)?;
        let tree_hash = self.blobs.write(&tree_bytes, BlobClass::Tree).await?;

        let parent = self.head().await?;
        let timestamp = now_ms();
        let digest_bytes = serde_json::to_vec(&CommitDigest {
            parent: &parent,
            timestamp,
            author: &author,
            message: &message,
            tree: &tree_hash,
        })?;
        let hash = BlobStore::content_hash(&digest_bytes);

        let commit = Commit {
            hash: hash.clone(),
            parent,
            timestamp,
            author,
            message,
            tree: tree_hash,
        };

        // Record first, head pointer second: a crash in between leaves an
        // unreferenced commit record, never a head pointing at nothing.
        self.adapter
            .put(&keys::commit(&hash), serde_json::to_vec(&commit)?)
            .await?;
        self.adapter
            .put(&keys::branch(&self.branch), format!("{hash}\n").into_bytes())
            .await?;
        debug!(%hash, branch = %self.branch, "created commit");
        Ok(commit)
    }

    pub async fn get_commit(&self, hash: &str) -> Result<Option<Commit>> {
        match self.adapter.get(&keys::commit(hash)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get_tree(&self, commit: &Commit) -> Result<Tree> {
        let bytes = self.blobs.read(&commit.tree).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Eager history walk, newest first.
    pub async fn get_history(&self, filter: &HistoryFilter) -> Result<Vec<Commit>> {
        let mut commits = Vec::new();
        let mut cursor = self.head().await?;
        let limit = filter.limit.unwrap_or(usize::MAX);

        while let Some(hash) = cursor {
            if commits.len() >= limit {
                break;
            }
            let Some(commit) = self.get_commit(&hash).await? else {
                return Err(EngramError::not_found("commit", hash));
            };
            cursor = commit.parent.clone();
            if let Some(since) = filter.since {
                if commit.timestamp < since {
                    // Chain timestamps only decrease; nothing older matches.
                    break;
                }
            }
            if Self::matches(filter, &commit) {
                commits.push(commit);
            }
        }
        Ok(commits)
    }

    /// Lazy history walk, newest first.
    ///
    /// One commit is resident at a time: the stream fetches the next
    /// parent only when polled, and dropping it cancels any in-flight
    /// fetch. Yields the same commits in the same order as
    /// [`get_history`] under equivalent filters.
    pub fn stream_history(
        &self,
        filter: HistoryFilter,
    ) -> impl Stream<Item = Result<Commit>> + '_ {
        async_stream::try_stream! {
            let limit = filter.limit.unwrap_or(usize::MAX);
            let mut yielded = 0usize;
            let mut cursor = self.head().await?;

            while let Some(hash) = cursor {
                if yielded >= limit {
                    break;
                }
                let commit = self
                    .get_commit(&hash)
                    .await?
                    .ok_or_else(|| EngramError::not_found("commit", &hash))?;
                cursor = commit.parent.clone();
                if let Some(since) = filter.since {
                    if commit.timestamp < since {
                        break;
                    }
                }
                if Self::matches(&filter, &commit) {
                    yielded += 1;
                    yield commit;
                }
            }
        }
    }

    fn matches(filter: &HistoryFilter, commit: &Commit) -> bool {
        if let Some(author) = &filter.author {
            if &commit.author != author {
                return false;
            }
        }
        if let Some(until) = filter.until {
            if commit.timestamp > until {
                return false;
            }
        }
        true
    }

    /// Every blob hash reachable from any commit of this branch: tree
    /// blobs plus the commits' version-content closure. The GC's "do not
    /// touch" set.
    pub async fn reachable_hashes(&self) -> Result<HashSet<String>> {
        let mut reachable = HashSet::new();
        let mut cursor = self.head().await?;
        while let Some(hash) = cursor {
            let Some(commit) = self.get_commit(&hash).await? else {
                break;
            };
            reachable.insert(commit.tree.clone());
            cursor = commit.parent;
        }
        Ok(reachable)
    }

    // ----- entity version content ------------------------------------------

    /// Store one entity's serialized state, content-addressed under an
    /// entity-scoped key. Identical states across commits share one
    /// record. Returns the content hash.
    pub async fn write_entity_version(&self, entity_id: &EngramId, bytes: &[u8]) -> Result<String> {
        let hash = BlobStore::content_hash(bytes);
        let key = version_content_key(entity_id, &hash);
        if !self.adapter.exists(&key).await? {
            self.adapter.put(&key, bytes.to_vec()).await?;
        }
        Ok(hash)
    }

    pub async fn read_entity_version(
        &self,
        entity_id: &EngramId,
        content_hash: &str,
    ) -> Result<Option<Vec<u8>>> {
        self.adapter
            .get(&version_content_key(entity_id, content_hash))
            .await
    }
}

fn version_content_key(entity_id: &EngramId, content_hash: &str) -> String {
    format!("__system_version_{entity_id}_{content_hash}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{pin_mut, StreamExt};

    fn version_store() -> VersionStore {
        let adapter = Arc::new(StorageAdapter::memory());
        VersionStore::new(Arc::new(BlobStore::new(adapter)))
    }

    fn tree_of(nouns: &[&str]) -> Tree {
        Tree::new(nouns.iter().map(|s| s.to_string()).collect(), Vec::new())
    }

    #[tokio::test]
    async fn test_commit_chain_and_head() {
        let store = version_store();
        assert!(store.head().await.unwrap().is_none());

        let first = store.commit("first", "alice", tree_of(&["a"])).await.unwrap();
        assert!(first.parent.is_none());
        assert_eq!(store.head().await.unwrap(), Some(first.hash.clone()));

        let second = store.commit("second", "alice", tree_of(&["a", "b"])).await.unwrap();
        assert_eq!(second.parent.as_deref(), Some(first.hash.as_str()));
        assert_eq!(store.head().await.unwrap(), Some(second.hash.clone()));

        let tree = store.get_tree(&second).await.unwrap();
        assert_eq!(tree.noun_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let store = version_store();
        let mut hashes = Vec::new();
        for i in 0..5 {
            let commit = store
                .commit(format!("c{i}"), "bob", tree_of(&["x"]))
                .await
                .unwrap();
            hashes.push(commit.hash);
        }
        let history = store.get_history(&HistoryFilter::default()).await.unwrap();
        assert_eq!(history.len(), 5);
        let walked: Vec<String> = history.iter().map(|c| c.hash.clone()).collect();
        hashes.reverse();
        assert_eq!(walked, hashes);
    }

    #[tokio::test]
    async fn test_stream_matches_eager_history() {
        let store = version_store();
        for i in 0..20 {
            let author = if i % 2 == 0 { "alice" } else { "bob" };
            store
                .commit(format!("c{i}"), author, tree_of(&["x"]))
                .await
                .unwrap();
        }
        let filter = HistoryFilter {
            author: Some("alice".to_string()),
            limit: Some(7),
            ..Default::default()
        };

        let eager = store.get_history(&filter).await.unwrap();
        let stream = store.stream_history(filter);
        pin_mut!(stream);
        let mut lazy = Vec::new();
        while let Some(commit) = stream.next().await {
            lazy.push(commit.unwrap());
        }
        assert_eq!(eager.len(), 7);
        assert_eq!(lazy, eager);
    }

    #[tokio::test]
    async fn test_stream_on_empty_branch_completes() {
        let store = version_store();
        let stream = store.stream_history(HistoryFilter::default());
        pin_mut!(stream);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_early_break() {
        let store = version_store();
        for i in 0..50 {
            store
                .commit(format!("c{i}"), "eve", tree_of(&["x"]))
                .await
                .unwrap();
        }
        let stream = store.stream_history(HistoryFilter::default());
        pin_mut!(stream);
        // Take three and walk away; the generator must not have walked
        // the remaining 47.
        let mut taken = 0;
        while let Some(commit) = stream.next().await {
            commit.unwrap();
            taken += 1;
            if taken == 3 {
                break;
            }
        }
        assert_eq!(taken, 3);
    }

    #[tokio::test]
    async fn test_stream_latest_is_last_commit() {
        let store = version_store();
        store.commit("old", "a", tree_of(&["x"])).await.unwrap();
        let newest = store.commit("new", "a", tree_of(&["y"])).await.unwrap();

        let stream = store.stream_history(HistoryFilter {
            limit: Some(1),
            ..Default::default()
        });
        pin_mut!(stream);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, newest);
    }

    #[tokio::test]
    async fn test_identical_trees_deduplicate() {
        let adapter = Arc::new(StorageAdapter::memory());
        let blobs = Arc::new(BlobStore::new(adapter));
        let store = VersionStore::new(Arc::clone(&blobs));

        for i in 0..10 {
            store
                .commit(format!("c{i}"), "a", tree_of(&["same", "state"]))
                .await
                .unwrap();
        }
        // Ten commits over one unchanged state store a single tree blob.
        let stats = blobs.stats();
        assert_eq!(stats.total_blobs, 1);
        assert_eq!(stats.dedup_hits, 9);
        assert!(stats.dedup_savings > 0);
    }

    #[tokio::test]
    async fn test_reachable_hashes_cover_all_trees() {
        let store = version_store();
        let c1 = store.commit("1", "a", tree_of(&["x"])).await.unwrap();
        let c2 = store.commit("2", "a", tree_of(&["y"])).await.unwrap();

        let reachable = store.reachable_hashes().await.unwrap();
        assert!(reachable.contains(&c1.tree));
        assert!(reachable.contains(&c2.tree));
    }

    #[tokio::test]
    async fn test_entity_version_content_dedup() {
        let store = version_store();
        let entity = EngramId::new();
        let h1 = store.write_entity_version(&entity, b"state").await.unwrap();
        let h2 = store.write_entity_version(&entity, b"state").await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(
            store.read_entity_version(&entity, &h1).await.unwrap(),
            Some(b"state".to_vec())
        );
        assert!(store
            .read_entity_version(&entity, &"f".repeat(64))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_branches_are_independent() {
        let adapter = Arc::new(StorageAdapter::memory());
        let blobs = Arc::new(BlobStore::new(adapter));
        let main = VersionStore::with_branch(Arc::clone(&blobs), "main");
        let side = VersionStore::with_branch(blobs, "side");

        main.commit("m", "a", tree_of(&["m"])).await.unwrap();
        assert!(side.head().await.unwrap().is_none());
        side.commit("s", "a", tree_of(&["s"])).await.unwrap();

        assert_eq!(main.get_history(&HistoryFilter::default()).await.unwrap().len(), 1);
        assert_eq!(side.get_history(&HistoryFilter::default()).await.unwrap().len(), 1);
    }
}
