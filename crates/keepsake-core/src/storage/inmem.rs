//! In-memory reference backend
//!
//! A complete, dependency-free implementation of [`MemoryStorage`] over a
//! `HashMap`. It exists for the test suite (it stands in for the cloud
//! secondary in hybrid tests) and for ephemeral embedded use where
//! persistence is not wanted. Semantic retrieval uses the deterministic
//! hash-projection embedder, so ranking is stable across runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::embeddings::{Embedding, EmbeddingProvider, FallbackEmbedder};
use crate::memory::{now_timestamp, Memory, MemoryQueryResult};
use crate::tags::{normalize_tags, validate_tags};

use super::{
    MemoryStorage, MemoryUpdates, Result, StorageStats, TagCount, TagMatch,
};

struct Inner {
    live: HashMap<String, Memory>,
    embeddings: HashMap<String, Embedding>,
    tombstones: HashMap<String, f64>,
    /// Simulated transport failure for sync tests
    fail_next: usize,
}

/// HashMap-backed reference backend
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
    embedder: FallbackEmbedder,
    max_content_length: Option<usize>,
}

impl InMemoryStorage {
    /// Create an empty backend with unlimited content length
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                live: HashMap::new(),
                embeddings: HashMap::new(),
                tombstones: HashMap::new(),
                fail_next: 0,
            }),
            embedder: FallbackEmbedder::new(128),
            max_content_length: None,
        }
    }

    /// Create a backend that enforces a content length limit
    pub fn with_max_content_length(max: usize) -> Self {
        Self {
            max_content_length: Some(max),
            ..Self::new()
        }
    }

    /// Make the next `n` mutating calls fail with a transient error.
    /// Used by sync tests to exercise retry paths.
    pub async fn fail_next_operations(&self, n: usize) {
        self.inner.lock().await.fail_next = n;
    }

    async fn check_failure(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(super::StorageError::Http(
                "simulated timeout: connection reset".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_tags(memory: &Memory, tags: &[String], operation: TagMatch) -> bool {
    match operation {
        TagMatch::Any => tags.iter().any(|t| memory.tags.contains(t)),
        TagMatch::All => tags.iter().all(|t| memory.tags.contains(t)),
    }
}

fn newest_first(mut memories: Vec<Memory>) -> Vec<Memory> {
    memories.sort_by(|a, b| {
        b.created_at
            .partial_cmp(&a.created_at)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    memories
}

#[async_trait]
impl MemoryStorage for InMemoryStorage {
    fn max_content_length(&self) -> Option<usize> {
        self.max_content_length
    }

    fn supports_chunking(&self) -> bool {
        false
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn store(&self, memory: &Memory) -> Result<(bool, String)> {
        self.check_failure().await?;
        if let Some(max) = self.max_content_length {
            if memory.content.chars().count() > max {
                return Ok((
                    false,
                    format!("Content exceeds maximum length of {max} characters"),
                ));
            }
        }
        let tags = normalize_tags(&memory.tags);
        if let Err(msg) = validate_tags(&tags) {
            return Ok((false, msg));
        }

        let embedding = self.embedder.embed(&memory.content).await.ok();

        let mut inner = self.inner.lock().await;
        if inner.tombstones.contains_key(&memory.content_hash) {
            return Ok((
                false,
                "Memory was deleted on this device (tombstone active)".to_string(),
            ));
        }
        if inner.live.contains_key(&memory.content_hash) {
            return Ok((false, "Duplicate content detected".to_string()));
        }
        let mut stored = memory.clone();
        stored.tags = tags;
        if let Some(embedding) = embedding {
            inner.embeddings.insert(stored.content_hash.clone(), embedding);
        }
        inner.live.insert(stored.content_hash.clone(), stored);
        Ok((true, "Memory stored successfully".to_string()))
    }

    async fn retrieve(&self, query: &str, n_results: usize) -> Result<Vec<MemoryQueryResult>> {
        let query_embedding = self.embedder.embed(query).await?;
        let inner = self.inner.lock().await;
        let mut scored: Vec<MemoryQueryResult> = inner
            .live
            .values()
            .map(|m| {
                let relevance = inner
                    .embeddings
                    .get(&m.content_hash)
                    .map(|e| f64::from(query_embedding.cosine_similarity(e)))
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0);
                MemoryQueryResult::new(m.clone(), relevance)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(n_results);
        Ok(scored)
    }

    async fn search_by_tag(&self, tags: &[String], time_start: Option<f64>) -> Result<Vec<Memory>> {
        let inner = self.inner.lock().await;
        Ok(newest_first(
            inner
                .live
                .values()
                .filter(|m| matches_tags(m, tags, TagMatch::Any))
                .filter(|m| time_start.is_none_or(|t| m.created_at >= t))
                .cloned()
                .collect(),
        ))
    }

    async fn search_by_tags(
        &self,
        tags: &[String],
        operation: TagMatch,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> Result<Vec<Memory>> {
        let inner = self.inner.lock().await;
        Ok(newest_first(
            inner
                .live
                .values()
                .filter(|m| matches_tags(m, tags, operation))
                .filter(|m| time_start.is_none_or(|t| m.created_at >= t))
                .filter(|m| time_end.is_none_or(|t| m.created_at <= t))
                .cloned()
                .collect(),
        ))
    }

    async fn delete(&self, content_hash: &str) -> Result<(bool, String)> {
        self.check_failure().await?;
        let mut inner = self.inner.lock().await;
        if inner.live.remove(content_hash).is_some() {
            inner.embeddings.remove(content_hash);
            inner.tombstones.insert(content_hash.to_string(), now_timestamp());
            Ok((true, format!("Deleted memory {content_hash}")))
        } else {
            Ok((false, format!("Memory not found: {content_hash}")))
        }
    }

    async fn is_deleted(&self, content_hash: &str) -> Result<bool> {
        Ok(self.inner.lock().await.tombstones.contains_key(content_hash))
    }

    async fn purge_deleted(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = now_timestamp() - f64::from(older_than_days) * 86_400.0;
        let mut inner = self.inner.lock().await;
        let before = inner.tombstones.len();
        inner.tombstones.retain(|_, deleted_at| *deleted_at >= cutoff);
        Ok(before - inner.tombstones.len())
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<(usize, String)> {
        let (count, message, _) = self.delete_by_tags(&[tag.to_string()]).await?;
        Ok((count, message))
    }

    async fn delete_by_tags(&self, tags: &[String]) -> Result<(usize, String, Vec<String>)> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<String> = inner
            .live
            .values()
            .filter(|m| matches_tags(m, tags, TagMatch::Any))
            .map(|m| m.content_hash.clone())
            .collect();
        let now = now_timestamp();
        for hash in &doomed {
            inner.live.remove(hash);
            inner.embeddings.remove(hash);
            inner.tombstones.insert(hash.clone(), now);
        }
        let count = doomed.len();
        Ok((
            count,
            format!("Deleted {count} memories across {} tag(s)", tags.len()),
            doomed,
        ))
    }

    async fn cleanup_duplicates(&self) -> Result<(usize, String)> {
        // Hash-keyed map cannot hold duplicates
        Ok((0, "No duplicates found".to_string()))
    }

    async fn update_memory_metadata(
        &self,
        content_hash: &str,
        updates: &MemoryUpdates,
        preserve_timestamps: bool,
    ) -> Result<(bool, String)> {
        self.check_failure().await?;
        let mut inner = self.inner.lock().await;
        let Some(memory) = inner.live.get_mut(content_hash) else {
            return Ok((false, format!("Memory not found: {content_hash}")));
        };
        if let Some(tags) = &updates.tags {
            let tags = normalize_tags(tags);
            if let Err(msg) = validate_tags(&tags) {
                return Ok((false, msg));
            }
            memory.tags = tags;
        }
        if let Some(memory_type) = &updates.memory_type {
            memory.memory_type = Some(memory_type.clone());
        }
        if let Some(metadata) = &updates.metadata {
            for (k, v) in metadata {
                memory.metadata.insert(k.clone(), v.clone());
            }
        }
        if !preserve_timestamps {
            memory.created_at = now_timestamp();
            memory.created_at_iso = crate::memory::iso_from_timestamp(memory.created_at);
        }
        memory.touch();
        Ok((true, "Memory updated".to_string()))
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>> {
        Ok(self.inner.lock().await.live.get(content_hash).cloned())
    }

    async fn get_by_exact_content(&self, content: &str) -> Result<Vec<Memory>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .live
            .values()
            .filter(|m| m.content == content)
            .cloned()
            .collect())
    }

    async fn get_all_memories(
        &self,
        limit: Option<usize>,
        offset: usize,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<Vec<Memory>> {
        let inner = self.inner.lock().await;
        let filtered: Vec<Memory> = inner
            .live
            .values()
            .filter(|m| memory_type.is_none_or(|t| m.memory_type.as_deref() == Some(t)))
            .filter(|m| tags.is_none_or(|ts| matches_tags(m, ts, TagMatch::Any)))
            .cloned()
            .collect();
        let ordered = newest_first(filtered);
        let paged: Vec<Memory> = ordered.into_iter().skip(offset).collect();
        Ok(match limit {
            Some(n) => paged.into_iter().take(n).collect(),
            None => paged,
        })
    }

    async fn count_all_memories(
        &self,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner
            .live
            .values()
            .filter(|m| memory_type.is_none_or(|t| m.memory_type.as_deref() == Some(t)))
            .filter(|m| tags.is_none_or(|ts| matches_tags(m, ts, TagMatch::Any)))
            .count())
    }

    async fn get_memories_by_time_range(&self, start: f64, end: f64) -> Result<Vec<Memory>> {
        let inner = self.inner.lock().await;
        Ok(newest_first(
            inner
                .live
                .values()
                .filter(|m| m.created_at >= start && m.created_at <= end)
                .cloned()
                .collect(),
        ))
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let inner = self.inner.lock().await;
        let now = now_timestamp();
        let week = now - 7.0 * 86_400.0;
        let month = now - 30.0 * 86_400.0;
        let mut tags = std::collections::BTreeSet::new();
        for m in inner.live.values() {
            tags.extend(m.tags.iter().cloned());
        }
        Ok(StorageStats {
            backend: "in-memory".to_string(),
            total_memories: inner.live.len(),
            unique_tags: tags.len(),
            memories_this_week: inner.live.values().filter(|m| m.created_at >= week).count(),
            memories_this_month: inner.live.values().filter(|m| m.created_at >= month).count(),
            size_bytes: inner.live.values().map(|m| m.content.len() as u64).sum(),
            sync_status: None,
            secondary_stats: None,
        })
    }

    async fn get_all_tags(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut tags = std::collections::BTreeSet::new();
        for m in inner.live.values() {
            tags.extend(m.tags.iter().cloned());
        }
        Ok(tags.into_iter().collect())
    }

    async fn get_all_tags_with_counts(&self) -> Result<Vec<TagCount>> {
        let inner = self.inner.lock().await;
        let mut counts: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
        for m in inner.live.values() {
            for tag in &m.tags {
                *counts.entry(tag.clone()).or_default() += 1;
            }
        }
        let mut out: Vec<TagCount> = counts
            .into_iter()
            .map(|(tag, count)| TagCount { tag, count })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        Ok(out)
    }

    async fn get_recent_memories(&self, n: usize) -> Result<Vec<Memory>> {
        self.get_all_memories(Some(n), 0, None, None).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mem(content: &str, tags: &[&str]) -> Memory {
        Memory::new(content, tags.iter().map(|t| t.to_string()).collect(), None)
    }

    #[tokio::test]
    async fn test_store_and_duplicate() {
        let storage = InMemoryStorage::new();
        let m = mem("hello world", &["a"]);
        let (ok, _) = storage.store(&m).await.unwrap();
        assert!(ok);
        let (ok, msg) = storage.store(&m).await.unwrap();
        assert!(!ok);
        assert!(msg.contains("Duplicate content detected"));
        assert_eq!(storage.count_all_memories(None, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_creates_tombstone_blocking_restore() {
        let storage = InMemoryStorage::new();
        let m = mem("ephemeral", &[]);
        storage.store(&m).await.unwrap();
        let (ok, _) = storage.delete(&m.content_hash).await.unwrap();
        assert!(ok);
        assert!(storage.get_by_hash(&m.content_hash).await.unwrap().is_none());
        assert!(storage.is_deleted(&m.content_hash).await.unwrap());
        // Store of the same hash is dropped while the tombstone lives
        let (ok, msg) = storage.store(&m).await.unwrap();
        assert!(!ok);
        assert!(msg.contains("tombstone"));
    }

    #[tokio::test]
    async fn test_purge_deleted_respects_age() {
        let storage = InMemoryStorage::new();
        let m = mem("old delete", &[]);
        storage.store(&m).await.unwrap();
        storage.delete(&m.content_hash).await.unwrap();
        // Recent tombstone survives a 30-day purge
        assert_eq!(storage.purge_deleted(30).await.unwrap(), 0);
        assert!(storage.is_deleted(&m.content_hash).await.unwrap());
        // Zero-day purge clears it
        assert_eq!(storage.purge_deleted(0).await.unwrap(), 1);
        assert!(!storage.is_deleted(&m.content_hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_tag_time_filter() {
        let storage = InMemoryStorage::new();
        let now = now_timestamp();
        let old = mem("old entry", &["test", "old"]).with_created_at(now - 2.0 * 86_400.0);
        let recent = mem("recent entry", &["test", "recent"]).with_created_at(now);
        storage.store(&old).await.unwrap();
        storage.store(&recent).await.unwrap();

        let tags = vec!["test".to_string()];
        let hits = storage
            .search_by_tag(&tags, Some(now - 86_400.0))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content_hash, recent.content_hash);

        assert_eq!(storage.search_by_tag(&tags, Some(0.0)).await.unwrap().len(), 2);
        assert_eq!(
            storage
                .search_by_tag(&tags, Some(now + 86_400.0))
                .await
                .unwrap()
                .len(),
            0
        );
        assert_eq!(storage.search_by_tag(&tags, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_and_tag_search() {
        let storage = InMemoryStorage::new();
        storage.store(&mem("both", &["a", "b"])).await.unwrap();
        storage.store(&mem("only a", &["a"])).await.unwrap();
        let tags = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            storage
                .search_by_tags(&tags, TagMatch::All, None, None)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            storage
                .search_by_tags(&tags, TagMatch::Any, None, None)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_retrieve_ranks_exact_content_first() {
        let storage = InMemoryStorage::new();
        storage.store(&mem("quarterly storage review", &[])).await.unwrap();
        storage.store(&mem("lunch plans for friday", &[])).await.unwrap();
        let results = storage.retrieve("quarterly storage review", 2).await.unwrap();
        assert_eq!(results[0].memory.content, "quarterly storage review");
        assert!(results[0].relevance_score > results[1].relevance_score);
    }

    #[tokio::test]
    async fn test_update_metadata_immutables() {
        let storage = InMemoryStorage::new();
        let m = mem("immutable core", &[]);
        storage.store(&m).await.unwrap();
        let updates = MemoryUpdates {
            tags: Some(vec!["new-tag".to_string()]),
            memory_type: Some("note".to_string()),
            metadata: None,
        };
        let (ok, _) = storage
            .update_memory_metadata(&m.content_hash, &updates, true)
            .await
            .unwrap();
        assert!(ok);
        let updated = storage.get_by_hash(&m.content_hash).await.unwrap().unwrap();
        assert_eq!(updated.content, m.content);
        assert_eq!(updated.content_hash, m.content_hash);
        assert_eq!(updated.created_at, m.created_at);
        assert!(updated.updated_at >= m.updated_at);
        assert_eq!(updated.tags, vec!["new-tag"]);
    }

    #[tokio::test]
    async fn test_cursor_pagination_default() {
        let storage = InMemoryStorage::new();
        let now = now_timestamp();
        for i in 0..5 {
            let m = mem(&format!("entry {i}"), &[]).with_created_at(now - f64::from(i));
            storage.store(&m).await.unwrap();
        }
        let first = storage.get_all_memories_cursor(2, None).await.unwrap();
        assert_eq!(first.len(), 2);
        let cursor = first.iter().map(|m| m.created_at).fold(f64::INFINITY, f64::min);
        let second = storage.get_all_memories_cursor(2, Some(cursor)).await.unwrap();
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|m| m.created_at < cursor));
    }
}
