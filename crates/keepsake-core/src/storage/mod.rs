//! Storage layer
//!
//! [`MemoryStorage`] is the uniform contract every backend satisfies. Three
//! concrete backends ship here: the embedded SQLite primary, the HTTP cloud
//! secondary, and the hybrid engine composing the two with a background sync
//! service. An in-memory reference backend backs the test suite.
//!
//! User-correctable conditions (duplicates, unknown hashes, invalid filter
//! combinations) are reported as `(false, message)` outcomes; `Err` is
//! reserved for infrastructure failures.

pub mod cloud;
pub mod hybrid;
pub mod inmem;
mod migrations;
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::embeddings::EmbeddingError;
use crate::memory::{Memory, MemoryQueryResult, Metadata};
use crate::timeparse::{parse_iso_date, parse_time_expression};

pub use hybrid::{HybridStorage, SyncStatus};
pub use sqlite::SqliteStorage;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// HTTP transport error against the cloud secondary
    #[error("HTTP error: {0}")]
    Http(String),
    /// Embedding generation error
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    /// Vector index error
    #[cfg(feature = "vector-search")]
    #[error("Vector index error: {0}")]
    VectorIndex(#[from] crate::search::VectorSearchError),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Operation not supported by this backend
    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// Tag matching mode for multi-tag queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMatch {
    /// Match memories carrying ANY of the tags
    #[default]
    Any,
    /// Match memories carrying ALL of the tags
    All,
}

/// Search mode for the unified search entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Vector similarity search
    #[default]
    Semantic,
    /// Exact content string match
    Exact,
    /// Lexical + vector fusion with optional quality reranking
    Hybrid,
}

/// Unified search request
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    /// Query text (required for semantic/exact; optional for time-only)
    pub query: Option<String>,
    /// Search mode
    pub mode: SearchMode,
    /// Natural-language time filter (`yesterday`, `last week`, ...)
    pub time_expr: Option<String>,
    /// Memories created on/after this ISO date (YYYY-MM-DD)
    pub after: Option<String>,
    /// Memories created on/before this ISO date (YYYY-MM-DD)
    pub before: Option<String>,
    /// Restrict to memories carrying any of these tags
    pub tags: Vec<String>,
    /// Quality weight in [0, 1] (0 = pure semantic)
    pub quality_boost: f64,
    /// Maximum results
    pub limit: usize,
    /// Attach debug counters to the response
    pub include_debug: bool,
}

/// Debug counters attached to a unified search response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDebug {
    /// Original natural-language expression, if any
    pub time_expr: Option<String>,
    /// Resolved range start
    pub start_timestamp: Option<f64>,
    /// Resolved range end
    pub end_timestamp: Option<f64>,
    /// Tag filter applied after the base search
    pub tag_filter: Vec<String>,
    /// Quality weight used
    pub quality_boost: f64,
    /// Candidates before time/tag filtering
    pub pre_filter_count: usize,
    /// Results after all filters
    pub post_filter_count: usize,
    /// Requested limit
    pub limit: usize,
}

/// Unified search response
#[derive(Debug, Clone)]
pub struct SearchResponse {
    /// Matching results, best first
    pub memories: Vec<MemoryQueryResult>,
    /// Number of results returned
    pub total: usize,
    /// Echo of the query
    pub query: Option<String>,
    /// Echo of the mode
    pub mode: SearchMode,
    /// Validation failure, if the request was rejected before any I/O
    pub error: Option<String>,
    /// Debug counters when requested
    pub debug: Option<SearchDebug>,
}

impl SearchResponse {
    fn rejected(request: &SearchRequest, message: impl Into<String>) -> Self {
        Self {
            memories: vec![],
            total: 0,
            query: request.query.clone(),
            mode: request.mode,
            error: Some(message.into()),
            debug: None,
        }
    }
}

/// Unified delete request; exactly one filter family must be present
#[derive(Debug, Clone, Default)]
pub struct DeleteRequest {
    /// Delete this single memory (other filters ignored)
    pub content_hash: Option<String>,
    /// Tag filter
    pub tags: Vec<String>,
    /// Tag matching mode
    pub tag_match: TagMatch,
    /// Delete memories created before this ISO date (YYYY-MM-DD, exclusive)
    pub before: Option<String>,
    /// Delete memories created after this ISO date (YYYY-MM-DD, exclusive)
    pub after: Option<String>,
    /// Preview without mutating
    pub dry_run: bool,
}

/// Unified delete outcome
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    /// Whether the operation succeeded
    pub success: bool,
    /// Memories deleted (or that would be, under dry_run)
    pub deleted_count: usize,
    /// Their hashes
    pub deleted_hashes: Vec<String>,
    /// Whether this was a preview
    pub dry_run: bool,
    /// Human-readable summary
    pub message: String,
    /// Failure detail when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeleteOutcome {
    fn rejected(dry_run: bool, error: impl Into<String>) -> Self {
        Self {
            success: false,
            dry_run,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Partial update applied to a memory; content and hash are immutable
#[derive(Debug, Clone, Default)]
pub struct MemoryUpdates {
    /// Replace the tag list
    pub tags: Option<Vec<String>>,
    /// Replace the memory type
    pub memory_type: Option<String>,
    /// Merge these metadata entries (existing keys overwritten)
    pub metadata: Option<Metadata>,
}

/// Tag with usage count
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagCount {
    /// Tag text
    pub tag: String,
    /// Number of live memories carrying it
    pub count: usize,
}

/// Backend statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    /// Backend name
    pub backend: String,
    /// Live memory count
    pub total_memories: usize,
    /// Distinct tag count
    pub unique_tags: usize,
    /// Memories created in the last 7 days
    pub memories_this_week: usize,
    /// Memories created in the last 30 days
    pub memories_this_month: usize,
    /// On-disk (or reported remote) size
    pub size_bytes: u64,
    /// Sync service status, hybrid backends only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,
    /// Secondary backend statistics when reachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_stats: Option<Box<StorageStats>>,
}

// ============================================================================
// STORAGE TRAIT
// ============================================================================

/// The uniform contract every backend implements.
#[async_trait]
pub trait MemoryStorage: Send + Sync {
    /// Maximum content length this backend accepts (None = unlimited)
    fn max_content_length(&self) -> Option<usize>;

    /// Whether the backend stores chunked memories with linking metadata
    fn supports_chunking(&self) -> bool;

    /// Idempotent initialization: tables, indexes, vector schema, migrations
    async fn initialize(&self) -> Result<()>;

    /// Store a memory. A `content_hash` collision yields
    /// `(false, "Duplicate content detected")`, not an error.
    async fn store(&self, memory: &Memory) -> Result<(bool, String)>;

    /// Store a batch. The default fans out concurrently; backends should
    /// override with a single transaction.
    async fn store_batch(&self, memories: &[Memory]) -> Result<Vec<(bool, String)>> {
        let pending = memories.iter().map(|m| self.store(m));
        let results = futures::future::join_all(pending).await;
        Ok(results
            .into_iter()
            .map(|r| match r {
                Ok(outcome) => outcome,
                Err(e) => (false, format!("Failed to store memory: {e}")),
            })
            .collect())
    }

    /// Vector similarity search; relevance in [0, 1]
    async fn retrieve(&self, query: &str, n_results: usize) -> Result<Vec<MemoryQueryResult>>;

    /// Lexical + vector fusion. Defaults to plain semantic retrieval for
    /// backends without a lexical index.
    async fn retrieve_hybrid(&self, query: &str, n_results: usize) -> Result<Vec<MemoryQueryResult>> {
        self.retrieve(query, n_results).await
    }

    /// Quality-aware retrieval: over-fetch 3x, rerank by
    /// `w * quality + (1 - w) * semantic`, return the top N.
    async fn retrieve_with_quality_boost(
        &self,
        query: &str,
        n_results: usize,
        quality_weight: f64,
    ) -> Result<Vec<MemoryQueryResult>> {
        if !(0.0..=1.0).contains(&quality_weight) {
            return Err(StorageError::Init(format!(
                "quality_weight must be 0.0-1.0, got {quality_weight}"
            )));
        }
        if quality_weight == 0.0 {
            return self.retrieve(query, n_results).await;
        }

        let oversample = 3;
        let mut candidates = self.retrieve(query, n_results * oversample).await?;
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let semantic_weight = 1.0 - quality_weight;
        for result in &mut candidates {
            let semantic_score = result.relevance_score;
            let quality_score = result.memory.quality_score();
            result.relevance_score =
                semantic_weight * semantic_score + quality_weight * quality_score;
            result.debug("original_semantic_score", semantic_score.into());
            result.debug("quality_score", quality_score.into());
            result.debug("quality_weight", quality_weight.into());
            result.debug("semantic_weight", semantic_weight.into());
            result.debug("reranked", true.into());
        }

        candidates.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(n_results);
        Ok(candidates)
    }

    /// OR-match across tags with optional creation-time lower bound.
    /// Both predicates are applied inside the backend, never as a client
    /// post-filter.
    async fn search_by_tag(&self, tags: &[String], time_start: Option<f64>)
        -> Result<Vec<Memory>>;

    /// AND/OR tag search with an optional inclusive time range
    async fn search_by_tags(
        &self,
        tags: &[String],
        operation: TagMatch,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> Result<Vec<Memory>>;

    /// Tag search ordered newest first with paging
    async fn search_by_tag_chronological(
        &self,
        tags: &[String],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Memory>> {
        let mut memories = self.search_by_tag(tags, None).await?;
        memories.sort_by(|a, b| {
            b.created_at
                .partial_cmp(&a.created_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let memories: Vec<Memory> = memories.into_iter().skip(offset).collect();
        Ok(match limit {
            Some(n) => memories.into_iter().take(n).collect(),
            None => memories,
        })
    }

    /// Delete by hash. Tombstoning backends soft-delete and retain the row.
    async fn delete(&self, content_hash: &str) -> Result<(bool, String)>;

    /// Whether a tombstone exists for this hash
    async fn is_deleted(&self, _content_hash: &str) -> Result<bool> {
        Ok(false)
    }

    /// Drop tombstones older than the given age; returns how many
    async fn purge_deleted(&self, _older_than_days: u32) -> Result<usize> {
        Ok(0)
    }

    /// Delete every memory carrying a tag; returns `(count, message)`
    async fn delete_by_tag(&self, tag: &str) -> Result<(usize, String)>;

    /// Delete memories matching ANY of the tags; returns
    /// `(count, message, deleted_hashes)`
    async fn delete_by_tags(&self, tags: &[String]) -> Result<(usize, String, Vec<String>)> {
        if tags.is_empty() {
            return Ok((0, "No tags provided".to_string(), vec![]));
        }
        let mut total = 0usize;
        let mut errors = Vec::new();
        for tag in tags {
            match self.delete_by_tag(tag).await {
                Ok((count, _)) => total += count,
                Err(e) => errors.push(format!("{tag}: {e}")),
            }
        }
        let message = if errors.is_empty() {
            format!("Deleted {total} memories across {} tag(s)", tags.len())
        } else {
            format!(
                "Deleted {total} memories with partial failures: {}",
                errors.join("; ")
            )
        };
        Ok((total, message, vec![]))
    }

    /// Delete memories created inside `[start, end]`, optionally tag-scoped
    async fn delete_by_timeframe(
        &self,
        _start: f64,
        _end: f64,
        _tag: Option<&str>,
    ) -> Result<(usize, String)> {
        Err(StorageError::Unsupported("delete_by_timeframe"))
    }

    /// Delete memories created before the timestamp, optionally tag-scoped
    async fn delete_before_date(&self, _before: f64, _tag: Option<&str>) -> Result<(usize, String)> {
        Err(StorageError::Unsupported("delete_before_date"))
    }

    /// Remove duplicate rows sharing a content hash
    async fn cleanup_duplicates(&self) -> Result<(usize, String)>;

    /// Mutate tags/type/metadata only. Content, hash, and `created_at` are
    /// immutable; `updated_at` is always refreshed.
    async fn update_memory_metadata(
        &self,
        content_hash: &str,
        updates: &MemoryUpdates,
        preserve_timestamps: bool,
    ) -> Result<(bool, String)>;

    /// Apply a memory's tags/type/metadata as an update by hash
    async fn update_memory(&self, memory: &Memory) -> Result<bool> {
        let updates = MemoryUpdates {
            tags: Some(memory.tags.clone()),
            memory_type: memory.memory_type.clone(),
            metadata: Some(memory.metadata.clone()),
        };
        let (ok, _) = self
            .update_memory_metadata(&memory.content_hash, &updates, true)
            .await?;
        Ok(ok)
    }

    /// Batch update. The default fans out; concrete backends override with
    /// one transaction.
    async fn update_memories_batch(&self, memories: &[Memory]) -> Result<Vec<bool>> {
        let pending = memories.iter().map(|m| self.update_memory(m));
        let results = futures::future::join_all(pending).await;
        Ok(results.into_iter().map(|r| r.unwrap_or(false)).collect())
    }

    /// O(1) lookup by content hash (live memories only)
    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>>;

    /// Exact content string match
    async fn get_by_exact_content(&self, content: &str) -> Result<Vec<Memory>>;

    /// All memories, newest first, with paging and optional type/tag filters
    async fn get_all_memories(
        &self,
        limit: Option<usize>,
        offset: usize,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<Vec<Memory>>;

    /// Efficient COUNT with the same filters as [`Self::get_all_memories`]
    async fn count_all_memories(
        &self,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<usize>;

    /// Cursor-paged enumeration, newest first. The cursor is the oldest
    /// `created_at` observed so far; passing it back resumes strictly older.
    /// Remote backends override this to avoid deep-OFFSET limitations.
    async fn get_all_memories_cursor(
        &self,
        limit: usize,
        cursor: Option<f64>,
    ) -> Result<Vec<Memory>> {
        let all = self.get_all_memories(None, 0, None, None).await?;
        Ok(all
            .into_iter()
            .filter(|m| cursor.is_none_or(|c| m.created_at < c))
            .take(limit)
            .collect())
    }

    /// Count memories matching any of the tags
    async fn count_memories_by_tag(&self, tags: &[String]) -> Result<usize> {
        Ok(self.search_by_tag(tags, None).await?.len())
    }

    /// Memories created inside the inclusive `[start, end]` range
    async fn get_memories_by_time_range(&self, start: f64, end: f64) -> Result<Vec<Memory>>;

    /// Creation timestamps only, newest first; avoids loading full rows
    async fn get_memory_timestamps(&self, days: Option<u32>) -> Result<Vec<f64>> {
        let memories = self.get_recent_memories(5000).await?;
        let cutoff = days.map(|d| crate::memory::now_timestamp() - f64::from(d) * 86_400.0);
        let mut timestamps: Vec<f64> = memories
            .into_iter()
            .map(|m| m.created_at)
            .filter(|ts| cutoff.is_none_or(|c| *ts >= c))
            .collect();
        timestamps.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        Ok(timestamps)
    }

    /// Backend statistics for the consumer contract
    async fn get_stats(&self) -> Result<StorageStats>;

    /// All distinct tags
    async fn get_all_tags(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }

    /// All distinct tags with usage counts
    async fn get_all_tags_with_counts(&self) -> Result<Vec<TagCount>> {
        Ok(vec![])
    }

    /// The N most recent memories
    async fn get_recent_memories(&self, _n: usize) -> Result<Vec<Memory>> {
        Ok(vec![])
    }

    /// Association-edge counts per memory hash (decay connection boost input)
    async fn get_memory_connections(&self) -> Result<HashMap<String, usize>> {
        Ok(HashMap::new())
    }

    /// Last-access timestamps per memory hash (decay access boost input)
    async fn get_access_patterns(&self) -> Result<HashMap<String, f64>> {
        Ok(HashMap::new())
    }

    /// Unified search across modes and filters.
    ///
    /// Validation happens before any I/O; filters apply in the order
    /// base search → time → tags → limit, with the time predicate pushed
    /// into the backend whenever the request is time-only.
    async fn search_memories(&self, request: &SearchRequest) -> Result<SearchResponse> {
        if !(0.0..=1.0).contains(&request.quality_boost) {
            return Ok(SearchResponse::rejected(
                request,
                format!(
                    "Invalid quality_boost: {}. Must be 0.0-1.0",
                    request.quality_boost
                ),
            ));
        }
        let limit = if request.limit == 0 { 10 } else { request.limit };

        // Resolve the time window: natural-language expression wins over
        // explicit after/before dates.
        let mut start_time: Option<f64> = None;
        let mut end_time: Option<f64> = None;
        if let Some(expr) = &request.time_expr {
            match parse_time_expression(expr) {
                Ok((start, end)) => {
                    start_time = start;
                    end_time = end;
                }
                Err(e) => return Ok(SearchResponse::rejected(request, e.to_string())),
            }
        } else {
            if let Some(after) = &request.after {
                match parse_iso_date(after) {
                    Ok(ts) => start_time = Some(ts),
                    Err(e) => return Ok(SearchResponse::rejected(request, e)),
                }
            }
            if let Some(before) = &request.before {
                match parse_iso_date(before) {
                    Ok(ts) => end_time = Some(ts),
                    Err(e) => return Ok(SearchResponse::rejected(request, e)),
                }
            }
        }

        let has_time = start_time.is_some() || end_time.is_some();
        let mut pre_filter_count = 0usize;

        // Base search per mode
        let mut results: Vec<MemoryQueryResult> = match request.mode {
            SearchMode::Exact => {
                let Some(query) = request.query.as_deref() else {
                    return Ok(SearchResponse::rejected(request, "query required for exact mode"));
                };
                let matched = self.get_by_exact_content(query).await?;
                pre_filter_count = matched.len();
                matched
                    .into_iter()
                    .map(|m| MemoryQueryResult::new(m, 1.0))
                    .collect()
            }
            SearchMode::Semantic | SearchMode::Hybrid => {
                if request.query.is_none() && !has_time && request.tags.is_empty() {
                    return Ok(SearchResponse::rejected(
                        request,
                        "At least one filter required (query, time_expr, after, before, or tags)",
                    ));
                }

                if let Some(query) = request.query.as_deref() {
                    let fetch_limit =
                        if request.quality_boost > 0.0 && request.mode == SearchMode::Hybrid {
                            limit * 3
                        } else {
                            limit
                        };
                    let fetched = match request.mode {
                        SearchMode::Hybrid => self.retrieve_hybrid(query, fetch_limit).await?,
                        _ if request.quality_boost > 0.0 => {
                            self.retrieve_with_quality_boost(
                                query,
                                fetch_limit,
                                request.quality_boost,
                            )
                            .await?
                        }
                        _ => self.retrieve(query, fetch_limit).await?,
                    };
                    pre_filter_count = fetched.len();
                    fetched
                } else if has_time && request.tags.is_empty() {
                    // Time-only: push the range predicate down to the backend
                    let st = start_time.unwrap_or(0.0);
                    let et = end_time.unwrap_or_else(crate::memory::now_timestamp);
                    let memories = self.get_memories_by_time_range(st, et).await?;
                    pre_filter_count = memories.len();
                    memories
                        .into_iter()
                        .map(|m| MemoryQueryResult::new(m, 0.5))
                        .collect()
                } else if !request.tags.is_empty() {
                    // Tag-base search with the time bound applied in-backend
                    let memories = self.search_by_tag(&request.tags, start_time).await?;
                    pre_filter_count = memories.len();
                    memories
                        .into_iter()
                        .map(|m| MemoryQueryResult::new(m, 0.5))
                        .collect()
                } else {
                    let memories = self.get_all_memories(None, 0, None, None).await?;
                    pre_filter_count = memories.len();
                    memories
                        .into_iter()
                        .map(|m| MemoryQueryResult::new(m, 0.5))
                        .collect()
                }
            }
        };

        // Time filter (for paths where the backend could not express it)
        if has_time {
            results.retain(|r| {
                let ts = r.memory.created_at;
                start_time.is_none_or(|s| ts >= s) && end_time.is_none_or(|e| ts <= e)
            });
        }

        // Tag filter (ANY match)
        if !request.tags.is_empty() {
            results.retain(|r| request.tags.iter().any(|t| r.memory.tags.contains(t)));
        }

        results.truncate(limit);
        let post_filter_count = results.len();

        let debug = request.include_debug.then(|| SearchDebug {
            time_expr: request.time_expr.clone(),
            start_timestamp: start_time,
            end_timestamp: end_time,
            tag_filter: request.tags.clone(),
            quality_boost: request.quality_boost,
            pre_filter_count,
            post_filter_count,
            limit,
        });

        Ok(SearchResponse {
            total: results.len(),
            memories: results,
            query: request.query.clone(),
            mode: request.mode,
            error: None,
            debug,
        })
    }

    /// Unified delete with flexible filtering.
    ///
    /// An empty filter set is rejected to prevent accidental mass deletion;
    /// `dry_run` previews the affected hashes without mutating.
    async fn delete_memories(&self, request: &DeleteRequest) -> Result<DeleteOutcome> {
        // Case 1: single hash (other filters ignored)
        if let Some(hash) = &request.content_hash {
            if request.dry_run {
                return Ok(match self.get_by_hash(hash).await? {
                    Some(_) => DeleteOutcome {
                        success: true,
                        deleted_count: 1,
                        deleted_hashes: vec![hash.clone()],
                        dry_run: true,
                        message: format!("Would delete 1 memory with hash: {hash}"),
                        error: None,
                    },
                    None => DeleteOutcome::rejected(true, format!("Memory not found: {hash}")),
                });
            }
            let (ok, message) = self.delete(hash).await?;
            return Ok(DeleteOutcome {
                success: ok,
                deleted_count: usize::from(ok),
                deleted_hashes: if ok { vec![hash.clone()] } else { vec![] },
                dry_run: false,
                message: message.clone(),
                error: (!ok).then_some(message),
            });
        }

        // Case 2: no filters - refuse
        if request.tags.is_empty() && request.before.is_none() && request.after.is_none() {
            return Ok(DeleteOutcome::rejected(
                request.dry_run,
                "At least one filter required (content_hash, tags, before, or after)",
            ));
        }

        let before_ts = match &request.before {
            Some(d) => match parse_iso_date(d) {
                Ok(ts) => Some(ts),
                Err(e) => return Ok(DeleteOutcome::rejected(request.dry_run, e)),
            },
            None => None,
        };
        let after_ts = match &request.after {
            Some(d) => match parse_iso_date(d) {
                Ok(ts) => Some(ts),
                Err(e) => return Ok(DeleteOutcome::rejected(request.dry_run, e)),
            },
            None => None,
        };

        // Optimized path: tag-only ANY-match deletion in one backend call
        if !request.tags.is_empty()
            && before_ts.is_none()
            && after_ts.is_none()
            && request.tag_match == TagMatch::Any
            && !request.dry_run
        {
            let (count, message, deleted_hashes) = self.delete_by_tags(&request.tags).await?;
            return Ok(DeleteOutcome {
                success: count > 0,
                deleted_count: count,
                deleted_hashes,
                dry_run: false,
                message,
                error: None,
            });
        }

        // Collect candidates, pushing the time predicate down when possible
        let candidates: Vec<Memory> = if request.tags.is_empty() {
            let st = after_ts.unwrap_or(0.0);
            let et = before_ts.unwrap_or_else(crate::memory::now_timestamp);
            self.get_memories_by_time_range(st, et).await?
        } else {
            let matched = self
                .search_by_tags(&request.tags, request.tag_match, after_ts, before_ts)
                .await?;
            matched
        };

        if request.dry_run {
            let deleted_hashes: Vec<String> =
                candidates.iter().map(|m| m.content_hash.clone()).collect();
            return Ok(DeleteOutcome {
                success: true,
                deleted_count: deleted_hashes.len(),
                message: format!("Would delete {} memories", deleted_hashes.len()),
                deleted_hashes,
                dry_run: true,
                error: None,
            });
        }

        let mut deleted_count = 0usize;
        let mut deleted_hashes = Vec::new();
        let mut errors = Vec::new();
        for memory in &candidates {
            match self.delete(&memory.content_hash).await {
                Ok((true, _)) => {
                    deleted_count += 1;
                    deleted_hashes.push(memory.content_hash.clone());
                }
                Ok((false, msg)) => errors.push(format!("{}: {msg}", memory.content_hash)),
                Err(e) => errors.push(format!("{}: {e}", memory.content_hash)),
            }
        }

        Ok(if errors.is_empty() {
            DeleteOutcome {
                success: true,
                deleted_count,
                deleted_hashes,
                dry_run: false,
                message: format!("Successfully deleted {deleted_count} memories"),
                error: None,
            }
        } else {
            let mut summary = errors[..errors.len().min(3)].join("; ");
            if errors.len() > 3 {
                summary.push_str(&format!(" (+{} more errors)", errors.len() - 3));
            }
            DeleteOutcome {
                success: deleted_count > 0,
                deleted_count,
                deleted_hashes,
                dry_run: false,
                message: format!(
                    "Deleted {deleted_count} memories with {} failures",
                    errors.len()
                ),
                error: Some(summary),
            }
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
