//! Embedded SQLite primary backend
//!
//! The authoritative fast path: a local file-based database holding memory
//! rows, blob embeddings, an FTS5 index for lexical/hybrid search, and the
//! association graph. A USearch HNSW index over the embeddings serves
//! semantic retrieval; cosine relevance is `1 - distance`, clamped to [0, 1].
//!
//! Separate reader/writer connections behind mutexes give interior
//! mutability, so the backend is `Send + Sync` and callers share it as
//! `Arc<SqliteStorage>` (no outer lock).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use uuid::Uuid;

use crate::config::SqliteConfig;
use crate::embeddings::{Embedding, EmbeddingProvider};
use crate::memory::{iso_from_timestamp, now_timestamp, Memory, MemoryQueryResult, MetadataValue};
use crate::ontology::RelationshipType;
use crate::search::sanitize_fts5_query;
use crate::split::split_content;
use crate::tags::{normalize_tags, parse_tags_field, serialize_tags, validate_tags};

#[cfg(feature = "vector-search")]
use crate::search::{linear_combination, min_max_normalize, VectorIndex};

use super::{
    MemoryStorage, MemoryUpdates, Result, StorageError, StorageStats, TagCount, TagMatch,
};

/// A stored association edge
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    /// Edge source memory hash
    pub source_hash: String,
    /// Edge target memory hash
    pub target_hash: String,
    /// Cosine similarity at discovery time
    pub similarity: f64,
    /// Typed connections, strongest inference first
    pub connection_types: Vec<RelationshipType>,
    /// How the edge was discovered
    pub discovery_method: Option<String>,
    /// When the edge was discovered (ISO-8601)
    pub discovery_date: Option<String>,
    /// Free edge metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, MetadataValue>,
}

// ============================================================================
// STORAGE
// ============================================================================

/// Embedded primary backend
pub struct SqliteStorage {
    config: SqliteConfig,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    embedder: Arc<dyn EmbeddingProvider>,
    #[cfg(feature = "vector-search")]
    vector_index: Mutex<VectorIndex>,
    /// LRU cache for query embeddings so repeated queries skip the model
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl SqliteStorage {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the database and rebuild the vector index
    pub fn new(config: SqliteConfig, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer_conn = Connection::open(&config.db_path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&config.db_path)?;
        Self::configure_connection(&reader_conn)?;

        #[cfg(feature = "vector-search")]
        let vector_index = VectorIndex::new(embedder.dimensions())
            .map_err(|e| StorageError::Init(format!("Failed to create vector index: {e}")))?;

        let storage = Self {
            config,
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            embedder,
            #[cfg(feature = "vector-search")]
            vector_index: Mutex::new(vector_index),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(100).expect("100 is non-zero"),
            )),
        };

        #[cfg(feature = "vector-search")]
        storage.load_embeddings_into_index()?;

        Ok(storage)
    }

    /// Database file path (used by the integrity monitor and backup service)
    pub fn db_path(&self) -> &Path {
        &self.config.db_path
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StorageError::Init("Writer lock poisoned".into()))
    }

    fn lock_reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StorageError::Init("Reader lock poisoned".into()))
    }

    /// Load persisted embeddings into the HNSW index at startup
    #[cfg(feature = "vector-search")]
    fn load_embeddings_into_index(&self) -> Result<()> {
        let rows: Vec<(String, Vec<u8>)> = {
            let reader = self.lock_reader()?;
            let mut stmt = reader.prepare(
                "SELECT e.memory_hash, e.embedding
                 FROM memory_embeddings e
                 JOIN memories m ON m.content_hash = e.memory_hash
                 WHERE m.deleted_at IS NULL",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        let mut index = self
            .vector_index
            .lock()
            .map_err(|_| StorageError::Init("Vector index lock poisoned".into()))?;
        for (hash, bytes) in rows {
            if let Some(embedding) = Embedding::from_bytes(&bytes) {
                if embedding.dimensions != index.dimensions() {
                    tracing::warn!(
                        hash = %hash,
                        got = embedding.dimensions,
                        expected = index.dimensions(),
                        "skipping embedding with stale dimensionality"
                    );
                    continue;
                }
                if let Err(e) = index.add(&hash, &embedding.vector) {
                    tracing::warn!(hash = %hash, error = %e, "failed to load embedding into index");
                }
            }
        }
        Ok(())
    }

    /// Embed a query, consulting the LRU cache first
    async fn query_embedding(&self, query: &str) -> Result<Vec<f32>> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(vector) = cache.get(query) {
                return Ok(vector.clone());
            }
        }
        let embedding = self.embedder.embed(query).await?;
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(query.to_string(), embedding.vector.clone());
        }
        Ok(embedding.vector)
    }

    fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
        let tags_field: String = row.get("tags")?;
        let metadata_json: String = row.get("metadata")?;
        let metadata: BTreeMap<String, MetadataValue> =
            serde_json::from_str(&metadata_json).unwrap_or_default();

        Ok(Memory {
            content: row.get("content")?,
            content_hash: row.get("content_hash")?,
            tags: parse_tags_field(&tags_field),
            memory_type: row.get("memory_type")?,
            metadata,
            created_at: row.get("created_at")?,
            created_at_iso: row.get("created_at_iso")?,
            updated_at: row.get("updated_at")?,
            updated_at_iso: row.get("updated_at_iso")?,
        })
    }

    fn get_by_hash_sync(&self, content_hash: &str) -> Result<Option<Memory>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM memories WHERE content_hash = ?1 AND deleted_at IS NULL",
        )?;
        Ok(stmt
            .query_row(params![content_hash], Self::row_to_memory)
            .optional()?)
    }

    /// Insert a memory row plus its embedding inside an open transaction.
    /// Returns the duplicate outcome instead of aborting the transaction.
    fn insert_row(
        conn: &Connection,
        memory: &Memory,
        tags: &[String],
        embedding: Option<&Embedding>,
        model: &str,
    ) -> Result<(bool, String)> {
        let tombstoned: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM memories WHERE content_hash = ?1 AND deleted_at IS NOT NULL)",
                params![memory.content_hash],
                |row| row.get(0),
            )?;
        if tombstoned {
            return Ok((
                false,
                "Memory was deleted on this device (tombstone active)".to_string(),
            ));
        }

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM memories WHERE content_hash = ?1)",
            params![memory.content_hash],
            |row| row.get(0),
        )?;
        if exists {
            return Ok((false, "Duplicate content detected".to_string()));
        }

        let metadata_json = serde_json::to_string(&memory.metadata)?;
        conn.execute(
            "INSERT INTO memories (
                content_hash, content, memory_type, tags, metadata,
                created_at, created_at_iso, updated_at, updated_at_iso, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)",
            params![
                memory.content_hash,
                memory.content,
                memory.memory_type,
                serialize_tags(tags),
                metadata_json,
                memory.created_at,
                memory.created_at_iso,
                memory.updated_at,
                memory.updated_at_iso,
            ],
        )?;

        if let Some(embedding) = embedding {
            conn.execute(
                "INSERT OR REPLACE INTO memory_embeddings
                 (memory_hash, embedding, dimensions, model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    memory.content_hash,
                    embedding.to_bytes(),
                    embedding.dimensions as i64,
                    model,
                    iso_from_timestamp(now_timestamp()),
                ],
            )?;
        }

        Ok((true, "Memory stored successfully".to_string()))
    }

    #[cfg(feature = "vector-search")]
    fn index_add(&self, hash: &str, embedding: &Embedding) {
        if let Ok(mut index) = self.vector_index.lock() {
            if let Err(e) = index.add(hash, &embedding.vector) {
                tracing::warn!(hash = %hash, error = %e, "vector index add failed");
            }
        }
    }

    #[cfg(feature = "vector-search")]
    fn index_remove(&self, hash: &str) {
        if let Ok(mut index) = self.vector_index.lock() {
            let _ = index.remove(hash);
        }
    }

    #[cfg(not(feature = "vector-search"))]
    fn index_add(&self, _hash: &str, _embedding: &Embedding) {}

    #[cfg(not(feature = "vector-search"))]
    fn index_remove(&self, _hash: &str) {}

    /// Store oversized content as sibling chunks, all-or-nothing
    async fn store_chunked(&self, memory: &Memory, max: usize) -> Result<(bool, String)> {
        let chunks = split_content(
            &memory.content,
            max,
            true,
            self.config.split_overlap,
        )
        .map_err(|e| StorageError::Init(e.to_string()))?;

        let chunk_total = chunks.len();
        let source_hash = memory.content_hash.clone();
        let source_id = Uuid::new_v4().to_string();

        let mut siblings = Vec::with_capacity(chunk_total);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut sibling = Memory::new(chunk, memory.tags.clone(), memory.memory_type.clone());
            sibling.created_at = memory.created_at;
            sibling.created_at_iso = memory.created_at_iso.clone();
            sibling.updated_at = memory.updated_at;
            sibling.updated_at_iso = memory.updated_at_iso.clone();
            sibling.metadata = memory.metadata.clone();
            sibling
                .metadata
                .insert("chunk_index".into(), (i as i64).into());
            sibling
                .metadata
                .insert("chunk_total".into(), (chunk_total as i64).into());
            sibling
                .metadata
                .insert("source_id".into(), source_id.clone().into());
            sibling
                .metadata
                .insert("source_hash".into(), source_hash.clone().into());
            siblings.push(sibling);
        }

        let mut embeddings = Vec::with_capacity(siblings.len());
        for sibling in &siblings {
            embeddings.push(self.embedder.embed(&sibling.content).await.ok());
        }

        let tags = normalize_tags(&memory.tags);
        let model = self.embedder.model_name().to_string();
        let mut stored = 0usize;
        {
            let mut writer = self.lock_writer()?;
            let tx = writer.transaction()?;
            for (sibling, embedding) in siblings.iter().zip(&embeddings) {
                let (ok, message) =
                    Self::insert_row(&tx, sibling, &tags, embedding.as_ref(), &model)?;
                if !ok {
                    // All-or-nothing: one duplicate sibling rolls back the
                    // whole group (the dropped transaction aborts)
                    return Ok((false, format!("Chunked store aborted: {message}")));
                }
                stored += 1;
            }
            tx.commit()?;
        }

        for (sibling, embedding) in siblings.iter().zip(&embeddings) {
            if let Some(embedding) = embedding {
                self.index_add(&sibling.content_hash, embedding);
            }
        }

        tracing::info!(
            chunks = stored,
            source = %source_hash,
            "stored oversized content as sibling chunks"
        );
        Ok((
            true,
            format!("Split content into {stored} chunks (source {source_hash})"),
        ))
    }

    fn record_access(&self, hashes: &[String], access_type: &str) {
        if hashes.is_empty() {
            return;
        }
        let now = now_timestamp();
        if let Ok(writer) = self.lock_writer() {
            for hash in hashes {
                let _ = writer.execute(
                    "INSERT INTO memory_access_log (memory_hash, access_type, accessed_at)
                     VALUES (?1, ?2, ?3)",
                    params![hash, access_type, now],
                );
            }
        }
    }

    fn fetch_by_hashes(&self, hashes: &[String]) -> Result<HashMap<String, Memory>> {
        let mut out = HashMap::with_capacity(hashes.len());
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM memories WHERE content_hash = ?1 AND deleted_at IS NULL",
        )?;
        for hash in hashes {
            if let Some(memory) = stmt
                .query_row(params![hash], Self::row_to_memory)
                .optional()?
            {
                out.insert(hash.clone(), memory);
            }
        }
        Ok(out)
    }

    /// BM25 keyword scores from FTS5, negated so higher is better
    fn keyword_scores(&self, query: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(vec![]);
        }
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT m.content_hash, bm25(memories_fts) AS score
             FROM memories_fts
             JOIN memories m ON m.id = memories_fts.rowid
             WHERE memories_fts MATCH ?1 AND m.deleted_at IS NULL
             ORDER BY score
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![sanitized, limit as i64], |row| {
                let hash: String = row.get(0)?;
                let score: f64 = row.get(1)?;
                Ok((hash, -score))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ========================================================================
    // ASSOCIATIONS
    // ========================================================================

    /// Store (or replace) an association edge
    pub fn store_association(&self, association: &Association) -> Result<bool> {
        let types: Vec<&str> = association
            .connection_types
            .iter()
            .map(RelationshipType::as_str)
            .collect();
        let metadata_json = serde_json::to_string(&association.metadata)?;
        let writer = self.lock_writer()?;
        let rows = writer.execute(
            "INSERT OR REPLACE INTO associations
             (source_hash, target_hash, similarity, connection_types,
              discovery_method, discovery_date, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                association.source_hash,
                association.target_hash,
                association.similarity,
                types.join(","),
                association.discovery_method,
                association.discovery_date,
                metadata_json,
                now_timestamp(),
            ],
        )?;
        Ok(rows > 0)
    }

    /// Canonical (sorted) endpoint pairs of every stored association
    pub fn association_pairs(&self) -> Result<BTreeSet<(String, String)>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare("SELECT source_hash, target_hash FROM associations")?;
        let mut pairs = BTreeSet::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows.filter_map(|r| r.ok()) {
            let (a, b) = row;
            pairs.insert(if a <= b { (a, b) } else { (b, a) });
        }
        Ok(pairs)
    }

    /// Distribution of relationship types across stored edges
    pub fn relationship_type_distribution(&self) -> Result<BTreeMap<String, usize>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare("SELECT connection_types FROM associations")?;
        let mut distribution: BTreeMap<String, usize> = BTreeMap::new();
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for types in rows.filter_map(|r| r.ok()) {
            for t in types.split(',').filter(|t| !t.is_empty()) {
                *distribution.entry(t.to_string()).or_default() += 1;
            }
        }
        Ok(distribution)
    }

    /// All stored association edges
    pub fn get_associations(&self, limit: Option<usize>) -> Result<Vec<Association>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT source_hash, target_hash, similarity, connection_types,
                    discovery_method, discovery_date, metadata
             FROM associations ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit.map(|l| l as i64).unwrap_or(-1)], |row| {
                let types_field: String = row.get(3)?;
                let metadata_json: String = row.get(6)?;
                Ok(Association {
                    source_hash: row.get(0)?,
                    target_hash: row.get(1)?,
                    similarity: row.get(2)?,
                    connection_types: types_field
                        .split(',')
                        .filter_map(RelationshipType::parse)
                        .collect(),
                    discovery_method: row.get(4)?,
                    discovery_date: row.get(5)?,
                    metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Stored embedding for a memory, if present
    pub fn get_embedding(&self, content_hash: &str) -> Result<Option<Embedding>> {
        let reader = self.lock_reader()?;
        let bytes: Option<Vec<u8>> = reader
            .query_row(
                "SELECT embedding FROM memory_embeddings WHERE memory_hash = ?1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes.and_then(|b| Embedding::from_bytes(&b)))
    }

    /// Tag-filter WHERE fragment and its parameters
    fn tag_predicate(tags: &[String], operation: TagMatch) -> (String, Vec<rusqlite::types::Value>) {
        if tags.is_empty() {
            return ("1=1".to_string(), vec![]);
        }
        let joiner = match operation {
            TagMatch::Any => " OR ",
            TagMatch::All => " AND ",
        };
        let clause = tags
            .iter()
            .map(|_| "(',' || tags || ',') LIKE ?")
            .collect::<Vec<_>>()
            .join(joiner);
        let params = tags
            .iter()
            .map(|t| rusqlite::types::Value::Text(format!("%,{t},%")))
            .collect();
        (format!("({clause})"), params)
    }
}

// ============================================================================
// TRAIT IMPLEMENTATION
// ============================================================================

#[async_trait]
impl MemoryStorage for SqliteStorage {
    fn max_content_length(&self) -> Option<usize> {
        self.config.max_content_length
    }

    fn supports_chunking(&self) -> bool {
        true
    }

    async fn initialize(&self) -> Result<()> {
        let writer = self.lock_writer()?;
        super::migrations::apply_migrations(&writer)?;
        Ok(())
    }

    async fn store(&self, memory: &Memory) -> Result<(bool, String)> {
        let tags = normalize_tags(&memory.tags);
        if let Err(msg) = validate_tags(&tags) {
            return Ok((false, msg));
        }

        if let Some(max) = self.config.max_content_length {
            if memory.content.chars().count() > max {
                if self.config.auto_split {
                    return self.store_chunked(memory, max).await;
                }
                return Ok((
                    false,
                    format!("Content exceeds maximum length of {max} characters"),
                ));
            }
        }

        let embedding = match self.embedder.embed(&memory.content).await {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::warn!(hash = %memory.content_hash, error = %e, "embedding failed; storing without vector");
                None
            }
        };

        let outcome = {
            let writer = self.lock_writer()?;
            Self::insert_row(
                &writer,
                memory,
                &tags,
                embedding.as_ref(),
                self.embedder.model_name(),
            )?
        };

        if outcome.0 {
            if let Some(embedding) = &embedding {
                self.index_add(&memory.content_hash, embedding);
            }
        }
        Ok(outcome)
    }

    async fn store_batch(&self, memories: &[Memory]) -> Result<Vec<(bool, String)>> {
        if memories.is_empty() {
            return Ok(vec![]);
        }

        let mut prepared = Vec::with_capacity(memories.len());
        for memory in memories {
            let tags = normalize_tags(&memory.tags);
            if let Err(msg) = validate_tags(&tags) {
                prepared.push((memory, tags, None, Some(msg)));
                continue;
            }
            let embedding = self.embedder.embed(&memory.content).await.ok();
            prepared.push((memory, tags, embedding, None));
        }

        let model = self.embedder.model_name().to_string();
        let mut outcomes = Vec::with_capacity(memories.len());
        {
            let mut writer = self.lock_writer()?;
            let tx = writer.transaction()?;
            for (memory, tags, embedding, validation_error) in &prepared {
                if let Some(msg) = validation_error {
                    outcomes.push((false, msg.clone()));
                    continue;
                }
                // Per-row duplicates are recorded without aborting the batch
                let outcome = Self::insert_row(&tx, memory, tags, embedding.as_ref(), &model)?;
                outcomes.push(outcome);
            }
            tx.commit()?;
        }

        for ((memory, _, embedding, _), (ok, _)) in prepared.iter().zip(&outcomes) {
            if *ok {
                if let Some(embedding) = embedding {
                    self.index_add(&memory.content_hash, embedding);
                }
            }
        }
        Ok(outcomes)
    }

    #[cfg(feature = "vector-search")]
    async fn retrieve(&self, query: &str, n_results: usize) -> Result<Vec<MemoryQueryResult>> {
        let query_vector = self.query_embedding(query).await?;

        let hits: Vec<(String, f64)> = {
            let index = self
                .vector_index
                .lock()
                .map_err(|_| StorageError::Init("Vector index lock poisoned".into()))?;
            index.search(&query_vector, n_results)?
        };

        let hashes: Vec<String> = hits.iter().map(|(h, _)| h.clone()).collect();
        let mut rows = self.fetch_by_hashes(&hashes)?;

        let mut results = Vec::with_capacity(hits.len());
        for (hash, relevance) in hits {
            if let Some(memory) = rows.remove(&hash) {
                results.push(MemoryQueryResult::new(memory, relevance));
            }
        }
        self.record_access(&hashes, "search_hit");
        Ok(results)
    }

    #[cfg(not(feature = "vector-search"))]
    async fn retrieve(&self, query: &str, n_results: usize) -> Result<Vec<MemoryQueryResult>> {
        // Lexical fallback when HNSW is compiled out
        let scores = self.keyword_scores(query, n_results)?;
        let normalized = crate::search::min_max_normalize(&scores);
        let hashes: Vec<String> = normalized.iter().map(|(h, _)| h.clone()).collect();
        let mut rows = self.fetch_by_hashes(&hashes)?;
        let mut results = Vec::new();
        for (hash, score) in normalized {
            if let Some(memory) = rows.remove(&hash) {
                results.push(MemoryQueryResult::new(memory, score));
            }
        }
        self.record_access(&hashes, "search_hit");
        Ok(results)
    }

    #[cfg(feature = "vector-search")]
    async fn retrieve_hybrid(
        &self,
        query: &str,
        n_results: usize,
    ) -> Result<Vec<MemoryQueryResult>> {
        let pool = n_results.max(1) * 2;
        let query_vector = self.query_embedding(query).await?;

        let semantic: Vec<(String, f64)> = {
            let index = self
                .vector_index
                .lock()
                .map_err(|_| StorageError::Init("Vector index lock poisoned".into()))?;
            index.search(&query_vector, pool)?
        };
        let keyword = self.keyword_scores(query, pool)?;

        // Min-max normalize both distributions within the candidate pool
        let semantic_norm = min_max_normalize(&semantic);
        let keyword_norm = min_max_normalize(&keyword);
        let fused = linear_combination(
            &keyword_norm,
            &semantic_norm,
            self.config.hybrid_keyword_weight,
            self.config.hybrid_semantic_weight,
        );

        let hashes: Vec<String> = fused.iter().map(|(h, _)| h.clone()).collect();
        let rows = self.fetch_by_hashes(&hashes)?;

        let mut scored: Vec<(MemoryQueryResult, f64)> = fused
            .into_iter()
            .filter_map(|(hash, score)| {
                rows.get(&hash).map(|memory| {
                    let mut result = MemoryQueryResult::new(memory.clone(), score.clamp(0.0, 1.0));
                    result.debug("fusion", "keyword+semantic".into());
                    (result, memory.created_at)
                })
            })
            .collect();

        // Ties broken by recency
        scored.sort_by(|a, b| {
            b.0.relevance_score
                .partial_cmp(&a.0.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
        });

        let results: Vec<MemoryQueryResult> =
            scored.into_iter().map(|(r, _)| r).take(n_results).collect();
        self.record_access(
            &results
                .iter()
                .map(|r| r.memory.content_hash.clone())
                .collect::<Vec<_>>(),
            "search_hit",
        );
        Ok(results)
    }

    async fn search_by_tag(&self, tags: &[String], time_start: Option<f64>) -> Result<Vec<Memory>> {
        // Both predicates belong in SQL, never in a client post-filter
        self.search_by_tags(tags, TagMatch::Any, time_start, None)
            .await
    }

    async fn search_by_tags(
        &self,
        tags: &[String],
        operation: TagMatch,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> Result<Vec<Memory>> {
        if tags.is_empty() {
            return Ok(vec![]);
        }
        let (tag_clause, mut sql_params) = Self::tag_predicate(tags, operation);
        let mut sql = format!(
            "SELECT * FROM memories WHERE deleted_at IS NULL AND {tag_clause}"
        );
        if let Some(start) = time_start {
            sql.push_str(" AND created_at >= ?");
            sql_params.push(rusqlite::types::Value::Real(start));
        }
        if let Some(end) = time_end {
            sql.push_str(" AND created_at <= ?");
            sql_params.push(rusqlite::types::Value::Real(end));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(sql_params), Self::row_to_memory)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn search_by_tag_chronological(
        &self,
        tags: &[String],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Memory>> {
        if tags.is_empty() {
            return Ok(vec![]);
        }
        let (tag_clause, mut sql_params) = Self::tag_predicate(tags, TagMatch::Any);
        let sql = format!(
            "SELECT * FROM memories WHERE deleted_at IS NULL AND {tag_clause}
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        );
        sql_params.push(rusqlite::types::Value::Integer(
            limit.map(|l| l as i64).unwrap_or(-1),
        ));
        sql_params.push(rusqlite::types::Value::Integer(offset as i64));

        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(sql_params), Self::row_to_memory)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn delete(&self, content_hash: &str) -> Result<(bool, String)> {
        let now = now_timestamp();
        let changed = {
            let writer = self.lock_writer()?;
            let changed = writer.execute(
                "UPDATE memories
                 SET deleted_at = ?1, content = '', updated_at = ?1, updated_at_iso = ?2
                 WHERE content_hash = ?3 AND deleted_at IS NULL",
                params![now, iso_from_timestamp(now), content_hash],
            )?;
            if changed > 0 {
                writer.execute(
                    "DELETE FROM memory_embeddings WHERE memory_hash = ?1",
                    params![content_hash],
                )?;
            }
            changed
        };

        if changed > 0 {
            self.index_remove(content_hash);
            Ok((true, format!("Deleted memory {content_hash}")))
        } else {
            Ok((false, format!("Memory not found: {content_hash}")))
        }
    }

    async fn is_deleted(&self, content_hash: &str) -> Result<bool> {
        let reader = self.lock_reader()?;
        let exists: bool = reader.query_row(
            "SELECT EXISTS(SELECT 1 FROM memories WHERE content_hash = ?1 AND deleted_at IS NOT NULL)",
            params![content_hash],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    async fn purge_deleted(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = now_timestamp() - f64::from(older_than_days) * 86_400.0;
        let writer = self.lock_writer()?;
        let purged = writer.execute(
            "DELETE FROM memories WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
            params![cutoff],
        )?;
        Ok(purged)
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<(usize, String)> {
        let (count, message, _) = self.delete_by_tags(std::slice::from_ref(&tag.to_string())).await?;
        Ok((count, message))
    }

    async fn delete_by_tags(&self, tags: &[String]) -> Result<(usize, String, Vec<String>)> {
        if tags.is_empty() {
            return Ok((0, "No tags provided".to_string(), vec![]));
        }
        let doomed: Vec<String> = self
            .search_by_tags(tags, TagMatch::Any, None, None)
            .await?
            .into_iter()
            .map(|m| m.content_hash)
            .collect();

        let now = now_timestamp();
        let now_iso = iso_from_timestamp(now);
        {
            let mut writer = self.lock_writer()?;
            let tx = writer.transaction()?;
            for hash in &doomed {
                tx.execute(
                    "UPDATE memories
                     SET deleted_at = ?1, content = '', updated_at = ?1, updated_at_iso = ?2
                     WHERE content_hash = ?3 AND deleted_at IS NULL",
                    params![now, now_iso, hash],
                )?;
                tx.execute(
                    "DELETE FROM memory_embeddings WHERE memory_hash = ?1",
                    params![hash],
                )?;
            }
            tx.commit()?;
        }
        for hash in &doomed {
            self.index_remove(hash);
        }
        let count = doomed.len();
        Ok((
            count,
            format!("Deleted {count} memories across {} tag(s)", tags.len()),
            doomed,
        ))
    }

    async fn delete_by_timeframe(
        &self,
        start: f64,
        end: f64,
        tag: Option<&str>,
    ) -> Result<(usize, String)> {
        let candidates = match tag {
            Some(tag) => {
                self.search_by_tags(
                    std::slice::from_ref(&tag.to_string()),
                    TagMatch::Any,
                    Some(start),
                    Some(end),
                )
                .await?
            }
            None => self.get_memories_by_time_range(start, end).await?,
        };
        let mut count = 0usize;
        for memory in &candidates {
            if self.delete(&memory.content_hash).await?.0 {
                count += 1;
            }
        }
        Ok((count, format!("Deleted {count} memories in timeframe")))
    }

    async fn delete_before_date(&self, before: f64, tag: Option<&str>) -> Result<(usize, String)> {
        self.delete_by_timeframe(0.0, before - f64::EPSILON, tag)
            .await
    }

    async fn cleanup_duplicates(&self) -> Result<(usize, String)> {
        // Legacy databases without the UNIQUE constraint can carry duplicate
        // hashes; keep the oldest row of each group.
        let writer = self.lock_writer()?;
        let removed = writer.execute(
            "DELETE FROM memories WHERE id NOT IN (
                 SELECT MIN(id) FROM memories GROUP BY content_hash
             )",
            [],
        )?;
        Ok((
            removed,
            if removed == 0 {
                "No duplicates found".to_string()
            } else {
                format!("Removed {removed} duplicate rows")
            },
        ))
    }

    async fn update_memory_metadata(
        &self,
        content_hash: &str,
        updates: &MemoryUpdates,
        preserve_timestamps: bool,
    ) -> Result<(bool, String)> {
        let Some(mut memory) = self.get_by_hash_sync(content_hash)? else {
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

        let now = now_timestamp();
        let created_at = if preserve_timestamps {
            memory.created_at
        } else {
            now
        };
        let metadata_json = serde_json::to_string(&memory.metadata)?;

        let writer = self.lock_writer()?;
        writer.execute(
            "UPDATE memories
             SET tags = ?1, memory_type = ?2, metadata = ?3,
                 created_at = ?4, created_at_iso = ?5,
                 updated_at = ?6, updated_at_iso = ?7
             WHERE content_hash = ?8 AND deleted_at IS NULL",
            params![
                serialize_tags(&memory.tags),
                memory.memory_type,
                metadata_json,
                created_at,
                iso_from_timestamp(created_at),
                now.max(created_at),
                iso_from_timestamp(now.max(created_at)),
                content_hash,
            ],
        )?;
        Ok((true, "Memory updated".to_string()))
    }

    async fn update_memories_batch(&self, memories: &[Memory]) -> Result<Vec<bool>> {
        if memories.is_empty() {
            return Ok(vec![]);
        }
        let now = now_timestamp();
        let now_iso = iso_from_timestamp(now);
        let mut results = Vec::with_capacity(memories.len());
        let mut writer = self.lock_writer()?;
        let tx = writer.transaction()?;
        for memory in memories {
            let tags = normalize_tags(&memory.tags);
            if validate_tags(&tags).is_err() {
                results.push(false);
                continue;
            }
            let metadata_json = serde_json::to_string(&memory.metadata)?;
            let changed = tx.execute(
                "UPDATE memories
                 SET tags = ?1, memory_type = ?2, metadata = ?3,
                     updated_at = ?4, updated_at_iso = ?5
                 WHERE content_hash = ?6 AND deleted_at IS NULL",
                params![
                    serialize_tags(&tags),
                    memory.memory_type,
                    metadata_json,
                    now,
                    now_iso,
                    memory.content_hash,
                ],
            )?;
            results.push(changed > 0);
        }
        tx.commit()?;
        Ok(results)
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>> {
        self.get_by_hash_sync(content_hash)
    }

    async fn get_by_exact_content(&self, content: &str) -> Result<Vec<Memory>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM memories WHERE content = ?1 AND deleted_at IS NULL",
        )?;
        let rows: Vec<Memory> = stmt
            .query_map(params![content], Self::row_to_memory)?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(reader);
        self.record_access(
            &rows.iter().map(|m| m.content_hash.clone()).collect::<Vec<_>>(),
            "exact_hit",
        );
        Ok(rows)
    }

    async fn get_all_memories(
        &self,
        limit: Option<usize>,
        offset: usize,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<Vec<Memory>> {
        let mut sql = "SELECT * FROM memories WHERE deleted_at IS NULL".to_string();
        let mut sql_params: Vec<rusqlite::types::Value> = vec![];
        if let Some(memory_type) = memory_type {
            sql.push_str(" AND memory_type = ?");
            sql_params.push(rusqlite::types::Value::Text(memory_type.to_string()));
        }
        if let Some(tags) = tags {
            if !tags.is_empty() {
                let (clause, mut tag_params) = Self::tag_predicate(tags, TagMatch::Any);
                sql.push_str(&format!(" AND {clause}"));
                sql_params.append(&mut tag_params);
            }
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
        sql_params.push(rusqlite::types::Value::Integer(
            limit.map(|l| l as i64).unwrap_or(-1),
        ));
        sql_params.push(rusqlite::types::Value::Integer(offset as i64));

        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(sql_params), Self::row_to_memory)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn count_all_memories(
        &self,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<usize> {
        let mut sql = "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL".to_string();
        let mut sql_params: Vec<rusqlite::types::Value> = vec![];
        if let Some(memory_type) = memory_type {
            sql.push_str(" AND memory_type = ?");
            sql_params.push(rusqlite::types::Value::Text(memory_type.to_string()));
        }
        if let Some(tags) = tags {
            if !tags.is_empty() {
                let (clause, mut tag_params) = Self::tag_predicate(tags, TagMatch::Any);
                sql.push_str(&format!(" AND {clause}"));
                sql_params.append(&mut tag_params);
            }
        }
        let reader = self.lock_reader()?;
        let count: i64 = reader.query_row(&sql, params_from_iter(sql_params), |row| row.get(0))?;
        Ok(count as usize)
    }

    async fn get_all_memories_cursor(
        &self,
        limit: usize,
        cursor: Option<f64>,
    ) -> Result<Vec<Memory>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM memories
             WHERE deleted_at IS NULL AND (?1 IS NULL OR created_at < ?1)
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cursor, limit as i64], Self::row_to_memory)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn get_memories_by_time_range(&self, start: f64, end: f64) -> Result<Vec<Memory>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM memories
             WHERE deleted_at IS NULL AND created_at >= ?1 AND created_at <= ?2
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![start, end], Self::row_to_memory)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn get_memory_timestamps(&self, days: Option<u32>) -> Result<Vec<f64>> {
        let cutoff = days.map(|d| now_timestamp() - f64::from(d) * 86_400.0);
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT created_at FROM memories
             WHERE deleted_at IS NULL AND (?1 IS NULL OR created_at >= ?1)
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let now = now_timestamp();
        let week = now - 7.0 * 86_400.0;
        let month = now - 30.0 * 86_400.0;

        let (total, this_week, this_month, tag_fields) = {
            let reader = self.lock_reader()?;
            let total: i64 = reader.query_row(
                "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL",
                [],
                |row| row.get(0),
            )?;
            let this_week: i64 = reader.query_row(
                "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL AND created_at >= ?1",
                params![week],
                |row| row.get(0),
            )?;
            let this_month: i64 = reader.query_row(
                "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL AND created_at >= ?1",
                params![month],
                |row| row.get(0),
            )?;
            let mut stmt = reader.prepare(
                "SELECT tags FROM memories WHERE deleted_at IS NULL AND tags != ''",
            )?;
            let tag_fields: Vec<String> = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            (total, this_week, this_month, tag_fields)
        };

        let mut unique_tags = BTreeSet::new();
        for field in tag_fields {
            unique_tags.extend(parse_tags_field(&field));
        }

        let size_bytes = std::fs::metadata(&self.config.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StorageStats {
            backend: "sqlite".to_string(),
            total_memories: total as usize,
            unique_tags: unique_tags.len(),
            memories_this_week: this_week as usize,
            memories_this_month: this_month as usize,
            size_bytes,
            sync_status: None,
            secondary_stats: None,
        })
    }

    async fn get_all_tags(&self) -> Result<Vec<String>> {
        Ok(self
            .get_all_tags_with_counts()
            .await?
            .into_iter()
            .map(|tc| tc.tag)
            .collect())
    }

    async fn get_all_tags_with_counts(&self) -> Result<Vec<TagCount>> {
        let tag_fields: Vec<String> = {
            let reader = self.lock_reader()?;
            let mut stmt = reader.prepare(
                "SELECT tags FROM memories WHERE deleted_at IS NULL AND tags != ''",
            )?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for field in tag_fields {
            for tag in parse_tags_field(&field) {
                *counts.entry(tag).or_default() += 1;
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

    async fn get_memory_connections(&self) -> Result<HashMap<String, usize>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT hash, SUM(n) FROM (
                 SELECT source_hash AS hash, COUNT(*) AS n FROM associations GROUP BY source_hash
                 UNION ALL
                 SELECT target_hash AS hash, COUNT(*) AS n FROM associations GROUP BY target_hash
             ) GROUP BY hash",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    async fn get_access_patterns(&self) -> Result<HashMap<String, f64>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT memory_hash, MAX(accessed_at) FROM memory_access_log GROUP BY memory_hash",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

// ============================================================================
// TESTS
// ============================================================================
