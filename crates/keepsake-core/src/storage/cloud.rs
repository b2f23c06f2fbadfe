//! Cloud secondary backend
//!
//! HTTP client over three logical services: a vector index, a relational
//! store (SQL over HTTP, D1-style response envelopes), and an object store
//! for oversized content. The row schema mirrors the local primary plus a
//! `vector_id` column holding the vector service's handle.
//!
//! Retry policy: transient failures (timeouts, 5xx) back off exponentially
//! with jitter; provider limit errors are never retried and surface as
//! capacity warnings; other 4xx are dropped as permanent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};

use crate::config::CloudConfig;
use crate::embeddings::EmbeddingProvider;
use crate::memory::{iso_from_timestamp, now_timestamp, Memory, MemoryQueryResult, MetadataValue};
use crate::tags::{normalize_tags, parse_tags_field, serialize_tags, validate_tags};

use super::{
    MemoryStorage, MemoryUpdates, Result, StorageError, StorageStats, TagCount, TagMatch,
};

/// Columns the additive migration guarantees on the remote table
const MIGRATED_COLUMNS: &[&str] = &["tags", "deleted_at"];

/// Verification attempts after an ALTER, to ride out metadata propagation lag
const MIGRATION_VERIFY_ATTEMPTS: u32 = 5;

/// Delay between migration verification attempts
const MIGRATION_VERIFY_DELAY: Duration = Duration::from_millis(750);

// ============================================================================
// ERROR CLASSIFICATION
// ============================================================================

/// How a remote failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Capacity / payload limit: never retry, surface as a warning
    Limit,
    /// Timeout / 5xx / network: retry with backoff
    Transient,
    /// Other 4xx or malformed responses: drop
    Permanent,
}

/// Classify a failure from its HTTP status (when known) and message text
pub fn classify_error(status: Option<u16>, message: &str) -> ErrorClass {
    if let Some(status) = status {
        match status {
            413 | 507 => return ErrorClass::Limit,
            429 => return ErrorClass::Transient,
            500 | 502 | 503 | 504 => return ErrorClass::Transient,
            s if (400..500).contains(&s) => {
                // Fall through to keyword scan: some providers report quota
                // exhaustion as 400-level with a descriptive body
            }
            _ => {}
        }
    }

    let lower = message.to_lowercase();
    const LIMIT_TERMS: &[&str] = &[
        "limit exceeded",
        "quota exceeded",
        "too large",
        "insufficient storage",
        "capacity",
        "maximum",
    ];
    const TRANSIENT_TERMS: &[&str] = &[
        "timeout",
        "timed out",
        "connection",
        "network",
        "temporarily unavailable",
        "reset",
        "retry",
    ];

    if LIMIT_TERMS.iter().any(|t| lower.contains(t)) {
        return ErrorClass::Limit;
    }
    if TRANSIENT_TERMS.iter().any(|t| lower.contains(t)) {
        return ErrorClass::Transient;
    }
    ErrorClass::Permanent
}

// ============================================================================
// RESPONSE PARSING
// ============================================================================

/// Extract the result rows from a D1-style response envelope
fn parse_sql_rows(envelope: &Value) -> Result<Vec<Value>> {
    if !envelope
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        let detail = envelope
            .get("errors")
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(StorageError::Http(format!("SQL query failed: {detail}")));
    }
    Ok(envelope
        .pointer("/result/0/results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

/// Column names from a `PRAGMA table_info` response envelope
pub(crate) fn parse_columns(envelope: &Value) -> Option<BTreeSet<String>> {
    if !envelope
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return None;
    }
    let rows = envelope.pointer("/result/0/results")?.as_array()?;
    Some(
        rows.iter()
            .filter_map(|r| r.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect(),
    )
}

/// Which guaranteed columns are absent from an existing column set
pub(crate) fn missing_columns(existing: &BTreeSet<String>) -> Vec<&'static str> {
    MIGRATED_COLUMNS
        .iter()
        .filter(|c| !existing.contains(**c))
        .copied()
        .collect()
}

fn row_to_memory(row: &Value) -> Option<Memory> {
    let metadata: BTreeMap<String, MetadataValue> = row
        .get("metadata")
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    Some(Memory {
        content: row.get("content")?.as_str()?.to_string(),
        content_hash: row.get("content_hash")?.as_str()?.to_string(),
        tags: parse_tags_field(row.get("tags").and_then(Value::as_str).unwrap_or("")),
        memory_type: row
            .get("memory_type")
            .and_then(Value::as_str)
            .map(str::to_string),
        metadata,
        created_at: row.get("created_at")?.as_f64()?,
        created_at_iso: row
            .get("created_at_iso")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default(),
        updated_at: row
            .get("updated_at")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        updated_at_iso: row
            .get("updated_at_iso")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default(),
    })
}

// ============================================================================
// STORAGE
// ============================================================================

/// Cloud secondary backend
pub struct CloudStorage {
    config: CloudConfig,
    client: reqwest::Client,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl CloudStorage {
    /// Create a client; no network traffic until `initialize`
    pub fn new(config: CloudConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            embedder,
        }
    }

    fn sql_url(&self) -> String {
        format!(
            "{}/accounts/{}/d1/database/{}/query",
            self.config.base_url, self.config.account_id, self.config.database_id
        )
    }

    fn vector_url(&self, operation: &str) -> String {
        format!(
            "{}/accounts/{}/vectorize/indexes/{}/{operation}",
            self.config.base_url, self.config.account_id, self.config.vector_index
        )
    }

    fn object_url(&self, key: &str) -> Option<String> {
        self.config.object_bucket.as_ref().map(|bucket| {
            format!(
                "{}/accounts/{}/r2/buckets/{bucket}/objects/{key}",
                self.config.base_url, self.config.account_id
            )
        })
    }

    /// POST JSON with retry for transient failures
    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let mut attempt = 0u32;
        loop {
            let result = self
                .client
                .post(url)
                .bearer_auth(&self.config.api_token)
                .json(body)
                .send()
                .await;

            let (status, text) = match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    (Some(status), text)
                }
                Err(e) => (e.status().map(|s| s.as_u16()), e.to_string()),
            };

            if let Some(status) = status {
                if (200..300).contains(&status) {
                    return serde_json::from_str(&text).map_err(|e| {
                        StorageError::Http(format!("malformed response from {url}: {e}"))
                    });
                }
            }

            let class = classify_error(status, &text);
            match class {
                ErrorClass::Transient if attempt < self.config.max_retries => {
                    let base = self.config.base_delay.as_millis() as u64;
                    let backoff = base.saturating_mul(1u64 << attempt.min(16));
                    let jitter = rand::thread_rng().gen_range(0..=base.max(1));
                    let delay = Duration::from_millis(backoff + jitter);
                    tracing::warn!(
                        url,
                        attempt,
                        status = ?status,
                        delay_ms = delay.as_millis() as u64,
                        "transient cloud error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => {
                    return Err(StorageError::Http(format!(
                        "{url} failed ({:?}, {class:?}): {}",
                        status,
                        text.chars().take(300).collect::<String>()
                    )));
                }
            }
        }
    }

    /// Run a SQL statement against the relational service
    async fn sql(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        let body = json!({ "sql": sql, "params": params });
        let envelope = self.post_json(&self.sql_url(), &body).await?;
        parse_sql_rows(&envelope)
    }

    /// Column set of a remote table via a metadata query.
    /// Explicit introspection; branching on set membership replaces
    /// try/except-driven migration probing.
    async fn introspect_columns(&self, table: &str) -> Result<Option<BTreeSet<String>>> {
        let body = json!({ "sql": format!("PRAGMA table_info({table})"), "params": [] });
        let envelope = self.post_json(&self.sql_url(), &body).await?;
        if let Some(errors) = envelope.get("errors").and_then(Value::as_array) {
            let text = serde_json::to_string(errors).unwrap_or_default();
            if text.contains("no such table") {
                return Ok(None);
            }
        }
        Ok(parse_columns(&envelope))
    }

    /// Additive schema migration with retry-and-verify.
    ///
    /// Remote metadata can lag behind an ALTER; each added column is
    /// re-introspected and the ALTER retried until visible. After the
    /// attempt budget the error carries the manual workaround SQL.
    async fn migrate_schema(&self) -> Result<()> {
        let Some(existing) = self.introspect_columns("memories").await? else {
            // Fresh database: initialize() creates the table with all columns
            tracing::debug!("remote memories table absent, skipping migration");
            return Ok(());
        };

        for column in missing_columns(&existing) {
            let definition = match column {
                "tags" => "tags TEXT DEFAULT ''",
                "deleted_at" => "deleted_at REAL",
                other => {
                    return Err(StorageError::Init(format!(
                        "unknown migrated column: {other}"
                    )))
                }
            };
            let alter = format!("ALTER TABLE memories ADD COLUMN {definition}");

            let mut verified = false;
            for attempt in 0..MIGRATION_VERIFY_ATTEMPTS {
                match self.sql(&alter, vec![]).await {
                    Ok(_) => {}
                    Err(e) => {
                        // Concurrent migration or prior partial run
                        if e.to_string().to_lowercase().contains("duplicate column") {
                            verified = true;
                            break;
                        }
                        tracing::warn!(column, attempt, error = %e, "ALTER TABLE failed");
                    }
                }

                if let Some(columns) = self.introspect_columns("memories").await? {
                    if columns.contains(column) {
                        verified = true;
                        break;
                    }
                }
                tracing::warn!(
                    column,
                    attempt,
                    "column not yet visible after ALTER, waiting for metadata sync"
                );
                tokio::time::sleep(MIGRATION_VERIFY_DELAY).await;
            }

            if !verified {
                return Err(StorageError::Init(format!(
                    "Schema migration failed: column '{column}' not visible after \
                     {MIGRATION_VERIFY_ATTEMPTS} attempts. Run manually: {alter}"
                )));
            }
            tracing::info!(column, "remote schema column verified");
        }
        Ok(())
    }

    /// Move oversized content to the object store, returning its URI
    async fn offload_content(&self, memory: &Memory) -> Result<Option<String>> {
        if memory.content.len() < self.config.large_content_threshold {
            return Ok(None);
        }
        let Some(url) = self.object_url(&memory.content_hash) else {
            return Ok(None);
        };
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.config.api_token)
            .body(memory.content.clone())
            .send()
            .await
            .map_err(|e| StorageError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StorageError::Http(format!(
                "object store write failed: {}",
                response.status()
            )));
        }
        Ok(Some(format!("object://{}", memory.content_hash)))
    }

    /// Dereference an `object://` URI back into content
    async fn fetch_object(&self, content_hash: &str) -> Result<String> {
        let url = self.object_url(content_hash).ok_or_else(|| {
            StorageError::Init("object URI present but no bucket configured".into())
        })?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .map_err(|e| StorageError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StorageError::Http(format!(
                "object store read failed: {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| StorageError::Http(e.to_string()))
    }

    /// Resolve object-store indirection on a freshly parsed row
    async fn hydrate(&self, mut memory: Memory) -> Result<Memory> {
        if memory.content.starts_with("object://") {
            let hash = memory.content_hash.clone();
            memory.content = self.fetch_object(&hash).await?;
        }
        Ok(memory)
    }

    async fn rows_to_memories(&self, rows: Vec<Value>) -> Result<Vec<Memory>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(memory) = row_to_memory(row) {
                out.push(self.hydrate(memory).await?);
            }
        }
        Ok(out)
    }

    /// Current vector count on the secondary (capacity guard input)
    pub async fn vector_count(&self) -> Result<u64> {
        let rows = self
            .sql(
                "SELECT COUNT(*) AS n FROM memories WHERE deleted_at IS NULL",
                vec![],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    fn tag_predicate(tags: &[String], operation: TagMatch) -> (String, Vec<Value>) {
        let joiner = match operation {
            TagMatch::Any => " OR ",
            TagMatch::All => " AND ",
        };
        let clause = tags
            .iter()
            .map(|_| "(',' || tags || ',') LIKE ?")
            .collect::<Vec<_>>()
            .join(joiner);
        let params = tags.iter().map(|t| json!(format!("%,{t},%"))).collect();
        (format!("({clause})"), params)
    }
}

// ============================================================================
// TRAIT IMPLEMENTATION
// ============================================================================

#[async_trait]
impl MemoryStorage for CloudStorage {
    fn max_content_length(&self) -> Option<usize> {
        // Oversized content transparently moves to the object store
        None
    }

    fn supports_chunking(&self) -> bool {
        false
    }

    async fn initialize(&self) -> Result<()> {
        self.sql(
            "CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hash TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL,
                memory_type TEXT,
                tags TEXT DEFAULT '',
                metadata TEXT DEFAULT '{}',
                created_at REAL NOT NULL,
                created_at_iso TEXT,
                updated_at REAL,
                updated_at_iso TEXT,
                deleted_at REAL,
                vector_id TEXT
            )",
            vec![],
        )
        .await?;
        self.sql(
            "CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at)",
            vec![],
        )
        .await?;
        self.migrate_schema().await?;
        tracing::info!("cloud secondary initialized");
        Ok(())
    }

    async fn store(&self, memory: &Memory) -> Result<(bool, String)> {
        let tags = normalize_tags(&memory.tags);
        if let Err(msg) = validate_tags(&tags) {
            return Ok((false, msg));
        }

        let existing = self
            .sql(
                "SELECT content_hash, deleted_at FROM memories WHERE content_hash = ?",
                vec![json!(memory.content_hash)],
            )
            .await?;
        if let Some(row) = existing.first() {
            if row.get("deleted_at").and_then(Value::as_f64).is_some() {
                return Ok((
                    false,
                    "Memory was deleted on the secondary (tombstone active)".to_string(),
                ));
            }
            return Ok((false, "Duplicate content detected".to_string()));
        }

        let embedding = self.embedder.embed(&memory.content).await?;
        let vector_id = memory.content_hash.clone();
        self.post_json(
            &self.vector_url("upsert"),
            &json!({
                "vectors": [{
                    "id": vector_id,
                    "values": embedding.vector,
                    "metadata": { "content_hash": memory.content_hash },
                }]
            }),
        )
        .await?;

        let stored_content = match self.offload_content(memory).await? {
            Some(uri) => uri,
            None => memory.content.clone(),
        };
        let metadata_json = serde_json::to_string(&memory.metadata)?;
        self.sql(
            "INSERT INTO memories
             (content_hash, content, memory_type, tags, metadata,
              created_at, created_at_iso, updated_at, updated_at_iso, deleted_at, vector_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)",
            vec![
                json!(memory.content_hash),
                json!(stored_content),
                json!(memory.memory_type),
                json!(serialize_tags(&tags)),
                json!(metadata_json),
                json!(memory.created_at),
                json!(memory.created_at_iso),
                json!(memory.updated_at),
                json!(memory.updated_at_iso),
                json!(vector_id),
            ],
        )
        .await?;

        Ok((true, "Memory stored successfully".to_string()))
    }

    async fn retrieve(&self, query: &str, n_results: usize) -> Result<Vec<MemoryQueryResult>> {
        let embedding = self.embedder.embed(query).await?;
        let envelope = self
            .post_json(
                &self.vector_url("query"),
                &json!({ "vector": embedding.vector, "topK": n_results }),
            )
            .await?;

        let matches = envelope
            .pointer("/result/matches")
            .or_else(|| envelope.get("matches"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::with_capacity(matches.len());
        for entry in matches {
            let Some(id) = entry.get("id").and_then(Value::as_str) else {
                continue;
            };
            let score = entry
                .get("score")
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
                .clamp(0.0, 1.0);
            if let Some(memory) = self.get_by_hash(id).await? {
                results.push(MemoryQueryResult::new(memory, score));
            }
        }
        Ok(results)
    }

    async fn search_by_tag(&self, tags: &[String], time_start: Option<f64>) -> Result<Vec<Memory>> {
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
        let (clause, mut params) = Self::tag_predicate(tags, operation);
        let mut sql = format!("SELECT * FROM memories WHERE deleted_at IS NULL AND {clause}");
        if let Some(start) = time_start {
            sql.push_str(" AND created_at >= ?");
            params.push(json!(start));
        }
        if let Some(end) = time_end {
            sql.push_str(" AND created_at <= ?");
            params.push(json!(end));
        }
        sql.push_str(" ORDER BY created_at DESC");
        let rows = self.sql(&sql, params).await?;
        self.rows_to_memories(rows).await
    }

    async fn delete(&self, content_hash: &str) -> Result<(bool, String)> {
        let now = now_timestamp();
        let existing = self
            .sql(
                "SELECT content_hash FROM memories WHERE content_hash = ? AND deleted_at IS NULL",
                vec![json!(content_hash)],
            )
            .await?;
        if existing.is_empty() {
            return Ok((false, format!("Memory not found: {content_hash}")));
        }

        self.sql(
            "UPDATE memories SET deleted_at = ?, content = '', updated_at = ?, updated_at_iso = ?
             WHERE content_hash = ?",
            vec![
                json!(now),
                json!(now),
                json!(iso_from_timestamp(now)),
                json!(content_hash),
            ],
        )
        .await?;

        // Best effort: the row tombstone is authoritative
        if let Err(e) = self
            .post_json(
                &self.vector_url("delete_by_ids"),
                &json!({ "ids": [content_hash] }),
            )
            .await
        {
            tracing::warn!(hash = %content_hash, error = %e, "vector delete failed");
        }

        Ok((true, format!("Deleted memory {content_hash}")))
    }

    async fn is_deleted(&self, content_hash: &str) -> Result<bool> {
        let rows = self
            .sql(
                "SELECT 1 AS present FROM memories WHERE content_hash = ? AND deleted_at IS NOT NULL",
                vec![json!(content_hash)],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn purge_deleted(&self, older_than_days: u32) -> Result<usize> {
        let cutoff = now_timestamp() - f64::from(older_than_days) * 86_400.0;
        let rows = self
            .sql(
                "SELECT COUNT(*) AS n FROM memories WHERE deleted_at IS NOT NULL AND deleted_at < ?",
                vec![json!(cutoff)],
            )
            .await?;
        let count = rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        self.sql(
            "DELETE FROM memories WHERE deleted_at IS NOT NULL AND deleted_at < ?",
            vec![json!(cutoff)],
        )
        .await?;
        Ok(count)
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<(usize, String)> {
        let (count, message, _) = self
            .delete_by_tags(std::slice::from_ref(&tag.to_string()))
            .await?;
        Ok((count, message))
    }

    async fn delete_by_tags(&self, tags: &[String]) -> Result<(usize, String, Vec<String>)> {
        let doomed: Vec<String> = self
            .search_by_tags(tags, TagMatch::Any, None, None)
            .await?
            .into_iter()
            .map(|m| m.content_hash)
            .collect();
        let mut count = 0usize;
        for hash in &doomed {
            if self.delete(hash).await?.0 {
                count += 1;
            }
        }
        Ok((
            count,
            format!("Deleted {count} memories across {} tag(s)", tags.len()),
            doomed,
        ))
    }

    async fn cleanup_duplicates(&self) -> Result<(usize, String)> {
        let rows = self
            .sql(
                "DELETE FROM memories WHERE id NOT IN (
                     SELECT MIN(id) FROM memories GROUP BY content_hash
                 ) RETURNING content_hash",
                vec![],
            )
            .await?;
        let count = rows.len();
        Ok((count, format!("Removed {count} duplicate rows")))
    }

    async fn update_memory_metadata(
        &self,
        content_hash: &str,
        updates: &MemoryUpdates,
        preserve_timestamps: bool,
    ) -> Result<(bool, String)> {
        let Some(mut memory) = self.get_by_hash(content_hash).await? else {
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
        self.sql(
            "UPDATE memories SET tags = ?, memory_type = ?, metadata = ?,
                 created_at = ?, created_at_iso = ?, updated_at = ?, updated_at_iso = ?
             WHERE content_hash = ? AND deleted_at IS NULL",
            vec![
                json!(serialize_tags(&memory.tags)),
                json!(memory.memory_type),
                json!(serde_json::to_string(&memory.metadata)?),
                json!(created_at),
                json!(iso_from_timestamp(created_at)),
                json!(now.max(created_at)),
                json!(iso_from_timestamp(now.max(created_at))),
                json!(content_hash),
            ],
        )
        .await?;
        Ok((true, "Memory updated".to_string()))
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>> {
        let rows = self
            .sql(
                "SELECT * FROM memories WHERE content_hash = ? AND deleted_at IS NULL",
                vec![json!(content_hash)],
            )
            .await?;
        match rows.first().and_then(row_to_memory) {
            Some(memory) => Ok(Some(self.hydrate(memory).await?)),
            None => Ok(None),
        }
    }

    async fn get_by_exact_content(&self, content: &str) -> Result<Vec<Memory>> {
        let rows = self
            .sql(
                "SELECT * FROM memories WHERE content = ? AND deleted_at IS NULL",
                vec![json!(content)],
            )
            .await?;
        self.rows_to_memories(rows).await
    }

    async fn get_all_memories(
        &self,
        limit: Option<usize>,
        offset: usize,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<Vec<Memory>> {
        let mut sql = "SELECT * FROM memories WHERE deleted_at IS NULL".to_string();
        let mut params: Vec<Value> = vec![];
        if let Some(memory_type) = memory_type {
            sql.push_str(" AND memory_type = ?");
            params.push(json!(memory_type));
        }
        if let Some(tags) = tags {
            if !tags.is_empty() {
                let (clause, mut tag_params) = Self::tag_predicate(tags, TagMatch::Any);
                sql.push_str(&format!(" AND {clause}"));
                params.append(&mut tag_params);
            }
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
        params.push(json!(limit.map(|l| l as i64).unwrap_or(-1)));
        params.push(json!(offset as i64));
        let rows = self.sql(&sql, params).await?;
        self.rows_to_memories(rows).await
    }

    async fn count_all_memories(
        &self,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<usize> {
        let mut sql = "SELECT COUNT(*) AS n FROM memories WHERE deleted_at IS NULL".to_string();
        let mut params: Vec<Value> = vec![];
        if let Some(memory_type) = memory_type {
            sql.push_str(" AND memory_type = ?");
            params.push(json!(memory_type));
        }
        if let Some(tags) = tags {
            if !tags.is_empty() {
                let (clause, mut tag_params) = Self::tag_predicate(tags, TagMatch::Any);
                sql.push_str(&format!(" AND {clause}"));
                params.append(&mut tag_params);
            }
        }
        let rows = self.sql(&sql, params).await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    /// Cursor enumeration avoids the remote store's deep-OFFSET limits
    async fn get_all_memories_cursor(
        &self,
        limit: usize,
        cursor: Option<f64>,
    ) -> Result<Vec<Memory>> {
        let rows = match cursor {
            Some(cursor) => {
                self.sql(
                    "SELECT * FROM memories WHERE deleted_at IS NULL AND created_at < ?
                     ORDER BY created_at DESC LIMIT ?",
                    vec![json!(cursor), json!(limit as i64)],
                )
                .await?
            }
            None => {
                self.sql(
                    "SELECT * FROM memories WHERE deleted_at IS NULL
                     ORDER BY created_at DESC LIMIT ?",
                    vec![json!(limit as i64)],
                )
                .await?
            }
        };
        self.rows_to_memories(rows).await
    }

    async fn get_memories_by_time_range(&self, start: f64, end: f64) -> Result<Vec<Memory>> {
        let rows = self
            .sql(
                "SELECT * FROM memories
                 WHERE deleted_at IS NULL AND created_at >= ? AND created_at <= ?
                 ORDER BY created_at DESC",
                vec![json!(start), json!(end)],
            )
            .await?;
        self.rows_to_memories(rows).await
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let now = now_timestamp();
        let total = self.count_all_memories(None, None).await?;
        let week_rows = self
            .sql(
                "SELECT COUNT(*) AS n FROM memories WHERE deleted_at IS NULL AND created_at >= ?",
                vec![json!(now - 7.0 * 86_400.0)],
            )
            .await?;
        let month_rows = self
            .sql(
                "SELECT COUNT(*) AS n FROM memories WHERE deleted_at IS NULL AND created_at >= ?",
                vec![json!(now - 30.0 * 86_400.0)],
            )
            .await?;
        let count_of = |rows: &[Value]| {
            rows.first()
                .and_then(|r| r.get("n"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize
        };

        let tags = self.get_all_tags().await?;
        Ok(StorageStats {
            backend: "cloud".to_string(),
            total_memories: total,
            unique_tags: tags.len(),
            memories_this_week: count_of(&week_rows),
            memories_this_month: count_of(&month_rows),
            size_bytes: 0,
            sync_status: None,
            secondary_stats: None,
        })
    }

    async fn get_all_tags(&self) -> Result<Vec<String>> {
        let rows = self
            .sql(
                "SELECT tags FROM memories WHERE deleted_at IS NULL AND tags != ''",
                vec![],
            )
            .await?;
        let mut tags = BTreeSet::new();
        for row in rows {
            if let Some(field) = row.get("tags").and_then(Value::as_str) {
                tags.extend(parse_tags_field(field));
            }
        }
        Ok(tags.into_iter().collect())
    }

    async fn get_all_tags_with_counts(&self) -> Result<Vec<TagCount>> {
        let rows = self
            .sql(
                "SELECT tags FROM memories WHERE deleted_at IS NULL AND tags != ''",
                vec![],
            )
            .await?;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for row in rows {
            if let Some(field) = row.get("tags").and_then(Value::as_str) {
                for tag in parse_tags_field(field) {
                    *counts.entry(tag).or_default() += 1;
                }
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

    #[test]
    fn test_classify_limit_errors_never_retry() {
        assert_eq!(classify_error(Some(413), "payload too large"), ErrorClass::Limit);
        assert_eq!(classify_error(Some(507), ""), ErrorClass::Limit);
        assert_eq!(
            classify_error(Some(400), "vector quota exceeded for index"),
            ErrorClass::Limit
        );
        assert_eq!(
            classify_error(None, "Maximum metadata size reached"),
            ErrorClass::Limit
        );
    }

    #[test]
    fn test_classify_transient() {
        for status in [429, 500, 502, 503, 504] {
            assert_eq!(classify_error(Some(status), ""), ErrorClass::Transient);
        }
        assert_eq!(
            classify_error(None, "connection reset by peer"),
            ErrorClass::Transient
        );
        assert_eq!(classify_error(None, "request timed out"), ErrorClass::Transient);
    }

    #[test]
    fn test_classify_permanent() {
        assert_eq!(classify_error(Some(401), "unauthorized"), ErrorClass::Permanent);
        assert_eq!(classify_error(Some(404), "not found"), ErrorClass::Permanent);
        assert_eq!(classify_error(None, "malformed request"), ErrorClass::Permanent);
    }

    #[test]
    fn test_parse_columns_from_envelope() {
        let envelope = json!({
            "success": true,
            "result": [{
                "results": [
                    {"name": "id", "type": "INTEGER"},
                    {"name": "content_hash", "type": "TEXT"},
                    {"name": "content", "type": "TEXT"},
                    {"name": "created_at", "type": "REAL"},
                    {"name": "vector_id", "type": "TEXT"},
                ]
            }]
        });
        let columns = parse_columns(&envelope).unwrap();
        assert!(columns.contains("content_hash"));
        assert_eq!(missing_columns(&columns), vec!["tags", "deleted_at"]);
    }

    #[test]
    fn test_parse_columns_failure_envelope() {
        let envelope = json!({
            "success": false,
            "errors": [{"message": "no such table: memories"}]
        });
        assert!(parse_columns(&envelope).is_none());
    }

    #[test]
    fn test_missing_columns_idempotent_schema() {
        let columns: BTreeSet<String> = ["id", "content_hash", "tags", "deleted_at"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(missing_columns(&columns).is_empty());
    }

    #[test]
    fn test_partial_migration_detected() {
        let columns: BTreeSet<String> = ["id", "content_hash", "tags"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(missing_columns(&columns), vec!["deleted_at"]);
    }

    #[test]
    fn test_sql_row_parsing() {
        let row = json!({
            "content_hash": "abc123",
            "content": "remembered text",
            "memory_type": "note",
            "tags": "work,meeting",
            "metadata": "{\"quality_score\":0.4}",
            "created_at": 1_700_000_000.0,
            "created_at_iso": "2023-11-14T22:13:20Z",
            "updated_at": 1_700_000_100.0,
            "updated_at_iso": "2023-11-14T22:15:00Z",
        });
        let memory = row_to_memory(&row).unwrap();
        assert_eq!(memory.content_hash, "abc123");
        assert_eq!(memory.tags, vec!["work", "meeting"]);
        assert_eq!(memory.metadata_f64("quality_score"), Some(0.4));
    }

    #[test]
    fn test_sql_envelope_errors_surface() {
        let envelope = json!({"success": false, "errors": [{"message": "boom"}]});
        assert!(parse_sql_rows(&envelope).is_err());
        let ok = json!({"success": true, "result": [{"results": [{"a": 1}]}]});
        assert_eq!(parse_sql_rows(&ok).unwrap().len(), 1);
    }
}
