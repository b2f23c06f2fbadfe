//! Memory record, metadata scalars, and content-hash identity.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// Current UTC time as seconds since epoch (float, microsecond precision)
pub fn now_timestamp() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Render a seconds-since-epoch float as an ISO-8601 UTC string
pub fn iso_from_timestamp(ts: f64) -> String {
    let secs = ts.trunc() as i64;
    let micros = ((ts - ts.trunc()) * 1_000_000.0).round() as u32;
    DateTime::<Utc>::from_timestamp(secs, micros * 1000)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an ISO-8601 string back into a seconds-since-epoch float
pub fn timestamp_from_iso(iso: &str) -> Option<f64> {
    DateTime::parse_from_rfc3339(iso)
        .ok()
        .map(|dt| {
            let dt = dt.with_timezone(&Utc);
            dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_micros()) / 1_000_000.0
        })
}

// ============================================================================
// CONTENT HASH
// ============================================================================

/// Deterministic SHA-256 content hash, stable across backends.
///
/// Content is trimmed before hashing so that trailing-whitespace variants of
/// the same text collapse to one identity.
pub fn generate_content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.trim().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

// ============================================================================
// METADATA VALUES
// ============================================================================

/// A metadata scalar: string, number, or boolean.
///
/// Metadata is the only heterogeneous surface in the model. Arbitrary nesting
/// is rejected on write; see [`MetadataValue::from_json`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Boolean flag
    Bool(bool),
    /// Numeric value (integers widen to f64)
    Number(f64),
    /// Free-form string
    String(String),
}

impl MetadataValue {
    /// Convert a JSON value into a metadata scalar, rejecting arrays/objects
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(MetadataValue::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(MetadataValue::Number),
            serde_json::Value::String(s) => Some(MetadataValue::String(s.clone())),
            _ => None,
        }
    }

    /// Numeric view (booleans and strings are not coerced)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String view
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean view
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Number(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Number(v as f64)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::String(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::String(v)
    }
}

/// Metadata map type used throughout the engine
pub type Metadata = BTreeMap<String, MetadataValue>;

// ============================================================================
// MEMORY
// ============================================================================

/// A stored memory.
///
/// Fields the engine relies on inside `metadata`: `importance_score`,
/// `quality_score`, `access_count`, `last_accessed_at`,
/// `last_consolidated_at`, `relevance_score`, `chunk_index`, `chunk_total`,
/// `source_id`, `source_hash`, `source_memory_hashes`, and the
/// `quality_boost_*` provenance group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// The text content (unit of retrieval)
    pub content: String,
    /// SHA-256 identity, stable across backends
    pub content_hash: String,
    /// Unordered set of short tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Memory type: a base ontology type or a `base/subtype` form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
    /// Free-form scalar metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, MetadataValue>,
    /// UTC seconds since epoch; set once at insert, never mutated
    pub created_at: f64,
    /// Redundant ISO-8601 view of `created_at`
    pub created_at_iso: String,
    /// Refreshed on every metadata mutation
    pub updated_at: f64,
    /// Redundant ISO-8601 view of `updated_at`
    pub updated_at_iso: String,
}

impl Memory {
    /// Create a new memory, computing its content hash and timestamps
    pub fn new(
        content: impl Into<String>,
        tags: Vec<String>,
        memory_type: Option<String>,
    ) -> Self {
        let content = content.into();
        let content_hash = generate_content_hash(&content);
        let now = now_timestamp();
        Self {
            content,
            content_hash,
            tags,
            memory_type,
            metadata: BTreeMap::new(),
            created_at: now,
            created_at_iso: iso_from_timestamp(now),
            updated_at: now,
            updated_at_iso: iso_from_timestamp(now),
        }
    }

    /// Builder-style metadata insertion
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override the creation timestamp (keeps the ISO view in sync)
    pub fn with_created_at(mut self, ts: f64) -> Self {
        self.created_at = ts;
        self.created_at_iso = iso_from_timestamp(ts);
        if self.updated_at < ts {
            self.updated_at = ts;
            self.updated_at_iso = iso_from_timestamp(ts);
        }
        self
    }

    /// Refresh `updated_at`, preserving the `updated_at >= created_at` invariant
    pub fn touch(&mut self) {
        let now = now_timestamp();
        self.updated_at = now.max(self.created_at);
        self.updated_at_iso = iso_from_timestamp(self.updated_at);
    }

    /// Numeric metadata field, if present
    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(MetadataValue::as_f64)
    }

    /// Quality score surfaced through metadata, clamped to [0, 1]
    pub fn quality_score(&self) -> f64 {
        self.metadata_f64("quality_score")
            .unwrap_or(0.0)
            .clamp(0.0, 1.0)
    }

    /// Base type of this memory's `base/subtype` form (or the type itself)
    pub fn base_type(&self) -> Option<&str> {
        self.memory_type
            .as_deref()
            .map(|t| t.split('/').next().unwrap_or(t))
    }

    /// Whether this memory is part of a chunked sibling group
    pub fn is_chunk(&self) -> bool {
        self.metadata.contains_key("chunk_index") && self.metadata.contains_key("chunk_total")
    }
}

/// A retrieval result with its relevance score and optional debug breakdown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryQueryResult {
    /// The matched memory
    pub memory: Memory,
    /// Relevance in [0, 1]; cosine-based for semantic matches
    pub relevance_score: f64,
    /// Per-result scoring components for observability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<BTreeMap<String, serde_json::Value>>,
}

impl MemoryQueryResult {
    /// Wrap a memory with a relevance score and no debug info
    pub fn new(memory: Memory, relevance_score: f64) -> Self {
        Self {
            memory,
            relevance_score,
            debug_info: None,
        }
    }

    /// Record a debug component on this result
    pub fn debug(&mut self, key: &str, value: serde_json::Value) {
        self.debug_info
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let a = generate_content_hash("meeting notes");
        let b = generate_content_hash("meeting notes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_normalizes_whitespace() {
        assert_eq!(
            generate_content_hash("meeting notes"),
            generate_content_hash("  meeting notes \n")
        );
        assert_ne!(
            generate_content_hash("meeting notes"),
            generate_content_hash("meeting  notes")
        );
    }

    #[test]
    fn test_new_memory_invariants() {
        let m = Memory::new("hello", vec!["work".into()], Some("note".into()));
        assert_eq!(m.content_hash, generate_content_hash("hello"));
        assert!(m.updated_at >= m.created_at);
        assert_eq!(m.created_at_iso, iso_from_timestamp(m.created_at));
    }

    #[test]
    fn test_touch_advances_updated_at() {
        let mut m = Memory::new("hello", vec![], None);
        let before = m.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        m.touch();
        assert!(m.updated_at >= before);
        assert!(m.updated_at >= m.created_at);
        assert_eq!(m.updated_at_iso, iso_from_timestamp(m.updated_at));
    }

    #[test]
    fn test_iso_round_trip() {
        let ts = 1_700_000_000.25_f64;
        let iso = iso_from_timestamp(ts);
        let back = timestamp_from_iso(&iso).unwrap();
        assert!((back - ts).abs() < 0.001);
    }

    #[test]
    fn test_metadata_rejects_nesting() {
        let nested = serde_json::json!({"a": 1});
        assert!(MetadataValue::from_json(&nested).is_none());
        let arr = serde_json::json!([1, 2]);
        assert!(MetadataValue::from_json(&arr).is_none());
        let num = serde_json::json!(0.7);
        assert_eq!(
            MetadataValue::from_json(&num),
            Some(MetadataValue::Number(0.7))
        );
    }

    #[test]
    fn test_quality_score_clamped() {
        let m = Memory::new("x", vec![], None).with_metadata("quality_score", 1.7);
        assert_eq!(m.quality_score(), 1.0);
        let m = Memory::new("y", vec![], None);
        assert_eq!(m.quality_score(), 0.0);
    }

    #[test]
    fn test_base_type() {
        let m = Memory::new("x", vec![], Some("learning/insight".into()));
        assert_eq!(m.base_type(), Some("learning"));
        let m = Memory::new("y", vec![], Some("observation".into()));
        assert_eq!(m.base_type(), Some("observation"));
    }

    #[test]
    fn test_untagged_metadata_serde() {
        let mut m = Memory::new("x", vec![], None);
        m.metadata.insert("flag".into(), true.into());
        m.metadata.insert("score".into(), 0.5.into());
        m.metadata.insert("origin".into(), "cli".into());
        let json = serde_json::to_string(&m).unwrap();
        let back: Memory = serde_json::from_str(&json).unwrap();
        assert_eq!(back.metadata.get("flag"), Some(&MetadataValue::Bool(true)));
        assert_eq!(
            back.metadata.get("score"),
            Some(&MetadataValue::Number(0.5))
        );
        assert_eq!(
            back.metadata.get("origin"),
            Some(&MetadataValue::String("cli".into()))
        );
    }
}
