//! Embedding generation
//!
//! Storage treats vectors as opaque `f32` arrays; generation is pluggable
//! behind [`EmbeddingProvider`]. Two concrete providers ship here: a local
//! ONNX model (fastembed, behind the `embeddings` feature) and a remote
//! OpenAI-style `/v1/embeddings` HTTP client. A deterministic hash-projection
//! fallback exists for environments with neither (and for tests).

#[cfg(feature = "embeddings")]
#[cfg_attr(docsrs, doc(cfg(feature = "embeddings")))]
pub mod local;
pub mod remote;

use async_trait::async_trait;

#[cfg(feature = "embeddings")]
pub use local::LocalEmbedder;
pub use remote::RemoteEmbedder;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error types
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// Failed to initialize the embedding model
    #[error("Model initialization failed: {0}")]
    ModelInit(String),
    /// Failed to generate an embedding
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),
    /// Invalid input (empty, too long)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Remote endpoint failure
    #[error("Embedding endpoint error: {0}")]
    Http(String),
}

// ============================================================================
// EMBEDDING TYPE
// ============================================================================

/// A semantic embedding vector
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// The embedding vector
    pub vector: Vec<f32>,
    /// Dimensions of the vector
    pub dimensions: usize,
}

impl Embedding {
    /// Create a new embedding from a vector
    pub fn new(vector: Vec<f32>) -> Self {
        let dimensions = vector.len();
        Self { vector, dimensions }
    }

    /// Compute cosine similarity with another embedding
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.dimensions != other.dimensions {
            return 0.0;
        }
        cosine_similarity(&self.vector, &other.vector)
    }

    /// Normalize the vector to unit length in place
    pub fn normalize(&mut self) {
        let norm = self.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut self.vector {
                *x /= norm;
            }
        }
    }

    /// Whether the vector is unit length
    pub fn is_normalized(&self) -> bool {
        let norm = self.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        (norm - 1.0).abs() < 0.001
    }

    /// Serialize to little-endian bytes for blob storage
    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Deserialize from blob bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self::new(vector))
    }
}

/// Cosine similarity between two vectors (0.0 on dimension mismatch)
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// Pluggable embedding generation
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text into a unit-normalized vector
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Vector dimensionality this provider produces
    fn dimensions(&self) -> usize;

    /// Model identifier for stats and row metadata
    fn model_name(&self) -> &str;
}

// ============================================================================
// FALLBACK EMBEDDER
// ============================================================================

/// Deterministic hash-projection embedder.
///
/// Produces stable unit vectors from content bytes with no semantic power.
/// Used when no model is configured and throughout the test suite, where
/// determinism matters more than meaning: identical content maps to the
/// identical vector, so exact-match retrieval still ranks first.
pub struct FallbackEmbedder {
    dimensions: usize,
}

impl FallbackEmbedder {
    /// Create a fallback embedder with the given dimensionality
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for FallbackEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for FallbackEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".to_string()));
        }
        // Seeded xorshift stream keyed on the content hash; token co-occurrence
        // folds lowercased words in so near-identical texts land nearby.
        use sha2::{Digest, Sha256};
        let mut acc = vec![0f32; self.dimensions];
        for (w, word) in text.to_lowercase().split_whitespace().enumerate() {
            let digest = Sha256::digest(word.as_bytes());
            let mut state = u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"));
            let weight = 1.0 / (1.0 + w as f32 * 0.01);
            for slot in acc.iter_mut() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let unit = (state as f32 / u64::MAX as f32) * 2.0 - 1.0;
                *slot += unit * weight;
            }
        }
        let mut embedding = Embedding::new(acc);
        embedding.normalize();
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "hash-projection-fallback"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![0.5, 0.5, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_dimension_mismatch() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_bytes_round_trip() {
        let e = Embedding::new(vec![0.1, -0.2, 0.3]);
        let bytes = e.to_bytes();
        let back = Embedding::from_bytes(&bytes).unwrap();
        assert_eq!(e, back);
        assert!(Embedding::from_bytes(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_normalize() {
        let mut e = Embedding::new(vec![3.0, 4.0]);
        assert!(!e.is_normalized());
        e.normalize();
        assert!(e.is_normalized());
    }

    #[tokio::test]
    async fn test_fallback_deterministic() {
        let embedder = FallbackEmbedder::new(64);
        let a = embedder.embed("meeting notes").await.unwrap();
        let b = embedder.embed("meeting notes").await.unwrap();
        assert_eq!(a, b);
        assert!(a.is_normalized());
        assert_eq!(a.dimensions, 64);
    }

    #[tokio::test]
    async fn test_fallback_shared_tokens_closer() {
        let embedder = FallbackEmbedder::new(128);
        let a = embedder.embed("project meeting notes").await.unwrap();
        let b = embedder.embed("project meeting summary").await.unwrap();
        let c = embedder.embed("entirely unrelated topic").await.unwrap();
        assert!(a.cosine_similarity(&b) > a.cosine_similarity(&c));
    }

    #[tokio::test]
    async fn test_fallback_rejects_empty() {
        let embedder = FallbackEmbedder::default();
        assert!(embedder.embed("").await.is_err());
    }
}
