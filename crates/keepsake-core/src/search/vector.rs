//! HNSW vector index
//!
//! USearch-backed approximate nearest neighbor index over memory embeddings,
//! keyed by content hash. Cosine metric; `relevance = 1 - distance`, clamped
//! to [0, 1].

use std::collections::HashMap;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

/// HNSW connectivity parameter (higher = better recall, more memory)
pub const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
pub const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector index error types
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorSearchError {
    /// Failed to create the index
    #[error("Index creation failed: {0}")]
    IndexCreation(String),
    /// Failed to add a vector
    #[error("Failed to add vector: {0}")]
    IndexAdd(String),
    /// Failed to search
    #[error("Search failed: {0}")]
    IndexSearch(String),
    /// Dimension mismatch
    #[error("Invalid dimensions: expected {expected}, got {got}")]
    InvalidDimensions {
        /// Configured dimensionality
        expected: usize,
        /// Offered vector length
        got: usize,
    },
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Vector index configuration
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    /// Number of dimensions
    pub dimensions: usize,
    /// HNSW connectivity parameter
    pub connectivity: usize,
    /// Expansion factor for adding vectors
    pub expansion_add: usize,
    /// Expansion factor for searching
    pub expansion_search: usize,
}

impl VectorIndexConfig {
    /// Config for the given dimensionality with default HNSW parameters
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
        }
    }
}

/// Index statistics
#[derive(Debug, Clone)]
pub struct VectorIndexStats {
    /// Total number of vectors
    pub total_vectors: usize,
    /// Vector dimensions
    pub dimensions: usize,
    /// Estimated memory usage in bytes
    pub memory_bytes: usize,
}

// ============================================================================
// VECTOR INDEX
// ============================================================================

/// HNSW index mapping content hashes to embedding vectors
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    hash_to_id: HashMap<String, u64>,
    id_to_hash: HashMap<u64, String>,
    next_id: u64,
}

impl VectorIndex {
    /// Create an index for the given dimensionality
    pub fn new(dimensions: usize) -> Result<Self, VectorSearchError> {
        Self::with_config(VectorIndexConfig::with_dimensions(dimensions))
    }

    /// Create an index with explicit HNSW parameters
    pub fn with_config(config: VectorIndexConfig) -> Result<Self, VectorSearchError> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };

        let index =
            Index::new(&options).map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;

        Ok(Self {
            index,
            config,
            hash_to_id: HashMap::new(),
            id_to_hash: HashMap::new(),
            next_id: 0,
        })
    }

    /// Number of vectors in the index
    pub fn len(&self) -> usize {
        self.index.size()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index dimensionality
    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn reserve(&self, capacity: usize) -> Result<(), VectorSearchError> {
        self.index.reserve(capacity).map_err(|e| {
            VectorSearchError::IndexCreation(format!("Failed to reserve capacity: {e}"))
        })
    }

    /// Add (or replace) the vector for a content hash
    pub fn add(&mut self, content_hash: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions {
                expected: self.config.dimensions,
                got: vector.len(),
            });
        }

        if let Some(&existing_id) = self.hash_to_id.get(content_hash) {
            self.index
                .remove(existing_id)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            self.reserve(self.index.size() + 1)?;
            self.index
                .add(existing_id, vector)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            return Ok(());
        }

        // usearch requires reserve() before add() once capacity is exhausted
        let capacity = self.index.capacity();
        if self.index.size() >= capacity {
            self.reserve(std::cmp::max(capacity * 2, 16))?;
        }

        let id = self.next_id;
        self.next_id += 1;

        self.index
            .add(id, vector)
            .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
        self.hash_to_id.insert(content_hash.to_string(), id);
        self.id_to_hash.insert(id, content_hash.to_string());

        Ok(())
    }

    /// Remove the vector for a content hash; false if it was absent
    pub fn remove(&mut self, content_hash: &str) -> Result<bool, VectorSearchError> {
        if let Some(id) = self.hash_to_id.remove(content_hash) {
            self.id_to_hash.remove(&id);
            self.index
                .remove(id)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Whether a content hash has an indexed vector
    pub fn contains(&self, content_hash: &str) -> bool {
        self.hash_to_id.contains_key(content_hash)
    }

    /// Nearest neighbors as `(content_hash, relevance)` with relevance in [0, 1]
    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f64)>, VectorSearchError> {
        if query.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions {
                expected: self.config.dimensions,
                got: query.len(),
            });
        }
        if self.is_empty() {
            return Ok(vec![]);
        }

        let results = self
            .index
            .search(query, limit)
            .map_err(|e| VectorSearchError::IndexSearch(e.to_string()))?;

        let mut out = Vec::with_capacity(results.keys.len());
        for (key, distance) in results.keys.iter().zip(results.distances.iter()) {
            if let Some(hash) = self.id_to_hash.get(key) {
                let relevance = (1.0 - f64::from(*distance)).clamp(0.0, 1.0);
                out.push((hash.clone(), relevance));
            }
        }
        Ok(out)
    }

    /// Index statistics
    pub fn stats(&self) -> VectorIndexStats {
        VectorIndexStats {
            total_vectors: self.len(),
            dimensions: self.config.dimensions,
            memory_bytes: self.index.serialized_length(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const DIMS: usize = 32;

    fn test_vector(seed: f32) -> Vec<f32> {
        let raw: Vec<f32> = (0..DIMS)
            .map(|i| ((i as f32 + seed) / DIMS as f32).sin())
            .collect();
        let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        raw.into_iter().map(|x| x / norm).collect()
    }

    #[test]
    fn test_add_and_search() {
        let mut index = VectorIndex::new(DIMS).unwrap();
        index.add("hash-1", &test_vector(1.0)).unwrap();
        index.add("hash-2", &test_vector(2.0)).unwrap();
        index.add("hash-3", &test_vector(50.0)).unwrap();

        assert_eq!(index.len(), 3);
        let results = index.search(&test_vector(1.0), 3).unwrap();
        assert_eq!(results[0].0, "hash-1");
        assert!(results[0].1 > 0.99);
        assert!(results.iter().all(|(_, r)| (0.0..=1.0).contains(r)));
    }

    #[test]
    fn test_replace_keeps_len() {
        let mut index = VectorIndex::new(DIMS).unwrap();
        index.add("hash-1", &test_vector(1.0)).unwrap();
        index.add("hash-1", &test_vector(2.0)).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut index = VectorIndex::new(DIMS).unwrap();
        index.add("hash-1", &test_vector(1.0)).unwrap();
        assert!(index.remove("hash-1").unwrap());
        assert!(!index.remove("hash-1").unwrap());
        assert!(!index.contains("hash-1"));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = VectorIndex::new(DIMS).unwrap();
        assert!(matches!(
            index.add("h", &[1.0, 2.0]),
            Err(VectorSearchError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_empty_search() {
        let index = VectorIndex::new(DIMS).unwrap();
        assert!(index.search(&test_vector(1.0), 5).unwrap().is_empty());
    }
}
