//! Remote embedding service client
//!
//! Talks to any endpoint with the OpenAI `/v1/embeddings` request shape:
//! `POST {url} {"input": ["text"], "model": "..."}` returning
//! `{"data": [{"embedding": [..]}]}`. Configured URL, model, and key come
//! from [`crate::config::RemoteEmbeddingConfig`].

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::RemoteEmbeddingConfig;

use super::{Embedding, EmbeddingError, EmbeddingProvider};

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// HTTP embedding provider
pub struct RemoteEmbedder {
    client: reqwest::Client,
    config: RemoteEmbeddingConfig,
    dimensions: usize,
}

impl RemoteEmbedder {
    /// Create a remote embedder. `dimensions` must match what the configured
    /// model returns; it sizes the vector index before the first call.
    pub fn new(config: RemoteEmbeddingConfig, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".to_string()));
        }

        let body = serde_json::json!({
            "input": [text],
            "model": self.config.model,
        });

        let mut request = self.client.post(&self.config.url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Http(format!(
                "{status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Http(format!("malformed response: {e}")))?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("endpoint returned no vector".into()))?;

        if vector.len() != self.dimensions {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "expected {} dimensions, endpoint returned {}",
                self.dimensions,
                vector.len()
            )));
        }

        let mut embedding = Embedding::new(vector);
        embedding.normalize();
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

// ============================================================================
// TESTS
// ============================================================================
