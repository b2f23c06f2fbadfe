//! Local semantic embeddings
//!
//! fastembed ONNX inference (all-MiniLM-L6-v2, 384 dimensions). The model is
//! lazily initialized on first use so startup stays fast and air-gapped
//! deployments fall back cleanly to the remote or hash providers.

use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use super::{Embedding, EmbeddingError, EmbeddingProvider};

/// Embedding dimensions of the default local model
pub const EMBEDDING_DIMENSIONS: usize = 384;

/// Maximum text length for embedding (truncated if longer)
pub const MAX_TEXT_LENGTH: usize = 8192;

/// Default local model identifier
pub const LOCAL_MODEL_NAME: &str = "all-MiniLM-L6-v2";

/// Cache directory for model downloads
fn cache_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("FASTEMBED_CACHE_PATH") {
        return std::path::PathBuf::from(path);
    }
    if let Some(proj_dirs) = directories::ProjectDirs::from("io", "keepsake", "keepsake") {
        return proj_dirs.cache_dir().join("fastembed");
    }
    std::path::PathBuf::from(".fastembed_cache")
}

static MODEL: OnceLock<Result<Mutex<TextEmbedding>, String>> = OnceLock::new();

fn model() -> Result<std::sync::MutexGuard<'static, TextEmbedding>, EmbeddingError> {
    let result = MODEL.get_or_init(|| {
        let cache = cache_dir();
        if let Err(e) = std::fs::create_dir_all(&cache) {
            tracing::warn!(path = ?cache, error = %e, "failed to create model cache directory");
        }
        let options = InitOptions::new(EmbeddingModel::AllMiniLML6V2)
            .with_show_download_progress(false)
            .with_cache_dir(cache);
        TextEmbedding::try_new(options).map(Mutex::new).map_err(|e| {
            format!(
                "Failed to initialize {LOCAL_MODEL_NAME} embedding model: {e}. \
                 Ensure ONNX runtime is available and model files can be downloaded."
            )
        })
    });

    match result {
        Ok(model) => model
            .lock()
            .map_err(|e| EmbeddingError::ModelInit(format!("Lock poisoned: {e}"))),
        Err(err) => Err(EmbeddingError::ModelInit(err.clone())),
    }
}

/// Local fastembed provider
pub struct LocalEmbedder;

impl LocalEmbedder {
    /// Create a local embedder; the model loads lazily on first embed
    pub fn new() -> Self {
        Self
    }

    /// Force model initialization, surfacing download/runtime errors early
    pub fn init(&self) -> Result<(), EmbeddingError> {
        model().map(|_| ())
    }
}

impl Default for LocalEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".to_string()));
        }
        let truncated: String = text.chars().take(MAX_TEXT_LENGTH).collect();

        let vectors = {
            let mut model = model()?;
            model
                .embed(vec![truncated], None)
                .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
        };

        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("model returned no vector".into()))?;

        let mut embedding = Embedding::new(vector);
        embedding.normalize();
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIMENSIONS
    }

    fn model_name(&self) -> &str {
        LOCAL_MODEL_NAME
    }
}
