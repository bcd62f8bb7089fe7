// Fractal Memory Engine — Embedding Provider
//
// Turns text into fixed-width, L2-normalized vectors. The backend cascade is
// configurable; whatever the primary backend does, callers always get vectors
// back because the deterministic hashed embedding is the floor.
//
// Module layout:
//   vector.rs — byte codecs, normalization, width alignment, dot product
//   hashed.rs — HashedEmbedder (offline, reproducible)
//   remote.rs — RemoteEmbeddingClient (Ollama + OpenAI-compatible APIs)
//   mod.rs    — EmbeddingBackend trait + Embedder cascade

pub mod hashed;
pub mod remote;
pub mod vector;

pub use hashed::HashedEmbedder;
pub use remote::RemoteEmbeddingClient;
pub use vector::{align_dim, dot, f32_vec_to_bytes, l2_normalize};

use crate::atoms::error::EngineResult;
use crate::engine::config::{EmbeddingConfig, EmbeddingMode};
use async_trait::async_trait;
use log::warn;
use std::sync::Arc;

/// A source of embeddings. Implementations may fail; the `Embedder` decides
/// what happens next.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// One vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>>;
}

#[async_trait]
impl EmbeddingBackend for HashedEmbedder {
    fn name(&self) -> &'static str {
        "hash"
    }

    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        Ok(self.embed_all(texts))
    }
}

#[async_trait]
impl EmbeddingBackend for RemoteEmbeddingClient {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        RemoteEmbeddingClient::embed(self, texts).await
    }
}

/// Primary backend (optional) plus the hashed floor.
pub struct Embedder {
    primary: Option<Arc<dyn EmbeddingBackend>>,
    fallback: HashedEmbedder,
}

impl Embedder {
    pub fn from_config(config: &EmbeddingConfig) -> EngineResult<Self> {
        let fallback = HashedEmbedder::new(config.dims);
        let primary: Option<Arc<dyn EmbeddingBackend>> = match config.mode {
            EmbeddingMode::Hash => None,
            EmbeddingMode::Auto | EmbeddingMode::Remote => {
                Some(Arc::new(RemoteEmbeddingClient::new(config)?))
            }
        };
        Ok(Self { primary, fallback })
    }

    /// Offline embedder; used by tests and `EmbeddingMode::Hash`.
    pub fn hashed(dims: usize) -> Self {
        Self { primary: None, fallback: HashedEmbedder::new(dims) }
    }

    /// Custom primary backend with the hashed floor underneath.
    pub fn with_backend(primary: Arc<dyn EmbeddingBackend>, dims: usize) -> Self {
        Self { primary: Some(primary), fallback: HashedEmbedder::new(dims) }
    }

    /// Embed a batch. Never fails: any primary failure, wrong row count, or
    /// empty row degrades the whole batch to hashed embeddings so one call
    /// never mixes backends.
    pub async fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }
        if let Some(primary) = &self.primary {
            match primary.embed(texts).await {
                Ok(mut vecs) if vecs.len() == texts.len() && vecs.iter().all(|v| !v.is_empty()) => {
                    for v in vecs.iter_mut() {
                        l2_normalize(v);
                    }
                    return vecs;
                }
                Ok(vecs) => warn!(
                    "[embed] {} returned {} vectors for {} texts — using hashed embedding",
                    primary.name(),
                    vecs.len(),
                    texts.len()
                ),
                Err(e) => warn!("[embed] {} failed — using hashed embedding: {}", primary.name(), e),
            }
        }
        self.fallback.embed_all(texts)
    }

    pub async fn embed_one(&self, text: &str) -> Vec<f32> {
        self.embed(&[text.to_string()]).await.pop().unwrap_or_default()
    }
}
