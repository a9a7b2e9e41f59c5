//! Embedding generation: the provider trait, the dimension-checked
//! adapter handed to the stores, and the Ollama-backed implementation.

#[cfg(test)]
mod tests;

pub mod chunking;
pub mod ollama;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::Result;

/// One unit of embeddable input. Image paths are resolved to pixel data
/// by the provider, not by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedPayload {
    Text(String),
    ImagePath(PathBuf),
}

impl EmbedPayload {
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    #[inline]
    pub fn image(p: impl Into<PathBuf>) -> Self {
        Self::ImagePath(p.into())
    }
}

/// A model endpoint that turns payload batches into vectors. The
/// returned batch must be the same length and order as the input.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, batch: &[EmbedPayload]) -> Result<Vec<Vec<f32>>>;

    /// Declared output dimension of the model.
    fn embedding_dim(&self) -> usize;

    /// Cheap reachability probe used during warmup.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Provider plus its declared dimension, cloned freely across stores.
/// A vector whose length disagrees with the declared dimension is
/// logged but passed through; the index layer decides what to do.
#[derive(Clone)]
pub struct EmbeddingFunction {
    dim: usize,
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingFunction {
    #[inline]
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            dim: provider.embedding_dim(),
            provider,
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub async fn embed(&self, batch: &[EmbedPayload]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.provider.embed(batch).await?;

        for (i, v) in vectors.iter().enumerate() {
            if v.len() != self.dim {
                warn!(
                    position = i,
                    got = v.len(),
                    declared = self.dim,
                    "embedding dimension differs from declared dimension"
                );
            }
        }

        Ok(vectors)
    }

    #[inline]
    pub async fn health_check(&self) -> Result<()> {
        self.provider.health_check().await
    }
}
