//! Embedding generation
//!
//! Embeddings are computed by an injected [`Embedder`]; each method covers
//! one input modality and returns vectors in a specific embedding space.

mod http_backend;

pub use http_backend::*;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::registry::EmbeddingSpace;
use async_trait::async_trait;
use std::sync::Arc;

/// Trait for embedding providers
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts into the text space
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Embed texts into `space`; cross-modal models override this to place
    /// text queries in the image or audio space
    async fn embed_text_in(
        &self,
        space: EmbeddingSpace,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>> {
        match space {
            EmbeddingSpace::Text => self.embed(texts).await,
            other => Err(Error::Unsupported(format!(
                "Text queries in the {} space are not supported by {}",
                other.as_str(),
                self.model_name()
            ))),
        }
    }

    /// Embed a batch of encoded images into the image space
    async fn embed_images(&self, _images: Vec<Vec<u8>>) -> Result<Vec<Vec<f32>>> {
        Err(Error::Unsupported(
            "Image embedding is not supported by this backend".to_string(),
        ))
    }

    /// Embed a batch of encoded audio clips into the audio space
    async fn embed_audio(&self, _clips: Vec<Vec<u8>>) -> Result<Vec<Vec<f32>>> {
        Err(Error::Unsupported(
            "Audio embedding is not supported by this backend".to_string(),
        ))
    }

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    Ok(Arc::new(HttpEmbedder::new(config)?))
}

/// Check that every vector has the space's dimension
pub fn check_dimensions(space: EmbeddingSpace, embeddings: &[Vec<f32>]) -> Result<()> {
    if let Some(bad) = embeddings.iter().find(|v| v.len() != space.dimension()) {
        return Err(Error::Embedding(format!(
            "Expected {}-dimensional {} embeddings, got {}",
            space.dimension(),
            space.as_str(),
            bad.len()
        )));
    }
    Ok(())
}
