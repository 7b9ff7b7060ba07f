use super::{check_dimensions, Embedder};
use crate::config::EmbeddingConfig;
use crate::embedding_backend::{EmbeddingBackendClient, MediaInput};
use crate::error::Result;
use crate::registry::EmbeddingSpace;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Embedder backed by the HTTP embedding service
pub struct HttpEmbedder {
    client: EmbeddingBackendClient,
    text_model: String,
    image_model: String,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = EmbeddingBackendClient::new(&config.backend_url)?;
        Ok(Self {
            client,
            text_model: config.model.clone(),
            image_model: config.image_model.clone(),
        })
    }

    pub fn with_client(client: EmbeddingBackendClient, config: &EmbeddingConfig) -> Self {
        Self {
            client,
            text_model: config.model.clone(),
            image_model: config.image_model.clone(),
        }
    }

    fn encode(items: Vec<Vec<u8>>) -> Vec<MediaInput> {
        items
            .into_iter()
            .map(|bytes| MediaInput {
                data_base64: STANDARD.encode(bytes),
                mime: None,
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = self.client.embed_text(&self.text_model, texts).await?;
        check_dimensions(EmbeddingSpace::Text, &embeddings)?;
        Ok(embeddings)
    }

    async fn embed_text_in(
        &self,
        space: EmbeddingSpace,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>> {
        match space {
            EmbeddingSpace::Text => self.embed(texts).await,
            EmbeddingSpace::Image => {
                if texts.is_empty() {
                    return Ok(Vec::new());
                }
                let embeddings = self.client.embed_text(&self.image_model, texts).await?;
                check_dimensions(EmbeddingSpace::Image, &embeddings)?;
                Ok(embeddings)
            }
            EmbeddingSpace::Audio => Err(crate::error::Error::Unsupported(
                "Text queries in the audio space are not supported".to_string(),
            )),
        }
    }

    async fn embed_images(&self, images: Vec<Vec<u8>>) -> Result<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = self
            .client
            .embed_images(&self.image_model, Self::encode(images))
            .await?;
        check_dimensions(EmbeddingSpace::Image, &embeddings)?;
        Ok(embeddings)
    }

    fn model_name(&self) -> &str {
        &self.text_model
    }
}
