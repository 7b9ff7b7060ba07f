//! HTTP client for an external embedding service

use crate::error::{Error, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCapabilities {
    #[serde(default)]
    pub backend_version: Option<String>,
    #[serde(default)]
    pub models: Vec<BackendModelCapabilities>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendModelCapabilities {
    #[serde(alias = "model")]
    pub id: String,
    #[serde(default)]
    pub modalities: Vec<String>,
    #[serde(default, alias = "embedding_dim", alias = "dimension")]
    pub embedding_dim: Option<usize>,
    #[serde(default)]
    pub max_batch: Option<usize>,
}

/// Base64 encoded media payload
#[derive(Debug, Clone, Serialize)]
pub struct MediaInput {
    pub data_base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct EmbedTextRequest {
    model: String,
    inputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct EmbedMediaRequest {
    model: String,
    inputs: Vec<MediaInput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Embeddings { embeddings: Vec<Vec<f32>> },
    Vectors { vectors: Vec<Vec<f32>> },
    Data { data: Vec<EmbeddingData> },
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingResponse {
    fn into_embeddings(self) -> Vec<Vec<f32>> {
        match self {
            EmbeddingResponse::Embeddings { embeddings } => embeddings,
            EmbeddingResponse::Vectors { vectors } => vectors,
            EmbeddingResponse::Data { data } => data.into_iter().map(|d| d.embedding).collect(),
        }
    }
}

pub struct EmbeddingBackendClient {
    client: Client,
    base_url: Url,
    retries: usize,
}

impl EmbeddingBackendClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url,
            retries: 2,
        })
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid embedding backend URL: {}", e)))
    }

    /// Send a request, retrying transport errors and 5xx/429 responses.
    /// Auth failures and other 4xx responses are returned immediately.
    async fn send_with_retry<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.retries {
            let req = request.try_clone().ok_or_else(|| {
                Error::Embedding("Failed to clone backend request".to_string())
            })?;
            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json::<T>().await?);
                    }
                    match status {
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                            return Err(Error::Auth(format!(
                                "Embedding backend rejected credentials ({})",
                                status
                            )));
                        }
                        s if s.is_client_error() && s != StatusCode::TOO_MANY_REQUESTS => {
                            return Err(Error::Unsupported(format!(
                                "Embedding backend refused the request ({})",
                                s
                            )));
                        }
                        s => {
                            last_err = Some(Error::Embedding(format!(
                                "Embedding backend returned {}",
                                s
                            )))
                        }
                    }
                }
                Err(e) => last_err = Some(Error::Embedding(e.to_string())),
            }

            if attempt < self.retries {
                tokio::time::sleep(Duration::from_millis(200 * (attempt + 1) as u64)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::Embedding("Embedding backend request failed".to_string())
        }))
    }

    pub async fn capabilities(&self) -> Result<BackendCapabilities> {
        let url = self.endpoint("/capabilities")?;
        self.send_with_retry(self.client.get(url)).await
    }

    pub async fn embed_text(&self, model: &str, inputs: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let url = self.endpoint("/v1/embed/text")?;
        let request = EmbedTextRequest {
            model: model.to_string(),
            inputs,
        };
        let parsed: EmbeddingResponse = self
            .send_with_retry(self.client.post(url).json(&request))
            .await?;
        Ok(parsed.into_embeddings())
    }

    pub async fn embed_images(&self, model: &str, inputs: Vec<MediaInput>) -> Result<Vec<Vec<f32>>> {
        self.embed_media("/v1/embed/image", model, inputs).await
    }

    pub async fn embed_audio(&self, model: &str, inputs: Vec<MediaInput>) -> Result<Vec<Vec<f32>>> {
        self.embed_media("/v1/embed/audio", model, inputs).await
    }

    async fn embed_media(
        &self,
        path: &str,
        model: &str,
        inputs: Vec<MediaInput>,
    ) -> Result<Vec<Vec<f32>>> {
        let url = self.endpoint(path)?;
        let request = EmbedMediaRequest {
            model: model.to_string(),
            inputs,
        };
        let parsed: EmbeddingResponse = self
            .send_with_retry(self.client.post(url).json(&request))
            .await?;
        Ok(parsed.into_embeddings())
    }
}
