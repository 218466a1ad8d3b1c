use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::Config;

const QUERY_CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(1000).unwrap();

/// Embedding backend consumed by the similarity index.
///
/// Returns one vector per input string, all of the same dimension for the lifetime
/// of the backend. Failures are plain errors; callers decide how to recover.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Embedding backend returned no vector for query"))
    }

    fn model_name(&self) -> &str;
}

#[derive(Serialize)]
#[serde(untagged)]
enum OllamaEmbeddingRequest<'a> {
    Single { model: &'a str, input: &'a str },
    Batch { model: &'a str, input: &'a [String] },
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
}

/// Embedding service using the Ollama API with LRU query caching.
/// Supports both single and batch embedding operations.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    ollama_url: String,
    model: String,
    batch_timeout: Duration,
    query_cache: RwLock<LruCache<String, Vec<f32>>>,
}

impl OllamaEmbedder {
    pub fn new(ollama_url: impl Into<String>, model: impl Into<String>, batch_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(batch_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            ollama_url: ollama_url.into(),
            model: model.into(),
            batch_timeout,
            query_cache: RwLock::new(LruCache::new(QUERY_CACHE_CAPACITY)),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.ollama_url.clone(),
            config.embedding_model.clone(),
            config.embedding_timeout,
        )
    }

    /// Fail fast when Ollama is down or the model has not been pulled.
    pub async fn verify(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.ollama_url))
            .send()
            .await
            .with_context(|| {
                format!(
                    "Cannot connect to Ollama at {}. Make sure Ollama is running.",
                    self.ollama_url
                )
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Failed to list models from Ollama: {} - {}",
                status,
                body
            ));
        }

        let tags: serde_json::Value = response.json().await?;
        let models = tags["models"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Cannot list models"))?;

        let exists = models
            .iter()
            .any(|m| m["name"].as_str().unwrap_or("").starts_with(&self.model));

        if !exists {
            let available: Vec<_> = models.iter().filter_map(|m| m["name"].as_str()).collect();
            return Err(anyhow::anyhow!(
                "Model '{}' not found. Available: {:?}. Run: ollama pull {}",
                self.model,
                available,
                self.model
            ));
        }

        tracing::info!(model = %self.model, url = %self.ollama_url, "Embedding model verified");
        Ok(())
    }

    /// Embed a short probe string to learn the backend's vector dimension.
    pub async fn probe_dimension(&self) -> Result<usize> {
        let vector = self.get_embedding("dimension probe").await?;
        anyhow::ensure!(!vector.is_empty(), "Embedding backend returned an empty vector");
        Ok(vector.len())
    }

    async fn get_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let request = OllamaEmbeddingRequest::Single {
            model: &self.model,
            input: text,
        };
        let response = self
            .client
            .post(format!("{}/api/embed", self.ollama_url))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Ollama API error: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            ));
        }
        let embedding_response: OllamaEmbeddingResponse = response.json().await?;
        if let Some(embedding) = embedding_response.embedding {
            Ok(embedding)
        } else if let Some(embeddings) = embedding_response.embeddings {
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("Empty embeddings array from Ollama"))
        } else {
            Err(anyhow::anyhow!("No embedding returned from Ollama"))
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = OllamaEmbeddingRequest::Batch {
            model: &self.model,
            input: texts,
        };

        // Hard stop on top of the client timeout so a stalled body read cannot hang ingestion
        let request_future = self
            .client
            .post(format!("{}/api/embed", self.ollama_url))
            .json(&request)
            .send();

        let response = match tokio::time::timeout(self.batch_timeout, request_future).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(anyhow::anyhow!(
                    "Batch embedding request timed out after {} seconds for {} texts",
                    self.batch_timeout.as_secs(),
                    texts.len()
                ));
            }
        };

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Ollama API error: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            ));
        }

        let embedding_response: OllamaEmbeddingResponse = response.json().await?;

        if let Some(embeddings) = embedding_response.embeddings {
            if embeddings.len() == texts.len() {
                return Ok(embeddings);
            }
            tracing::warn!(
                "Batch embedding returned {} embeddings for {} texts, falling back to sequential",
                embeddings.len(),
                texts.len()
            );
        } else if embedding_response.embedding.is_some() {
            tracing::warn!(
                "Model '{}' doesn't support batch embeddings, falling back to sequential",
                self.model
            );
        }

        tracing::info!("Processing {} embeddings sequentially", texts.len());
        let mut result = Vec::with_capacity(texts.len());
        for text in texts {
            result.push(self.get_embedding(text).await?);
        }
        Ok(result)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match texts.len() {
            0 => Ok(vec![]),
            1 => Ok(vec![self.get_embedding(&texts[0]).await?]),
            _ => self.embed_batch(texts).await,
        }
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.query_cache.write().await.get(text) {
            return Ok(cached.clone());
        }

        let embedding = self.get_embedding(text).await?;
        self.query_cache
            .write()
            .await
            .put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
