//! Context items handed to the generator, and optional external sources of them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;
use crate::retrieval::{ScoredChunk, Tags};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// One piece of context passed to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub content: String,
    pub metadata: Tags,
}

impl From<&ScoredChunk> for ContextItem {
    fn from(scored: &ScoredChunk) -> Self {
        let mut metadata = scored.chunk.metadata.tags.clone();
        metadata.insert(
            "original_doc_id".to_string(),
            serde_json::json!(scored.chunk.metadata.original_doc_id),
        );
        metadata.insert(
            "chunk_index".to_string(),
            serde_json::json!(scored.chunk.metadata.chunk_index),
        );
        metadata.insert("score".to_string(), serde_json::json!(scored.score));

        Self {
            content: scored.chunk.text.clone(),
            metadata,
        }
    }
}

/// Supplies extra context for a query. An empty list is a valid answer.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn fetch(&self, query: &str) -> Vec<ContextItem>;
}

/// Contributes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExternalContext;

#[async_trait]
impl ContextSource for NoExternalContext {
    async fn fetch(&self, _query: &str) -> Vec<ContextItem> {
        Vec::new()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

/// Any field may be absent or null.
#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "snippet")]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl SearchHit {
    fn into_item(self, source_tag: &str) -> ContextItem {
        ContextItem {
            content: format!(
                "Title: {}\nSnippet: {}",
                self.title.unwrap_or_default(),
                self.description.unwrap_or_default()
            ),
            metadata: Tags::from([
                ("source".to_string(), serde_json::json!(source_tag)),
                ("url".to_string(), serde_json::json!(self.url.unwrap_or_default())),
            ]),
        }
    }
}

/// Queries a search endpoint (`GET <url>?q=<query>`) that answers with
/// `{"results": [{"title", "description", "url"}]}`.
pub struct HttpContextSource {
    client: reqwest::Client,
    url: String,
    source_tag: String,
}

impl HttpContextSource {
    pub fn new(url: impl Into<String>, source_tag: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            source_tag: source_tag.into(),
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        config
            .context_source_url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.context_source_tag.clone()))
            .transpose()
    }

    async fn search(&self, query: &str) -> Result<Vec<ContextItem>> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("q", query)])
            .send()
            .await
            .with_context(|| format!("Cannot reach context source at {}", self.url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Context source returned {}: {}", status, body);
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .context("Context source returned an unexpected body")?;

        Ok(parsed
            .results
            .into_iter()
            .map(|hit| hit.into_item(&self.source_tag))
            .collect())
    }
}

#[async_trait]
impl ContextSource for HttpContextSource {
    async fn fetch(&self, query: &str) -> Vec<ContextItem> {
        match self.search(query).await {
            Ok(items) => {
                tracing::debug!(count = items.len(), source = %self.source_tag, "External context fetched");
                items
            }
            Err(e) => {
                let error = format!("{e:#}");
                tracing::warn!(%error, source = %self.source_tag, "External context unavailable");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{Chunk, ChunkMetadata};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_scored_chunk_becomes_context_item() {
        let scored = ScoredChunk {
            chunk: Chunk {
                id: "c".to_string(),
                text: "Rust has no garbage collector.".to_string(),
                embedding: vec![1.0],
                metadata: ChunkMetadata {
                    original_doc_id: 2,
                    chunk_index: 5,
                    tags: Tags::from([("file_name".to_string(), serde_json::json!("rust.md"))]),
                },
            },
            score: 0.5,
        };

        let item = ContextItem::from(&scored);

        assert_eq!(item.content, "Rust has no garbage collector.");
        assert_eq!(item.metadata["file_name"], "rust.md");
        assert_eq!(item.metadata["original_doc_id"], 2);
        assert_eq!(item.metadata["chunk_index"], 5);
    }

    #[tokio::test]
    async fn test_no_external_context_is_empty() {
        assert!(NoExternalContext.fetch("anything").await.is_empty());
    }

    #[tokio::test]
    async fn test_search_hits_are_formatted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "tokio runtime"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {
                        "title": "Tokio",
                        "description": "An asynchronous runtime.",
                        "url": "https://tokio.rs"
                    },
                    { "title": "Docs", "snippet": "API reference.", "url": "https://docs.rs/tokio" }
                ]
            })))
            .mount(&server)
            .await;

        let source = HttpContextSource::new(format!("{}/search", server.uri()), "web-search").unwrap();
        let items = source.fetch("tokio runtime").await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].content, "Title: Tokio\nSnippet: An asynchronous runtime.");
        assert_eq!(items[0].metadata["source"], "web-search");
        assert_eq!(items[0].metadata["url"], "https://tokio.rs");
        assert_eq!(items[1].content, "Title: Docs\nSnippet: API reference.");
    }

    #[tokio::test]
    async fn test_null_fields_do_not_drop_other_hits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    { "title": "Tokio", "description": "An asynchronous runtime.", "url": "https://tokio.rs" },
                    { "title": null, "description": "Untitled page.", "url": null }
                ]
            })))
            .mount(&server)
            .await;

        let source = HttpContextSource::new(server.uri(), "web-search").unwrap();
        let items = source.fetch("tokio").await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].content, "Title: Tokio\nSnippet: An asynchronous runtime.");
        assert_eq!(items[1].content, "Title: \nSnippet: Untitled page.");
        assert_eq!(items[1].metadata["url"], "");
    }

    #[tokio::test]
    async fn test_missing_results_field_contributes_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let source = HttpContextSource::new(server.uri(), "web-search").unwrap();
        assert!(source.fetch("q").await.is_empty());
    }

    #[tokio::test]
    async fn test_failures_contribute_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let source = HttpContextSource::new(server.uri(), "web-search").unwrap();
        assert!(source.fetch("q").await.is_empty());

        let unreachable = HttpContextSource::new("http://127.0.0.1:1/search", "web-search").unwrap();
        assert!(unreachable.fetch("q").await.is_empty());
    }

    #[test]
    fn test_from_config_without_url_is_none() {
        let config = Config::default();
        assert!(HttpContextSource::from_config(&config).unwrap().is_none());
    }
}
