//! Retrieval capability shared by the vector and keyword backends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::RagResult;

/// Caller-supplied key/value tags.
pub type Tags = HashMap<String, serde_json::Value>;

/// Identifier handed out by `ingest`, a counter starting at 0.
pub type DocumentId = usize;

/// Provenance stored with every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub original_doc_id: DocumentId,
    pub chunk_index: usize,
    #[serde(flatten)]
    pub tags: Tags,
}

/// A chunk of document text with its embedding vector and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A chunk paired with its similarity to the query, produced only by `search`.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Swappable retrieval backend.
///
/// Ingestion and search on one instance are mutually exclusive; the coordinator
/// holds the backend behind a `RwLock` to guarantee it.
#[async_trait]
pub trait Retriever: Send + Sync + 'static {
    /// Must be called before `ingest` or `search`.
    async fn initialize(&mut self) -> RagResult<()>;

    /// Index a document and return its id. Partial failures still return an id.
    async fn ingest(&mut self, text: &str, tags: Tags) -> RagResult<DocumentId>;

    /// Top `k` chunks for `query`, best first.
    async fn search(&self, query: &str, k: usize) -> RagResult<Vec<ScoredChunk>>;

    fn document_count(&self) -> usize;

    fn chunk_count(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_metadata_flattens_tags() {
        let metadata = ChunkMetadata {
            original_doc_id: 4,
            chunk_index: 1,
            tags: Tags::from([("source".to_string(), serde_json::json!("README.md"))]),
        };

        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "original_doc_id": 4,
                "chunk_index": 1,
                "source": "README.md"
            })
        );
    }

    #[test]
    fn test_chunk_serialization_skips_embedding() {
        let chunk = Chunk {
            id: "c1".to_string(),
            text: "hello".to_string(),
            embedding: vec![0.1; 768],
            metadata: ChunkMetadata {
                original_doc_id: 0,
                chunk_index: 0,
                tags: Tags::new(),
            },
        };

        let value = serde_json::to_value(&chunk).unwrap();
        assert!(value.get("embedding").is_none());
        assert_eq!(value["text"], "hello");
    }
}
