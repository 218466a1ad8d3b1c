use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{RagError, RagResult};
use crate::retrieval::{Chunk, ChunkMetadata, DocumentId, Retriever, ScoredChunk, Tags};
use crate::splitter::split_paragraphs;

/// Score assigned to every substring hit.
pub const KEYWORD_MATCH_SCORE: f32 = 0.8;

/// Deterministic retriever: a chunk matches when it contains the whole query,
/// case-insensitively. Needs no embedding backend, so it is what tests and
/// offline runs wire in instead of [`crate::vector_store::VectorStore`].
#[derive(Default)]
pub struct KeywordStore {
    chunks: Vec<Chunk>,
    documents: usize,
    initialized: bool,
}

impl KeywordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Retriever for KeywordStore {
    async fn initialize(&mut self) -> RagResult<()> {
        self.initialized = true;
        Ok(())
    }

    async fn ingest(&mut self, text: &str, tags: Tags) -> RagResult<DocumentId> {
        if !self.initialized {
            return Err(RagError::not_initialized("keyword store"));
        }

        let doc_id = self.documents;
        self.documents += 1;

        for (chunk_index, paragraph) in split_paragraphs(text).into_iter().enumerate() {
            self.chunks.push(Chunk {
                id: Uuid::new_v4().to_string(),
                text: paragraph,
                embedding: Vec::new(),
                metadata: ChunkMetadata {
                    original_doc_id: doc_id,
                    chunk_index,
                    tags: tags.clone(),
                },
            });
        }

        Ok(doc_id)
    }

    async fn search(&self, query: &str, k: usize) -> RagResult<Vec<ScoredChunk>> {
        if !self.initialized {
            return Err(RagError::not_initialized("keyword store"));
        }

        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(vec![]);
        }

        Ok(self
            .chunks
            .iter()
            .filter(|chunk| chunk.text.to_lowercase().contains(&needle))
            .take(k)
            .map(|chunk| ScoredChunk {
                chunk: chunk.clone(),
                score: KEYWORD_MATCH_SCORE,
            })
            .collect())
    }

    fn document_count(&self) -> usize {
        self.documents
    }

    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}
