use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use crate::embeddings::Embedder;
use crate::error::{RagError, RagResult};
use crate::retrieval::{Chunk, ChunkMetadata, DocumentId, Retriever, ScoredChunk, Tags};
use crate::splitter::split_paragraphs;

/// Bookkeeping for an ingested document. Chunks point back here through
/// `original_doc_id`; the record itself owns none of them.
#[derive(Debug, Clone)]
struct DocumentRecord {
    tags: Tags,
    chunk_count: usize,
}

/// Brute-force dense-vector similarity index.
///
/// Every query is scored against every stored vector. All vectors share the
/// dimension fixed at construction.
pub struct VectorStore {
    embedder: Arc<dyn Embedder>,
    dimension: usize,
    batch_size: usize,
    chunks: Vec<Chunk>,
    documents: Vec<DocumentRecord>,
    next_doc_id: DocumentId,
    initialized: bool,
}

impl VectorStore {
    pub fn new(embedder: Arc<dyn Embedder>, dimension: usize, batch_size: usize) -> Self {
        Self {
            embedder,
            dimension,
            batch_size: batch_size.max(1),
            chunks: Vec::new(),
            documents: Vec::new(),
            next_doc_id: 0,
            initialized: false,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.model_name()
    }

    /// Chunks stored for a document, in `chunk_index` order.
    pub fn chunks_for(&self, doc_id: DocumentId) -> Vec<&Chunk> {
        self.chunks
            .iter()
            .filter(|c| c.metadata.original_doc_id == doc_id)
            .collect()
    }

    pub fn document_tags(&self, doc_id: DocumentId) -> Option<&Tags> {
        self.documents.get(doc_id).map(|d| &d.tags)
    }

    /// Embed every paragraph of one document, batch by batch.
    /// Any backend error or malformed batch fails the whole document.
    async fn encode(&self, paragraphs: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let total_batches = paragraphs.len().div_ceil(self.batch_size);
        let mut embeddings = Vec::with_capacity(paragraphs.len());

        for (batch_idx, batch) in paragraphs.chunks(self.batch_size).enumerate() {
            tracing::debug!(
                "Batch {}/{}: generating embeddings for {} chunks",
                batch_idx + 1,
                total_batches,
                batch.len()
            );

            let batch_embeddings = self
                .embedder
                .embed(batch)
                .await
                .map_err(|e| RagError::Encoding(format!("{e:#}")))?;

            if batch_embeddings.len() != batch.len() {
                return Err(RagError::Encoding(format!(
                    "batch {}/{}: received {} embeddings for {} chunks",
                    batch_idx + 1,
                    total_batches,
                    batch_embeddings.len(),
                    batch.len()
                )));
            }

            if let Some(bad) = batch_embeddings.iter().find(|v| v.len() != self.dimension) {
                return Err(RagError::DimensionMismatch {
                    expected: self.dimension,
                    actual: bad.len(),
                });
            }

            embeddings.extend(batch_embeddings);
        }

        Ok(embeddings)
    }
}

#[async_trait]
impl Retriever for VectorStore {
    async fn initialize(&mut self) -> RagResult<()> {
        self.initialized = true;
        tracing::info!(
            dimension = self.dimension,
            model = %self.embedder.model_name(),
            "Vector store initialized"
        );
        Ok(())
    }

    /// Splits `text` into paragraphs, embeds them and stores the chunks.
    ///
    /// An embedding failure is logged and the document is kept with zero chunks;
    /// the id is never rolled back.
    async fn ingest(&mut self, text: &str, tags: Tags) -> RagResult<DocumentId> {
        if !self.initialized {
            return Err(RagError::not_initialized("vector store"));
        }

        let doc_id = self.next_doc_id;
        self.next_doc_id += 1;

        let paragraphs = split_paragraphs(text);
        let chunk_count = if paragraphs.is_empty() {
            tracing::warn!(doc_id, "Document produced no chunks");
            0
        } else {
            match self.encode(&paragraphs).await {
                Ok(embeddings) => {
                    let count = paragraphs.len();
                    for (chunk_index, (text, embedding)) in
                        paragraphs.into_iter().zip(embeddings).enumerate()
                    {
                        self.chunks.push(Chunk {
                            id: Uuid::new_v4().to_string(),
                            text,
                            embedding,
                            metadata: ChunkMetadata {
                                original_doc_id: doc_id,
                                chunk_index,
                                tags: tags.clone(),
                            },
                        });
                    }
                    count
                }
                Err(e) => {
                    tracing::error!(
                        doc_id,
                        error = %e,
                        "Embedding failed, document recorded with zero chunks"
                    );
                    0
                }
            }
        };

        self.documents.push(DocumentRecord { tags, chunk_count });
        tracing::info!(doc_id, chunks = chunk_count, "Document ingested");

        Ok(doc_id)
    }

    /// Scores every stored chunk and returns at most `k`, best first, keeping
    /// only strictly positive similarities.
    async fn search(&self, query: &str, k: usize) -> RagResult<Vec<ScoredChunk>> {
        if !self.initialized {
            return Err(RagError::not_initialized("vector store"));
        }
        if k == 0 || self.chunks.is_empty() {
            return Ok(vec![]);
        }

        let query_embedding = match self.embedder.embed_query(query).await {
            Ok(v) if v.len() == self.dimension => v,
            Ok(v) => {
                let err = RagError::DimensionMismatch {
                    expected: self.dimension,
                    actual: v.len(),
                };
                tracing::warn!(error = %err, "Query embedding rejected, returning no results");
                return Ok(vec![]);
            }
            Err(e) => {
                let err = RagError::Encoding(format!("{e:#}"));
                tracing::warn!(error = %err, "Query embedding failed, returning no results");
                return Ok(vec![]);
            }
        };

        let scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| (i, cosine_similarity(&query_embedding, &chunk.embedding)))
            .collect();

        let results: Vec<ScoredChunk> = select_top_k(scored, k)
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .map(|(i, score)| ScoredChunk {
                chunk: self.chunks[i].clone(),
                score,
            })
            .collect();

        tracing::debug!(k, returned = results.len(), "Vector search complete");
        Ok(results)
    }

    fn document_count(&self) -> usize {
        self.documents.len()
    }

    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// Calculate cosine similarity between two embeddings.
/// Returns a value in [-1, 1] where 1 means identical direction.
/// Returns 0.0 for edge cases (empty, mismatched length, zero norm, non-finite input).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot = dot_product(a, b);
    let norm_a = dot_product(a, a).sqrt();
    let norm_b = dot_product(b, b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (norm_a * norm_b);
    if similarity.is_finite() {
        (similarity as f32).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Accumulates in f64 so squares of tiny components never underflow to zero.
#[inline(always)]
fn dot_product(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

/// Descending by score, ascending by position on ties.
fn by_score_desc(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

/// Partition out the `k` best entries with a linear-time selection, then sort only those.
fn select_top_k(mut scored: Vec<(usize, f32)>, k: usize) -> Vec<(usize, f32)> {
    let k = k.min(scored.len());
    if k == 0 {
        return Vec::new();
    }
    if k < scored.len() {
        scored.select_nth_unstable_by(k - 1, by_score_desc);
        scored.truncate(k);
    }
    scored.sort_unstable_by(by_score_desc);
    scored
}
