//! Retrieval, augmentation and generation for one request at a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc};

use crate::context_source::{ContextItem, ContextSource, NoExternalContext};
use crate::error::{RagError, RagResult};
use crate::generator::Generator;
use crate::retrieval::{DocumentId, Retriever, ScoredChunk, Tags};
use crate::scheduler::{Priority, QueueStatus, Request, RequestHandler, RequestId, RequestScheduler, SchedulerState};

/// Number of local chunks retrieved per request.
pub const RETRIEVAL_K: usize = 3;

const NO_CONTEXT_MESSAGE: &str = "No relevant context found for this query";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    NoContext,
    Error,
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Per-stage durations, serialized as fractional seconds. Stages that never ran
/// are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StageTimings {
    #[serde(serialize_with = "as_secs")]
    pub retrieval: Duration,
    #[serde(serialize_with = "as_secs")]
    pub augmentation: Duration,
    #[serde(serialize_with = "as_secs")]
    pub generation: Duration,
    #[serde(serialize_with = "as_secs")]
    pub total: Duration,
}

impl StageTimings {
    fn new(retrieval: Duration, augmentation: Duration, generation: Duration) -> Self {
        Self {
            retrieval,
            augmentation,
            generation,
            total: retrieval + augmentation + generation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMetadata {
    pub local_count: usize,
    pub external_count: usize,
    pub priority: Priority,
}

/// Outcome of processing one request. Built once, never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub request_id: RequestId,
    pub status: PipelineStatus,
    pub query: String,
    pub retrieved_chunks: Vec<ScoredChunk>,
    pub external_context: Vec<ContextItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_answer: Option<String>,
    pub timings: StageTimings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub metadata: ResultMetadata,
    pub completed_at: DateTime<Utc>,
}

impl PipelineResult {
    fn empty(request: &Request, status: PipelineStatus, timings: StageTimings, message: String) -> Self {
        Self {
            request_id: request.id,
            status,
            query: request.query.clone(),
            retrieved_chunks: Vec::new(),
            external_context: Vec::new(),
            generated_answer: None,
            timings,
            message: Some(message),
            metadata: ResultMetadata {
                local_count: 0,
                external_count: 0,
                priority: request.priority,
            },
            completed_at: Utc::now(),
        }
    }
}

/// Operational snapshot for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub status: &'static str,
    pub documents_count: usize,
    pub chunks_count: usize,
    pub queue_size: usize,
    pub scheduler: SchedulerState,
    pub timestamp: DateTime<Utc>,
}

/// The request handler run by the scheduler's consumer.
struct Pipeline<R> {
    retriever: Arc<RwLock<R>>,
    context_source: Arc<dyn ContextSource>,
    generator: Arc<dyn Generator>,
    results: mpsc::UnboundedSender<PipelineResult>,
}

impl<R: Retriever> Pipeline<R> {
    async fn process(&self, request: &Request) -> PipelineResult {
        let retrieval_start = Instant::now();
        let retrieved = {
            let retriever = self.retriever.read().await;
            retriever.search(&request.query, RETRIEVAL_K).await
        };
        let retrieval = retrieval_start.elapsed();

        let retrieved = match retrieved {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::error!(request_id = %request.id, error = %e, "Retrieval failed");
                return PipelineResult::empty(
                    request,
                    PipelineStatus::Error,
                    StageTimings::new(retrieval, Duration::ZERO, Duration::ZERO),
                    format!("Retrieval failed: {e}"),
                );
            }
        };

        let augmentation_start = Instant::now();
        let external = self.context_source.fetch(&request.query).await;
        let context: Vec<ContextItem> = retrieved
            .iter()
            .map(ContextItem::from)
            .chain(external.iter().cloned())
            .collect();
        let augmentation = augmentation_start.elapsed();

        tracing::debug!(
            request_id = %request.id,
            local = retrieved.len(),
            external = external.len(),
            "Context merged"
        );

        if context.is_empty() {
            return PipelineResult::empty(
                request,
                PipelineStatus::NoContext,
                StageTimings::new(retrieval, augmentation, Duration::ZERO),
                NO_CONTEXT_MESSAGE.to_string(),
            );
        }

        let generation_start = Instant::now();
        let generated = self.generator.generate(&request.query, &context).await;
        let timings = StageTimings::new(retrieval, augmentation, generation_start.elapsed());

        match generated {
            Ok(answer) => PipelineResult {
                request_id: request.id,
                status: PipelineStatus::Success,
                query: request.query.clone(),
                metadata: ResultMetadata {
                    local_count: retrieved.len(),
                    external_count: external.len(),
                    priority: request.priority,
                },
                retrieved_chunks: retrieved,
                external_context: external,
                generated_answer: Some(answer),
                timings,
                message: None,
                completed_at: Utc::now(),
            },
            Err(e) => {
                let err = RagError::from(e);
                tracing::error!(request_id = %request.id, error = %err, "Generation failed");
                PipelineResult::empty(
                    request,
                    PipelineStatus::Error,
                    timings,
                    format!("Generation failed: {err}"),
                )
            }
        }
    }
}

#[async_trait]
impl<R: Retriever> RequestHandler for Pipeline<R> {
    async fn handle(&self, request: Request) -> anyhow::Result<()> {
        let result = self.process(&request).await;
        tracing::info!(
            request_id = %result.request_id,
            status = ?result.status,
            total_ms = result.timings.total.as_millis() as u64,
            "Request completed"
        );

        if self.results.send(result).is_err() {
            tracing::warn!(request_id = %request.id, "Result receiver closed, dropping result");
        }
        Ok(())
    }
}

/// Owns the retriever and the scheduler, and turns queued requests into
/// [`PipelineResult`]s delivered on the results channel.
pub struct Coordinator<R: Retriever> {
    pipeline: Arc<Pipeline<R>>,
    scheduler: RequestScheduler,
}

impl<R: Retriever> Coordinator<R> {
    pub fn new(
        retriever: R,
        generator: Arc<dyn Generator>,
        results: mpsc::UnboundedSender<PipelineResult>,
    ) -> Self {
        Self::with_context_source(retriever, generator, Arc::new(NoExternalContext), results)
    }

    pub fn with_context_source(
        retriever: R,
        generator: Arc<dyn Generator>,
        context_source: Arc<dyn ContextSource>,
        results: mpsc::UnboundedSender<PipelineResult>,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                retriever: Arc::new(RwLock::new(retriever)),
                context_source,
                generator,
                results,
            }),
            scheduler: RequestScheduler::new(),
        }
    }

    pub async fn initialize(&self) -> RagResult<()> {
        self.pipeline.retriever.write().await.initialize().await
    }

    /// Index a document. Waits for any in-flight search to finish.
    pub async fn ingest(&self, text: &str, tags: Tags) -> RagResult<DocumentId> {
        self.pipeline.retriever.write().await.ingest(text, tags).await
    }

    pub fn submit(&self, query: impl Into<String>, priority: Priority, metadata: Tags) -> RequestId {
        self.scheduler.submit(query, priority, metadata)
    }

    pub fn start(&self) -> RagResult<()> {
        self.scheduler.start(self.pipeline.clone())
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await
    }

    /// Run one request through the pipeline directly, bypassing the queue.
    pub async fn process(&self, request: &Request) -> PipelineResult {
        self.pipeline.process(request).await
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.scheduler.status()
    }

    pub async fn get_status(&self) -> SystemStatus {
        let (documents_count, chunks_count) = {
            let retriever = self.pipeline.retriever.read().await;
            (retriever.document_count(), retriever.chunk_count())
        };

        SystemStatus {
            status: "operational",
            documents_count,
            chunks_count,
            queue_size: self.scheduler.status().queue_size,
            scheduler: self.scheduler.state(),
            timestamp: Utc::now(),
        }
    }
}
