//! Local retrieval-augmented generation: a cosine similarity index, a priority
//! request scheduler with one serialized consumer, and the coordinator that runs
//! retrieval, context augmentation and generation for each request.

pub mod config;
pub mod context_source;
pub mod documents;
pub mod embeddings;
pub mod error;
pub mod generator;
pub mod keyword_store;
pub mod logging;
pub mod pipeline;
pub mod retrieval;
pub mod scheduler;
pub mod splitter;
pub mod vector_store;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{GenerationError, RagError, RagResult};
pub use pipeline::{Coordinator, PipelineResult, PipelineStatus, SystemStatus};
pub use retrieval::{Retriever, Tags};
pub use scheduler::{Request, RequestId, RequestScheduler};
