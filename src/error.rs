//! Error taxonomy shared by the index, scheduler and coordinator.

use thiserror::Error;

/// Errors surfaced by library components.
///
/// Only `NotInitialized`, `DimensionMismatch` and `SchedulerRunning` ever reach a
/// caller directly. Encoding and generation failures are recovered where they
/// happen and turned into data (an empty search, a zero-chunk document, or an
/// `error` pipeline result).
#[derive(Debug, Error)]
pub enum RagError {
    #[error("{component} used before initialize()")]
    NotInitialized { component: &'static str },
    #[error("embedding backend failed: {0}")]
    Encoding(String),
    #[error("embedding dimension mismatch: index expects {expected}, backend returned {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("request handler fault: {0}")]
    HandlerFault(String),
    #[error("scheduler is already running")]
    SchedulerRunning,
}

impl RagError {
    pub fn not_initialized(component: &'static str) -> Self {
        Self::NotInitialized { component }
    }
}

/// Failures of the generation service, distinguishable by subtype.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("cannot connect to generation service at {url}")]
    ConnectionRefused { url: String },
    #[error("generation timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("unexpected response from generation service: {0}")]
    MalformedResponse(String),
    #[error("generation service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generation request failed: {0}")]
    Transport(String),
}

pub type RagResult<T> = Result<T, RagError>;
