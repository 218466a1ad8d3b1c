//! Configuration loading for the pipeline binary
//!
//! Centralizes environment variable reading into a single struct.

use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_GENERATION_MODEL: &str = "mistral";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/// Generative inference is slow; five minutes per call.
pub const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 32;
/// 20 minutes per batch for large documents
pub const DEFAULT_EMBEDDING_TIMEOUT_SECS: u64 = 1200;
pub const DEFAULT_CONTEXT_SOURCE_TAG: &str = "web-search";

/// Which retrieval backend the assembler wires into the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieverKind {
    Vector,
    Keyword,
}

impl FromStr for RetrieverKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vector" => Ok(Self::Vector),
            "keyword" => Ok(Self::Keyword),
            other => Err(format!("unknown retriever '{other}' (expected vector or keyword)")),
        }
    }
}

/// Pipeline configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Ollama server URL shared by embedding and generation
    pub ollama_url: String,

    pub embedding_model: String,

    pub generation_model: String,

    pub temperature: f32,

    pub generation_timeout: Duration,

    /// Chunks sent per embedding request
    pub embedding_batch_size: usize,

    pub embedding_timeout: Duration,

    /// Index dimension; probed from the embedding backend when unset
    pub embedding_dim: Option<usize>,

    /// Documents ingested at startup
    pub documents_dir: String,

    /// Optional external search endpoint
    pub context_source_url: Option<String>,

    pub context_source_tag: String,

    pub retriever: RetrieverKind,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            ollama_url: text("OLLAMA_URL", DEFAULT_OLLAMA_URL)
                .trim_end_matches('/')
                .to_string(),
            embedding_model: text("OLLAMA_EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            generation_model: text("OLLAMA_GENERATION_MODEL", DEFAULT_GENERATION_MODEL),
            temperature: parsed(&lookup, "GENERATION_TEMPERATURE", DEFAULT_TEMPERATURE),
            generation_timeout: Duration::from_secs(parsed(
                &lookup,
                "GENERATION_TIMEOUT_SECS",
                DEFAULT_GENERATION_TIMEOUT_SECS,
            )),
            embedding_batch_size: parsed(
                &lookup,
                "EMBEDDING_BATCH_SIZE",
                DEFAULT_EMBEDDING_BATCH_SIZE,
            )
            .max(1),
            embedding_timeout: Duration::from_secs(parsed(
                &lookup,
                "EMBEDDING_TIMEOUT_SECS",
                DEFAULT_EMBEDDING_TIMEOUT_SECS,
            )),
            embedding_dim: lookup("EMBEDDING_DIM")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|dim| *dim > 0),
            documents_dir: text("DOCUMENTS_DIR", "./documents"),
            context_source_url: lookup("CONTEXT_SOURCE_URL").filter(|v| !v.trim().is_empty()),
            context_source_tag: text("CONTEXT_SOURCE_TAG", DEFAULT_CONTEXT_SOURCE_TAG),
            retriever: parsed(&lookup, "RETRIEVER", RetrieverKind::Vector),
        }
    }

    /// Build a summary string for logging
    pub fn summary(&self) -> String {
        format!(
            "OLLAMA={}  EMBED={}  GEN={}  DOCS_DIR={}  RETRIEVER={:?}",
            self.ollama_url,
            self.embedding_model,
            self.generation_model,
            self.documents_dir,
            self.retriever
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
                default
            }
        },
        None => default,
    }
}
