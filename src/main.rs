use anyhow::{Context, Result};
use std::num::NonZeroU8;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use local_rag_pipeline::config::{Config, RetrieverKind};
use local_rag_pipeline::context_source::{ContextSource, HttpContextSource, NoExternalContext};
use local_rag_pipeline::documents::load_documents;
use local_rag_pipeline::embeddings::OllamaEmbedder;
use local_rag_pipeline::generator::{Generator, OllamaGenerator};
use local_rag_pipeline::keyword_store::KeywordStore;
use local_rag_pipeline::logging::{LogSettings, setup_logging, spawn_log_cleanup_task};
use local_rag_pipeline::scheduler::{DEFAULT_PRIORITY, Priority};
use local_rag_pipeline::vector_store::VectorStore;
use local_rag_pipeline::{Coordinator, PipelineResult, Retriever, Tags};

/// One line of stdin input.
#[derive(Debug, PartialEq)]
enum Command {
    Status,
    Query { priority: Priority, query: String },
}

/// `status`, or `[priority] query` with a priority of 1 to 255. Blank lines yield `None`.
fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.eq_ignore_ascii_case("status") {
        return Some(Command::Status);
    }

    if let Some((head, rest)) = line.split_once(char::is_whitespace)
        && let Ok(priority) = head.parse::<NonZeroU8>()
        && !rest.trim().is_empty()
    {
        return Some(Command::Query {
            priority: priority.get(),
            query: rest.trim().to_string(),
        });
    }

    Some(Command::Query {
        priority: DEFAULT_PRIORITY,
        query: line.to_string(),
    })
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::error!(error = %e, "Failed to serialize output"),
    }
}

/// Accept commands until stdin closes or Ctrl-C, printing each result as it lands.
/// On end of input, waits for already submitted requests before stopping.
async fn serve<R: Retriever>(
    coordinator: Coordinator<R>,
    mut results: mpsc::UnboundedReceiver<PipelineResult>,
    config: &Config,
) -> Result<()> {
    coordinator.initialize().await?;
    load_documents(&coordinator, &config.documents_dir).await?;
    coordinator.start()?;

    let status = coordinator.get_status().await;
    tracing::info!(
        documents = status.documents_count,
        chunks = status.chunks_count,
        "Pipeline ready, reading queries from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
    let mut pending = 0usize;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    while input_open || pending > 0 {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                match line.context("Failed to read stdin")? {
                    Some(line) => match parse_command(&line) {
                        Some(Command::Status) => print_json(&coordinator.get_status().await),
                        Some(Command::Query { priority, query }) => {
                            coordinator.submit(query, priority, Tags::new());
                            pending += 1;
                        }
                        None => {}
                    },
                    None => {
                        tracing::info!(pending, "End of input");
                        input_open = false;
                    }
                }
            }
            Some(result) = results.recv() => {
                print_json(&result);
                pending = pending.saturating_sub(1);
            }
            _ = &mut shutdown => {
                tracing::info!("Interrupt received, shutting down");
                break;
            }
        }
    }

    coordinator.stop().await;
    while let Ok(result) = results.try_recv() {
        print_json(&result);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    let log_settings = LogSettings::from_env();
    setup_logging(&log_settings)?;
    let _log_cleanup = spawn_log_cleanup_task(&log_settings);

    let config = Config::from_env();
    tracing::info!("{}", config.summary());
    tokio::fs::create_dir_all(&config.documents_dir)
        .await
        .with_context(|| format!("Failed to create documents directory {}", config.documents_dir))?;

    let generator: Arc<dyn Generator> = Arc::new(OllamaGenerator::from_config(&config)?);
    let context_source: Arc<dyn ContextSource> = match HttpContextSource::from_config(&config)? {
        Some(source) => {
            tracing::info!(tag = %config.context_source_tag, "External context source enabled");
            Arc::new(source)
        }
        None => Arc::new(NoExternalContext),
    };
    let (results_tx, results_rx) = mpsc::unbounded_channel();

    match config.retriever {
        RetrieverKind::Vector => {
            let embedder = OllamaEmbedder::from_config(&config)?;
            embedder.verify().await?;
            let dimension = match config.embedding_dim {
                Some(dimension) => dimension,
                None => embedder.probe_dimension().await?,
            };
            tracing::info!(dimension, model = %config.embedding_model, "Using vector retriever");

            let store = VectorStore::new(Arc::new(embedder), dimension, config.embedding_batch_size);
            let coordinator =
                Coordinator::with_context_source(store, generator, context_source, results_tx);
            serve(coordinator, results_rx, &config).await
        }
        RetrieverKind::Keyword => {
            tracing::info!("Using keyword retriever");
            let coordinator = Coordinator::with_context_source(
                KeywordStore::new(),
                generator,
                context_source,
                results_tx,
            );
            serve(coordinator, results_rx, &config).await
        }
    }
}
