use anyhow::Result;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::pipeline::Coordinator;
use crate::retrieval::{Retriever, Tags};

const TEXT_EXTENSIONS: [&str; 2] = ["txt", "md"];

fn is_text_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| TEXT_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Plain-text documents under `dir`, recursively, in a stable order.
pub fn discover(dir: impl AsRef<Path>) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_text_document(e.path()))
        .map(|e| e.into_path())
        .collect();
    paths.sort();
    paths
}

/// Ingest every document found under `dir`. Unreadable files are skipped.
/// Returns the number of documents handed to the index.
pub async fn load_documents<R: Retriever>(coordinator: &Coordinator<R>, dir: impl AsRef<Path>) -> Result<usize> {
    let mut loaded = 0;

    for path in discover(&dir) {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "Failed to read document");
                continue;
            }
        };

        let tags = Tags::from([
            ("file_name".to_string(), serde_json::json!(file_name)),
            ("path".to_string(), serde_json::json!(path.display().to_string())),
        ]);

        let doc_id = coordinator.ingest(&text, tags).await?;
        tracing::info!(doc_id, file = %file_name, "Loaded document");
        loaded += 1;
    }

    tracing::info!(documents = loaded, dir = %dir.as_ref().display(), "Document loading completed");
    Ok(loaded)
}
