//! Queue-of-sources files: one path per line naming `.txt` sources or
//! directories of them.

use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::lines::LineReader;

/// Returns true if the path looks like a text source.
fn is_text_source(path: &Path) -> bool {
    path.to_string_lossy().contains(".txt")
}

/// Resolve a queue file into the list of source files it names.
///
/// - a line naming a `.txt` file is taken as is,
/// - a line naming a directory expands to its immediate `.txt` children
///   (sorted by name),
/// - anything else, including paths that do not exist, is skipped.
///
/// A missing queue file is created empty.
pub async fn resolve_queue(queue_path: impl AsRef<Path>) -> Result<Vec<PathBuf>, AppError> {
    let queue_path = queue_path.as_ref();
    crate::output::ensure_file(queue_path).await?;

    let mut reader = LineReader::open(queue_path).await?;
    let mut sources = Vec::new();

    while let Some(line) = reader.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let path = PathBuf::from(line);
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            tracing::warn!(path = %path.display(), "Queued source does not exist, skipping");
            continue;
        };

        if meta.is_file() && is_text_source(&path) {
            sources.push(path);
        } else if meta.is_dir() {
            sources.extend(text_children(&path).await?);
        }
    }

    tracing::info!(queue = %queue_path.display(), sources = sources.len(), "Resolved source queue");
    Ok(sources)
}

async fn text_children(dir: &Path) -> Result<Vec<PathBuf>, AppError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| AppError::io(dir, e))?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(|e| AppError::io(dir, e))? {
        let path = entry.path();
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if is_file && is_text_source(&path) {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}
