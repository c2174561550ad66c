//! Append-only result and log files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::metrics::Metrics;

/// Create `path` empty if it does not exist. Parent directories must exist.
pub async fn ensure_file(path: impl AsRef<Path>) -> Result<(), AppError> {
    let path = path.as_ref();
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| AppError::io(path, e))?;
    Ok(())
}

/// Append a `YYYY-MM-DD HH:MM:SS` line marking the start of a run.
pub async fn stamp_time(path: impl AsRef<Path>) -> Result<(), AppError> {
    let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    ResultFile::new(path.as_ref()).append(&stamp).await
}

/// An append-only text file. One entry per append, auto-created.
///
/// Clones share a lock so concurrent appends never interleave.
#[derive(Debug, Clone)]
pub struct ResultFile {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ResultFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `line` followed by a newline.
    pub async fn append(&self, line: &str) -> Result<(), AppError> {
        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AppError::io(&self.path, e))?;

        let mut entry = String::with_capacity(line.len() + 1);
        entry.push_str(line);
        entry.push('\n');
        file.write_all(entry.as_bytes())
            .await
            .map_err(|e| AppError::io(&self.path, e))?;
        file.flush().await.map_err(|e| AppError::io(&self.path, e))?;
        Ok(())
    }

    /// Append `line` and bump the named counter.
    pub async fn save(
        &self,
        line: &str,
        metrics: &Metrics,
        counter: &str,
    ) -> Result<(), AppError> {
        self.append(line).await?;
        metrics.inc(counter);
        Ok(())
    }
}
