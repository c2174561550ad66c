//! Memory-bounded record loading.
//!
//! A [`SourceLoader`] turns one source file into a filtered [`Chunk`]. Two
//! implementations share that contract:
//!
//! - [`StreamingLoader`] streams the file in-process, buffering at most
//!   `1.2 × max_records` parsed records before running the filter pipeline.
//! - [`HelperLoader`] delegates load-plus-filter to a native helper process.
//!
//! [`Loader::detect`] picks one by checking whether the helper exists.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::BufReader;
use tokio::process::Command;

use crate::chunk::Chunk;
use crate::error::AppError;
use crate::filter::RemovalSets;
use crate::lines::LineReader;
use crate::record::{Record, parse_line};

/// Helper stdout sentinel: result lines follow.
pub const PRINTING_LINES: &str = "!PrintingLines!";
/// Helper stdout sentinel: no more result lines.
pub const WORK_FINISHED: &str = "!WorkFinished!";

/// Loads one source file into a deduplicated, filtered chunk.
pub trait SourceLoader: Send + Sync {
    /// Load at most `max_records` surviving records from `path`.
    ///
    /// Reading may stop before the end of the source once enough records
    /// have survived filtering.
    fn load_source(
        &self,
        path: &Path,
        removal: &RemovalSets,
        max_records: usize,
    ) -> impl Future<Output = Result<Chunk, AppError>> + Send;
}

/// Load sources one after another until `max_total` records are collected.
///
/// Results are concatenated in source order and truncated to `max_total`.
pub async fn load_sources<L: SourceLoader>(
    loader: &L,
    paths: &[PathBuf],
    removal: &RemovalSets,
    max_total: usize,
) -> Result<Vec<Record>, AppError> {
    let mut records: Vec<Record> = Vec::new();

    for path in paths {
        if records.len() >= max_total {
            break;
        }
        tracing::info!(source = %path.display(), "Loading source");
        let chunk = loader.load_source(path, removal, max_total).await?;
        records.extend(chunk.into_records());
        if records.len() >= max_total {
            records.truncate(max_total);
            break;
        }
    }

    tracing::info!(records = records.len(), sources = paths.len(), "Sources loaded");
    Ok(records)
}

/// Size of the working buffer that triggers a filter pass.
fn buffer_limit(max_records: usize) -> usize {
    (max_records + max_records / 5).max(1)
}

// ---------------------------------------------------------------------------
// StreamingLoader
// ---------------------------------------------------------------------------

/// In-process loader: stream, buffer, filter, merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamingLoader;

impl StreamingLoader {
    pub fn new() -> Self {
        Self
    }
}

impl SourceLoader for StreamingLoader {
    async fn load_source(
        &self,
        path: &Path,
        removal: &RemovalSets,
        max_records: usize,
    ) -> Result<Chunk, AppError> {
        if max_records == 0 {
            return Ok(Chunk::new());
        }

        let mut reader = LineReader::open(path).await?;
        let limit = buffer_limit(max_records);
        let mut result = Chunk::new();
        let mut buffer = Chunk::new();

        while let Some(line) = reader.next_line().await? {
            let Some(record) = parse_line(&line) else {
                continue;
            };
            buffer.insert(record);
            if buffer.len() < limit {
                continue;
            }

            removal.apply(&mut buffer).await?;
            result.merge(std::mem::take(&mut buffer));
            tracing::debug!(source = %path.display(), collected = result.len(), "Filtered buffer");

            if result.len() > max_records {
                break;
            }
        }

        if !buffer.is_empty() {
            removal.apply(&mut buffer).await?;
            result.merge(buffer);
        }

        result.truncate(max_records);
        tracing::info!(source = %path.display(), records = result.len(), "Source chunk ready");
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// HelperLoader
// ---------------------------------------------------------------------------

/// Delegates load-plus-filter to a native helper executable.
///
/// Invoked as `helper <start_offset> <max_size> <source> [v1|path ...]`.
/// Stdout is progress text until [`PRINTING_LINES`], then one
/// `key<delim>secret` per line until [`WORK_FINISHED`].
#[derive(Debug, Clone)]
pub struct HelperLoader {
    executable: PathBuf,
    start_offset: u64,
}

impl HelperLoader {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            start_offset: 0,
        }
    }

    pub fn with_start_offset(mut self, offset: u64) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

/// Where the helper's stdout currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HelperPhase {
    Progress,
    Lines,
    Finished,
}

impl SourceLoader for HelperLoader {
    async fn load_source(
        &self,
        path: &Path,
        removal: &RemovalSets,
        max_records: usize,
    ) -> Result<Chunk, AppError> {
        tracing::info!(
            helper = %self.executable.display(),
            source = %path.display(),
            "Delegating load to helper"
        );

        let mut child = Command::new(&self.executable)
            .arg(self.start_offset.to_string())
            .arg(max_records.to_string())
            .arg(path)
            .args(removal.tagged_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::Helper(format!(
                    "failed to spawn {}: {e}",
                    self.executable.display()
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Helper("helper stdout not captured".into()))?;
        let mut reader = LineReader::new(BufReader::new(stdout), &self.executable);

        let mut chunk = Chunk::new();
        let mut phase = HelperPhase::Progress;
        while let Some(line) = reader.next_line().await? {
            if line.contains(WORK_FINISHED) {
                phase = HelperPhase::Finished;
                continue;
            }
            match phase {
                HelperPhase::Progress if line.contains(PRINTING_LINES) => {
                    phase = HelperPhase::Lines;
                }
                HelperPhase::Progress => {
                    if !line.is_empty() {
                        tracing::info!(helper = %line, "Helper progress");
                    }
                }
                HelperPhase::Lines => {
                    if let Some(record) = parse_line(&line) {
                        chunk.insert(record);
                    }
                }
                HelperPhase::Finished => {}
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AppError::Helper(format!("failed to wait for helper: {e}")))?;
        if !status.success() {
            return Err(AppError::Helper(format!("helper exited with {status}")));
        }
        if phase != HelperPhase::Finished {
            tracing::warn!(source = %path.display(), "Helper exited without finish marker");
        }

        chunk.truncate(max_records);
        tracing::info!(source = %path.display(), records = chunk.len(), "Helper chunk ready");
        Ok(chunk)
    }
}

// ---------------------------------------------------------------------------
// Loader factory
// ---------------------------------------------------------------------------

/// The loader chosen for this environment.
#[derive(Debug, Clone)]
pub enum Loader {
    Streaming(StreamingLoader),
    Helper(HelperLoader),
}

impl Loader {
    /// Use the native helper if it exists on disk, otherwise stream in-process.
    pub fn detect(helper_path: impl AsRef<Path>) -> Self {
        let helper_path = helper_path.as_ref();
        if helper_path.is_file() {
            tracing::info!(helper = %helper_path.display(), "Using native helper for loading");
            Loader::Helper(HelperLoader::new(helper_path))
        } else {
            Loader::Streaming(StreamingLoader::new())
        }
    }

    pub fn is_delegated(&self) -> bool {
        matches!(self, Loader::Helper(_))
    }
}

impl SourceLoader for Loader {
    async fn load_source(
        &self,
        path: &Path,
        removal: &RemovalSets,
        max_records: usize,
    ) -> Result<Chunk, AppError> {
        match self {
            Loader::Streaming(loader) => loader.load_source(path, removal, max_records).await,
            Loader::Helper(loader) => loader.load_source(path, removal, max_records).await,
        }
    }
}
