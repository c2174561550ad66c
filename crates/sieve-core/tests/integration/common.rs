use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sieve_core::{
    AppError, Chunk, Record, RemovalSets, ResultFile, SourceLoader, TaskContext, TaskExecutor,
    TaskOutcome,
};

pub fn rec(key: &str, secret: &str) -> Record {
    Record::new(key, secret).unwrap()
}

/// Records `user<i>@x.com:pass<i>` for every `i` in the range.
pub fn records(range: std::ops::Range<usize>) -> Vec<Record> {
    range
        .map(|i| rec(&format!("user{i}@x.com"), &format!("pass{i}")))
        .collect()
}

/// Write `content` to `name` inside `dir` and return the path.
pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Counter and callback pair for `TaskPool::on_drain`.
pub fn drain_counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    (count, move || {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

// ---------------------------------------------------------------------------
// CountingExecutor
// ---------------------------------------------------------------------------

/// Executor that sleeps for a fixed time and records what it ran.
#[derive(Clone)]
pub struct CountingExecutor {
    delay: Duration,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    runs: Arc<Mutex<HashMap<Record, usize>>>,
}

impl CountingExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Shared handle on the completed counter.
    pub fn completed_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.completed)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// How many times `record` was executed.
    pub fn runs_of(&self, record: &Record) -> usize {
        self.runs.lock().unwrap().get(record).copied().unwrap_or(0)
    }

    pub fn total_runs(&self) -> usize {
        self.runs.lock().unwrap().values().sum()
    }
}

impl<R: Send + Sync + 'static> TaskExecutor<R> for CountingExecutor {
    async fn execute(
        &self,
        record: &Record,
        _resource: Option<&R>,
        _ctx: &TaskContext,
    ) -> Result<TaskOutcome, AppError> {
        *self.runs.lock().unwrap().entry(record.clone()).or_insert(0) += 1;
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(TaskOutcome::done())
    }
}

// ---------------------------------------------------------------------------
// CheckpointWriter
// ---------------------------------------------------------------------------

/// Executor that appends every record it runs to a checkpoint file.
#[derive(Clone)]
pub struct CheckpointWriter {
    output: ResultFile,
    delay: Duration,
}

impl CheckpointWriter {
    pub fn new(path: &Path, delay: Duration) -> Self {
        Self {
            output: ResultFile::new(path),
            delay,
        }
    }
}

impl<R: Send + Sync + 'static> TaskExecutor<R> for CheckpointWriter {
    async fn execute(
        &self,
        record: &Record,
        _resource: Option<&R>,
        ctx: &TaskContext,
    ) -> Result<TaskOutcome, AppError> {
        tokio::time::sleep(self.delay).await;
        self.output
            .save(&record.to_string(), ctx.metrics(), "checked")
            .await?;
        Ok(TaskOutcome::done())
    }
}

// ---------------------------------------------------------------------------
// ScriptedLoader
// ---------------------------------------------------------------------------

/// Loader serving scripted results in order, then empty chunks.
///
/// Records the value of an observed counter at every call.
#[derive(Clone)]
pub struct ScriptedLoader {
    script: Arc<Mutex<VecDeque<Result<Vec<Record>, String>>>>,
    observed: Arc<AtomicUsize>,
    observations: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedLoader {
    pub fn new(script: Vec<Result<Vec<Record>, String>>, observed: Arc<AtomicUsize>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            observed,
            observations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Observed counter values, one per call.
    pub fn observations(&self) -> Vec<usize> {
        self.observations.lock().unwrap().clone()
    }
}

impl SourceLoader for ScriptedLoader {
    async fn load_source(
        &self,
        _path: &Path,
        _removal: &RemovalSets,
        max_records: usize,
    ) -> Result<Chunk, AppError> {
        self.observations
            .lock()
            .unwrap()
            .push(self.observed.load(Ordering::SeqCst));
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(records)) => {
                let mut chunk: Chunk = records.into_iter().collect();
                chunk.truncate(max_records);
                Ok(chunk)
            }
            Some(Err(message)) => Err(AppError::Helper(message)),
            None => Ok(Chunk::new()),
        }
    }
}
