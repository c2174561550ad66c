use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::AppError;
use crate::metrics::Metrics;
use crate::pool::PoolHandle;
use crate::record::{Record, RecordSchema};

/// Lifecycle of a single record inside the task pool.
///
/// ```text
/// Queued -> InFlight -> Completed
///                    -> FailedLogged
///                    -> Requeued -> Queued
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    InFlight,
    Completed,
    FailedLogged,
    Requeued,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::InFlight => "in_flight",
            TaskState::Completed => "completed",
            TaskState::FailedLogged => "failed",
            TaskState::Requeued => "requeued",
        }
    }

    /// True once the record has left the pool for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::FailedLogged)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of the task pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Constructed, not started.
    Idle,
    /// Records are queued.
    Running,
    /// Queue is empty, some records are still in flight.
    Draining,
    /// Nothing queued or in flight; the drain callback has fired.
    Drained,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Idle => "idle",
            PoolState::Running => "running",
            PoolState::Draining => "draining",
            PoolState::Drained => "drained",
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PoolState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(PoolState::Idle),
            "running" => Ok(PoolState::Running),
            "draining" => Ok(PoolState::Draining),
            "drained" => Ok(PoolState::Drained),
            _ => Err(format!("Unknown pool state: {}", s)),
        }
    }
}

/// What an executor reports back after handling a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Return the leased resource to the pool. When false the handle is
    /// retired and stays counted as leased.
    pub release_resource: bool,
}

impl TaskOutcome {
    /// Finished; hand the resource back.
    pub fn done() -> Self {
        Self {
            release_resource: true,
        }
    }

    /// Finished; the resource is unusable and must not be reused.
    pub fn retire_resource() -> Self {
        Self {
            release_resource: false,
        }
    }
}

impl Default for TaskOutcome {
    fn default() -> Self {
        Self::done()
    }
}

/// Per-task view of the pool handed to executors.
pub struct TaskContext {
    handle: PoolHandle,
    task_id: u64,
    requeue: AtomicBool,
}

impl TaskContext {
    pub(crate) fn new(handle: PoolHandle, task_id: u64) -> Self {
        Self {
            handle,
            task_id,
            requeue: AtomicBool::new(false),
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Put this record back in the queue once the executor returns.
    pub fn requeue(&self) {
        self.requeue.store(true, Ordering::Release);
    }

    pub(crate) fn requeue_requested(&self) -> bool {
        self.requeue.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Metrics {
        self.handle.metrics()
    }

    pub fn schema(&self) -> &RecordSchema {
        self.handle.schema()
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.handle
    }
}

/// The externally supplied work run against each record.
///
/// `resource` is `Some` when the pool leases resources. Failures are logged
/// and the record dropped; call [`TaskContext::requeue`] to retry instead.
pub trait TaskExecutor<R>: Send + Sync + 'static {
    fn execute(
        &self,
        record: &Record,
        resource: Option<&R>,
        ctx: &TaskContext,
    ) -> impl Future<Output = Result<TaskOutcome, AppError>> + Send;
}
