//! Fixed-concurrency task pool.
//!
//! The pool owns the queue of pending records and the set of records in
//! flight. A record moves from the queue into the in-flight set in one step
//! under the pool lock, so it is never in both and never in neither while a
//! worker holds it. At most `concurrency` records are in flight.
//!
//! When the queue and the in-flight set are both empty (and nobody holds the
//! pool open, see [`PoolHandle::hold_open`]) the pool is drained: the drain
//! callback fires exactly once, metrics reporting stops and the workers exit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::output::ResultFile;
use crate::record::{Record, RecordSchema};
use crate::resource_pool::ResourcePool;
use crate::task::{PoolState, TaskContext, TaskExecutor, TaskState};

/// Counter bumped for failures classified as expected noise.
pub const TRANSIENT_COUNTER: &str = "transient";
/// Counter bumped for failures that were logged.
pub const ERROR_COUNTER: &str = "errors";

type DrainCallback = Box<dyn FnOnce() + Send>;
type FatalHook = Arc<dyn Fn(&AppError) + Send + Sync>;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events emitted by the pool for monitoring/logging.
#[derive(Debug, Clone)]
pub enum PoolEvent<'a> {
    Started {
        collection: &'a str,
        records: usize,
        concurrency: usize,
    },
    TaskStarted {
        task_id: u64,
        record: &'a Record,
    },
    TaskFinished {
        task_id: u64,
        record: &'a Record,
        state: TaskState,
    },
    TaskFailed {
        task_id: u64,
        record: &'a Record,
        error: &'a str,
    },
    TransientFailure {
        task_id: u64,
        error: &'a str,
    },
    RecordsAdded {
        count: usize,
    },
    Paused,
    Resumed,
    Metrics {
        snapshot: &'a MetricsSnapshot,
    },
    Drained {
        collection: &'a str,
    },
    Fatal {
        error: &'a str,
    },
}

/// Trait for receiving pool events (decoupled logging).
pub trait PoolReporter: Send + Sync {
    fn report(&self, event: PoolEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPoolReporter;

impl PoolReporter for TracingPoolReporter {
    fn report(&self, event: PoolEvent<'_>) {
        match event {
            PoolEvent::Started {
                collection,
                records,
                concurrency,
            } => {
                tracing::info!(
                    %collection,
                    %records,
                    %concurrency,
                    "Start {} processing",
                    collection
                );
            }
            PoolEvent::TaskStarted { task_id, record } => {
                tracing::debug!(%task_id, key = %record.key(), "Task started");
            }
            PoolEvent::TaskFinished {
                task_id,
                record,
                state,
            } => {
                tracing::debug!(%task_id, key = %record.key(), %state, "Task finished");
            }
            PoolEvent::TaskFailed {
                task_id,
                record,
                error,
            } => {
                tracing::error!(%task_id, %record, %error, "Task failed");
            }
            PoolEvent::TransientFailure { task_id, error } => {
                tracing::debug!(%task_id, %error, "Transient failure");
            }
            PoolEvent::RecordsAdded { count } => {
                tracing::info!(%count, "Records added");
            }
            PoolEvent::Paused => {
                tracing::debug!("Pool paused");
            }
            PoolEvent::Resumed => {
                tracing::debug!("Pool resumed");
            }
            PoolEvent::Metrics { snapshot } => {
                tracing::info!("{}", snapshot);
            }
            PoolEvent::Drained { collection } => {
                tracing::info!(%collection, "All {} have been processed", collection);
            }
            PoolEvent::Fatal { error } => {
                tracing::error!(%error, "Fatal error, terminating");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for a task pool.
#[derive(Debug, Clone)]
pub struct TaskPoolConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Name of the record collection the pool drains.
    pub collection: String,
    /// Lease a resource for every task.
    pub uses_resources: bool,
    /// Interval between metrics reports.
    pub metrics_interval: Duration,
    /// Delay before a released resource becomes available again.
    pub release_delay: Duration,
    /// Slot names used when records are written out.
    pub schema: RecordSchema,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            collection: "records".to_string(),
            uses_resources: false,
            metrics_interval: Duration::from_secs(5),
            release_delay: Duration::from_millis(1),
            schema: RecordSchema::default(),
        }
    }
}

impl TaskPoolConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_collection(mut self, name: impl Into<String>) -> Self {
        self.collection = name.into();
        self
    }

    pub fn with_resources(mut self, uses_resources: bool) -> Self {
        self.uses_resources = uses_resources;
        self
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    pub fn with_schema(mut self, schema: RecordSchema) -> Self {
        self.schema = schema;
        self
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueueState {
    queue: VecDeque<Record>,
    in_flight: HashMap<u64, Record>,
    requeue_on_finish: HashSet<u64>,
    next_task_id: u64,
    state: PoolState,
    paused: bool,
    holds: usize,
}

impl QueueState {
    /// Recompute the pool state. Returns true on the transition to drained.
    fn settle(&mut self) -> bool {
        if matches!(self.state, PoolState::Idle | PoolState::Drained) {
            return false;
        }
        if !self.queue.is_empty() {
            self.state = PoolState::Running;
            return false;
        }
        if self.in_flight.is_empty() && !self.paused && self.holds == 0 {
            self.state = PoolState::Drained;
            return true;
        }
        self.state = PoolState::Draining;
        false
    }
}

struct PoolShared {
    state: Mutex<QueueState>,
    notify: Notify,
    metrics: Metrics,
    schema: RecordSchema,
    collection: String,
    error_log: Mutex<Option<ResultFile>>,
    reporter: Mutex<Arc<dyn PoolReporter>>,
    on_drain: Mutex<Option<DrainCallback>>,
    fatal_hook: Mutex<FatalHook>,
    stop_metrics: CancellationToken,
    state_tx: watch::Sender<PoolState>,
}

/// Lock a std mutex, recovering from poison.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned pool mutex");
        poisoned.into_inner()
    })
}

impl PoolShared {
    fn report(&self, event: PoolEvent<'_>) {
        let reporter = Arc::clone(&lock(&self.reporter));
        reporter.report(event);
    }

    fn depth(&self) -> Option<usize> {
        let st = lock(&self.state);
        if st.state == PoolState::Idle {
            return None;
        }
        Some(st.queue.len() + st.in_flight.len())
    }

    fn report_metrics(&self) {
        let snapshot = self.metrics.snapshot(self.depth());
        self.report(PoolEvent::Metrics {
            snapshot: &snapshot,
        });
    }

    /// Runs once, on the transition to drained.
    fn on_drained(&self) {
        self.report(PoolEvent::Drained {
            collection: &self.collection,
        });
        self.stop_metrics.cancel();
        self.state_tx.send_replace(PoolState::Drained);
        self.notify.notify_waiters();
        let callback = lock(&self.on_drain).take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Wait for the next record and move it into the in-flight set.
    ///
    /// Returns `None` once the pool is drained.
    async fn next_task(&self) -> Option<(u64, Record)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = lock(&self.state);
                if st.state == PoolState::Drained {
                    return None;
                }
                if !st.paused
                    && st.state != PoolState::Idle
                    && let Some(record) = st.queue.pop_front()
                {
                    let task_id = st.next_task_id;
                    st.next_task_id += 1;
                    st.in_flight.insert(task_id, record.clone());
                    st.settle();
                    return Some((task_id, record));
                }
            }

            notified.await;
        }
    }

    /// Remove a task from the in-flight set, putting it back in the queue
    /// if it asked for a requeue or one was requested while it ran.
    fn finish(&self, task_id: u64, state: TaskState) {
        let mut st = lock(&self.state);
        let Some(record) = st.in_flight.remove(&task_id) else {
            return;
        };
        let state = if st.requeue_on_finish.remove(&task_id) {
            TaskState::Requeued
        } else {
            state
        };
        let requeued = state == TaskState::Requeued;
        if requeued {
            st.queue.push_back(record.clone());
        }
        let drained = st.settle();
        drop(st);

        self.report(PoolEvent::TaskFinished {
            task_id,
            record: &record,
            state,
        });
        if requeued {
            self.notify.notify_waiters();
        }
        if drained {
            self.on_drained();
        }
    }

    fn enqueue(&self, records: Vec<Record>) -> Result<usize, AppError> {
        let count = records.len();
        {
            let mut st = lock(&self.state);
            if st.state == PoolState::Drained {
                return Err(AppError::Pool(format!(
                    "cannot add records, '{}' already drained",
                    self.collection
                )));
            }
            st.queue.extend(records);
            st.settle();
        }
        self.notify.notify_waiters();
        Ok(count)
    }

    fn release_hold(&self) {
        let drained = {
            let mut st = lock(&self.state);
            st.holds = st.holds.saturating_sub(1);
            st.settle()
        };
        if drained {
            self.on_drained();
        }
    }
}

// ---------------------------------------------------------------------------
// PoolHandle
// ---------------------------------------------------------------------------

/// Cheap, cloneable handle for observing and feeding a pool.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl PoolHandle {
    /// Append records to the live queue. Allowed before start, while
    /// running and while paused; rejected once drained.
    pub fn add_records(&self, records: Vec<Record>) -> Result<usize, AppError> {
        let count = self.shared.enqueue(records)?;
        self.shared.report(PoolEvent::RecordsAdded { count });
        Ok(count)
    }

    /// Put a specific record back in the queue for another attempt.
    ///
    /// If an equal record is currently in flight it is requeued when its
    /// task finishes, so it never sits in the queue and in flight at once.
    pub fn requeue(&self, record: Record) -> Result<(), AppError> {
        {
            let mut st = lock(&self.shared.state);
            let in_flight = st
                .in_flight
                .iter()
                .find(|(_, r)| **r == record)
                .map(|(id, _)| *id);
            if let Some(task_id) = in_flight {
                st.requeue_on_finish.insert(task_id);
                return Ok(());
            }
        }
        self.shared.enqueue(vec![record]).map(|_| ())
    }

    /// Stop handing out records. Queued records are kept and enqueuing
    /// stays allowed.
    pub fn pause(&self) {
        lock(&self.shared.state).paused = true;
        self.shared.report(PoolEvent::Paused);
    }

    /// Continue handing out records.
    pub fn resume(&self) {
        let drained = {
            let mut st = lock(&self.shared.state);
            st.paused = false;
            st.settle()
        };
        self.shared.report(PoolEvent::Resumed);
        self.shared.notify.notify_waiters();
        if drained {
            self.shared.on_drained();
        }
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.shared.state).paused
    }

    /// Queued plus in-flight records, or `None` before the pool starts.
    pub fn depth(&self) -> Option<usize> {
        self.shared.depth()
    }

    pub fn queued(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.shared.state).in_flight.len()
    }

    /// Every record currently queued or in flight.
    pub fn pending_records(&self) -> HashSet<Record> {
        let st = lock(&self.shared.state);
        st.queue
            .iter()
            .chain(st.in_flight.values())
            .cloned()
            .collect()
    }

    pub fn state(&self) -> PoolState {
        lock(&self.shared.state).state
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.shared.schema
    }

    /// Defer draining while the returned guard is alive.
    ///
    /// Used by feeders that will add more records later: the pool waits
    /// for them instead of draining when it runs dry.
    pub fn hold_open(&self) -> DrainHold {
        lock(&self.shared.state).holds += 1;
        DrainHold {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Wait until the pool has drained.
    pub async fn wait_drained(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == PoolState::Drained).await;
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = lock(&self.shared.state);
        f.debug_struct("PoolHandle")
            .field("collection", &self.shared.collection)
            .field("state", &st.state)
            .field("queued", &st.queue.len())
            .field("in_flight", &st.in_flight.len())
            .finish_non_exhaustive()
    }
}

/// Keeps a pool from draining until dropped.
pub struct DrainHold {
    shared: Arc<PoolShared>,
}

impl Drop for DrainHold {
    fn drop(&mut self) {
        self.shared.release_hold();
    }
}

// ---------------------------------------------------------------------------
// TaskPool
// ---------------------------------------------------------------------------

/// Fixed-concurrency worker engine over a queue of records.
pub struct TaskPool<R, E> {
    config: TaskPoolConfig,
    shared: Arc<PoolShared>,
    collections: HashMap<String, Vec<Record>>,
    executor: Option<Arc<E>>,
    resources: Option<ResourcePool<R>>,
    has_drain_callback: bool,
    workers: Vec<JoinHandle<()>>,
}

impl<R, E> TaskPool<R, E>
where
    R: Send + Sync + 'static,
    E: TaskExecutor<R>,
{
    pub fn new(config: TaskPoolConfig) -> Self {
        Self::with_metrics(config, Metrics::default())
    }

    pub fn with_metrics(config: TaskPoolConfig, metrics: Metrics) -> Self {
        let (state_tx, _) = watch::channel(PoolState::Idle);
        let default_hook: FatalHook = Arc::new(|error: &AppError| {
            tracing::error!(%error, "Terminating process");
            std::process::exit(1);
        });
        let shared = PoolShared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                in_flight: HashMap::new(),
                requeue_on_finish: HashSet::new(),
                next_task_id: 0,
                state: PoolState::Idle,
                paused: false,
                holds: 0,
            }),
            notify: Notify::new(),
            metrics,
            schema: config.schema.clone(),
            collection: config.collection.clone(),
            error_log: Mutex::new(None),
            reporter: Mutex::new(Arc::new(TracingPoolReporter)),
            on_drain: Mutex::new(None),
            fatal_hook: Mutex::new(default_hook),
            stop_metrics: CancellationToken::new(),
            state_tx,
        };
        Self {
            config,
            shared: Arc::new(shared),
            collections: HashMap::new(),
            executor: None,
            resources: None,
            has_drain_callback: false,
            workers: Vec::new(),
        }
    }

    /// Register a named record collection.
    pub fn with_records(mut self, name: impl Into<String>, records: Vec<Record>) -> Self {
        self.collections.insert(name.into(), records);
        self
    }

    pub fn with_executor(mut self, executor: E) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    pub fn with_resources(mut self, resources: ResourcePool<R>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_reporter(self, reporter: impl PoolReporter + 'static) -> Self {
        *lock(&self.shared.reporter) = Arc::new(reporter);
        self
    }

    /// Append unclassified task failures to this file.
    pub fn with_error_log(self, file: ResultFile) -> Self {
        *lock(&self.shared.error_log) = Some(file);
        self
    }

    /// Called once when the pool drains.
    pub fn on_drain(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        *lock(&self.shared.on_drain) = Some(Box::new(callback));
        self.has_drain_callback = true;
        self
    }

    /// Replace the default fatal handling (log and exit the process).
    pub fn on_fatal(self, hook: impl Fn(&AppError) + Send + Sync + 'static) -> Self {
        *lock(&self.shared.fatal_hook) = Arc::new(hook);
        self
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Start metrics reporting and the workers.
    pub fn start(&mut self) -> Result<PoolHandle, AppError> {
        if self.handle().state() != PoolState::Idle {
            return Err(AppError::Pool("pool already started".into()));
        }
        if self.config.concurrency == 0 {
            return Err(AppError::Config("concurrency must be at least 1".into()));
        }
        if self.config.metrics_interval.is_zero() {
            return Err(AppError::Config("metrics interval must be non-zero".into()));
        }
        let executor = self
            .executor
            .clone()
            .ok_or_else(|| AppError::Config("task handler not defined".into()))?;
        if !self.has_drain_callback {
            return Err(AppError::Config("drain callback not defined".into()));
        }
        if self.config.uses_resources && self.resources.is_none() {
            return Err(AppError::Config(
                "pool uses resources but no resource pool was given".into(),
            ));
        }
        let records = match self.collections.remove(&self.config.collection) {
            Some(records) if !records.is_empty() => records,
            _ => {
                return Err(AppError::Pool(format!(
                    "nothing in '{}' to process",
                    self.config.collection
                )));
            }
        };

        let total = records.len();
        {
            let mut st = lock(&self.shared.state);
            st.queue.extend(records);
            st.state = PoolState::Running;
            st.settle();
        }
        self.shared.state_tx.send_replace(PoolState::Running);
        self.shared.report(PoolEvent::Started {
            collection: &self.config.collection,
            records: total,
            concurrency: self.config.concurrency,
        });

        self.spawn_metrics_reporter();

        let resources = if self.config.uses_resources {
            self.resources.clone()
        } else {
            None
        };
        for _ in 0..self.config.concurrency {
            let worker = Worker {
                shared: Arc::clone(&self.shared),
                executor: Arc::clone(&executor),
                resources: resources.clone(),
                release_delay: self.config.release_delay,
            };
            self.workers.push(tokio::spawn(worker.run()));
        }

        Ok(self.handle())
    }

    fn spawn_metrics_reporter(&self) {
        let shared = Arc::clone(&self.shared);
        let interval = self.config.metrics_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => shared.report_metrics(),
                    () = shared.stop_metrics.cancelled() => {
                        shared.report_metrics();
                        break;
                    }
                }
            }
        });
    }

    /// Wait for every worker to exit. Workers exit once the pool drains.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker<R, E> {
    shared: Arc<PoolShared>,
    executor: Arc<E>,
    resources: Option<ResourcePool<R>>,
    release_delay: Duration,
}

impl<R, E> Worker<R, E>
where
    R: Send + Sync + 'static,
    E: TaskExecutor<R>,
{
    async fn run(self) {
        while let Some((task_id, record)) = self.shared.next_task().await {
            let state = self.process(task_id, &record).await;
            self.shared.finish(task_id, state);
        }
    }

    /// Run one task and decide where its record goes next.
    async fn process(&self, task_id: u64, record: &Record) -> TaskState {
        let resource = match &self.resources {
            Some(pool) => Some(pool.checkout().await),
            None => None,
        };

        self.shared.report(PoolEvent::TaskStarted { task_id, record });

        let ctx = TaskContext::new(
            PoolHandle {
                shared: Arc::clone(&self.shared),
            },
            task_id,
        );
        let result = AssertUnwindSafe(self.executor.execute(record, resource.as_ref(), &ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(AppError::Task(panic_message(panic.as_ref()))));

        let release = match &result {
            Ok(outcome) => outcome.release_resource,
            Err(_) => true,
        };
        if let (Some(pool), Some(handle)) = (&self.resources, resource) {
            if release {
                pool.release(handle, self.release_delay);
            } else {
                tracing::debug!(%task_id, "Resource retired by executor");
            }
        }

        let failed = match result {
            Ok(_) => false,
            Err(error) => {
                self.handle_failure(task_id, record, &error).await;
                true
            }
        };

        if ctx.requeue_requested() {
            TaskState::Requeued
        } else if failed {
            TaskState::FailedLogged
        } else {
            TaskState::Completed
        }
    }

    async fn handle_failure(&self, task_id: u64, record: &Record, error: &AppError) {
        let message = error.to_string();

        if error.is_fatal() {
            self.shared.report(PoolEvent::Fatal { error: &message });
            let hook = Arc::clone(&lock(&self.shared.fatal_hook));
            hook(error);
            return;
        }
        if error.is_transient() {
            self.shared.metrics.inc(TRANSIENT_COUNTER);
            self.shared.report(PoolEvent::TransientFailure {
                task_id,
                error: &message,
            });
            return;
        }
        if self.shared.metrics.has(&message) {
            self.shared.metrics.inc(&message);
            return;
        }

        self.shared.metrics.inc(ERROR_COUNTER);
        self.shared.report(PoolEvent::TaskFailed {
            task_id,
            record,
            error: &message,
        });

        let error_log = lock(&self.shared.error_log).clone();
        if let Some(file) = error_log {
            let entry = serde_json::json!({ "record": self.shared.schema.to_json(record) });
            if let Err(e) = file.append(&format!("{entry}\n{message}\n")).await {
                tracing::warn!(error = %e, "Failed to write error log");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}
