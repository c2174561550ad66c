//! Keeps a running task pool fed from the record sources.
//!
//! After the initial chunk is handed to the pool, the orchestrator waits for
//! the pool depth to fall to the low-water mark, pauses dequeuing, snapshots
//! everything queued or in flight, loads the next chunk from the same sources
//! and enqueues whatever is not already pending. It stops once the sources
//! look exhausted.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::AppError;
use crate::filter::RemovalSets;
use crate::loader::{SourceLoader, load_sources};
use crate::pool::{DrainHold, PoolHandle};
use crate::record::Record;

/// Multiplier applied to the concurrency to get the low-water mark.
pub const LOW_WATER_FACTOR: usize = 10;

/// Refill tuning.
#[derive(Debug, Clone)]
pub struct RefillConfig {
    /// Depth at or below which the next chunk is loaded.
    pub low_water_mark: usize,
    /// Maximum records per loaded chunk.
    pub max_records: usize,
    /// Wait before the first depth poll.
    pub start_delay: Duration,
    /// Interval between depth polls.
    pub poll_interval: Duration,
    /// Wait after a failed refill before trying again.
    pub retry_delay: Duration,
    /// Consecutive failed refills after which the orchestrator gives up.
    /// `None` keeps retrying for as long as the pool runs.
    pub max_failures: Option<u32>,
}

impl RefillConfig {
    pub fn for_concurrency(concurrency: usize, max_records: usize) -> Self {
        Self {
            low_water_mark: concurrency * LOW_WATER_FACTOR,
            max_records,
            start_delay: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            retry_delay: Duration::from_secs(5),
            max_failures: None,
        }
    }

    pub fn with_low_water_mark(mut self, mark: usize) -> Self {
        self.low_water_mark = mark;
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = Some(max_failures);
        self
    }
}

/// Why the refill loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A refill produced no record that was not already pending.
    NothingNew,
    /// The pool stayed below the low-water mark after a refill.
    BelowLowWater,
    /// The freshly loaded chunk was smaller than the low-water mark.
    SourceExhausted,
    /// The configured number of consecutive refill failures was reached.
    Failed,
}

/// What the refill loop did over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefillSummary {
    pub rounds: usize,
    pub added: usize,
    pub stop: StopReason,
}

/// Drives repeated loads into a running pool.
pub struct RefillOrchestrator<L> {
    loader: Arc<L>,
    sources: Vec<PathBuf>,
    removal: RemovalSets,
    config: RefillConfig,
}

impl<L: SourceLoader + 'static> RefillOrchestrator<L> {
    pub fn new(
        loader: Arc<L>,
        sources: Vec<PathBuf>,
        removal: RemovalSets,
        config: RefillConfig,
    ) -> Self {
        Self {
            loader,
            sources,
            removal,
            config,
        }
    }

    /// Whether an initial chunk of this size warrants a refill loop.
    ///
    /// A chunk smaller than the low-water mark was the last one.
    pub fn needs_refill(&self, initial_size: usize) -> bool {
        initial_size >= self.config.low_water_mark
    }

    /// Spawn the refill loop if the initial chunk calls for one.
    ///
    /// The pool is held open from this call until the loop ends, so it
    /// cannot drain while a refill is still possible.
    pub fn spawn(
        self,
        handle: PoolHandle,
        initial_size: usize,
    ) -> Option<JoinHandle<RefillSummary>> {
        if !self.needs_refill(initial_size) {
            tracing::info!(
                initial_size,
                low_water_mark = self.config.low_water_mark,
                "Initial chunk is the last one, no refill"
            );
            return None;
        }
        let hold = handle.hold_open();
        Some(tokio::spawn(self.run(handle, hold)))
    }

    async fn run(self, handle: PoolHandle, hold: DrainHold) -> RefillSummary {
        let mut rounds = 0;
        let mut added = 0;
        let mut failures = 0;

        tokio::time::sleep(self.config.start_delay).await;

        let stop = loop {
            self.wait_for_low_water(&handle).await;

            handle.pause();
            let result = self.refill_once(&handle).await;
            handle.resume();

            match result {
                Ok(round) => {
                    failures = 0;
                    rounds += 1;
                    added += round.added;
                    tracing::info!(
                        loaded = round.loaded,
                        added = round.added,
                        depth = ?handle.depth(),
                        "Refill round finished"
                    );

                    if round.added == 0 {
                        break StopReason::NothingNew;
                    }
                    if handle.depth().unwrap_or(0) < self.config.low_water_mark {
                        break StopReason::BelowLowWater;
                    }
                    if round.loaded < self.config.low_water_mark {
                        break StopReason::SourceExhausted;
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(error = %e, failures, "Refill failed");
                    if self.config.max_failures.is_some_and(|max| failures >= max) {
                        break StopReason::Failed;
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        };

        tracing::info!(rounds, added, ?stop, "Refill loop finished");
        drop(hold);
        RefillSummary {
            rounds,
            added,
            stop,
        }
    }

    async fn wait_for_low_water(&self, handle: &PoolHandle) {
        loop {
            if let Some(depth) = handle.depth()
                && depth <= self.config.low_water_mark
            {
                return;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Load the next chunk and enqueue what is not already pending.
    /// The pool must be paused.
    async fn refill_once(&self, handle: &PoolHandle) -> Result<RefillRound, AppError> {
        let pending = handle.pending_records();
        tracing::info!(pending = pending.len(), "Uploading next chunk");

        let fresh = load_sources(
            self.loader.as_ref(),
            &self.sources,
            &self.removal,
            self.config.max_records,
        )
        .await?;
        let loaded = fresh.len();

        let new_records = exclude_pending(fresh, &pending);
        let added = if new_records.is_empty() {
            0
        } else {
            handle.add_records(new_records)?
        };
        Ok(RefillRound { loaded, added })
    }
}

struct RefillRound {
    loaded: usize,
    added: usize,
}

/// Drop records whose (key, secret) pair is already pending.
fn exclude_pending(fresh: Vec<Record>, pending: &HashSet<Record>) -> Vec<Record> {
    fresh.into_iter().filter(|r| !pending.contains(r)).collect()
}
