//! Checkout/return pool of opaque leaseable handles.
//!
//! Handles are created once and recycled for the life of the process. A
//! handle is counted as leased from checkout until it is back in the
//! available set, including the delay between `release` and its return, so
//! `leased + available == total` holds at every observation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default wait between checkout attempts when the pool is empty.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct PoolInner<R> {
    available: VecDeque<R>,
    leased: usize,
}

/// Counts observed at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceStats {
    pub total: usize,
    pub leased: usize,
    pub available: usize,
}

/// A fixed-size pool of handles with blocking checkout and delayed return.
///
/// Checkout order is not fair.
#[derive(Debug)]
pub struct ResourcePool<R> {
    inner: Arc<Mutex<PoolInner<R>>>,
    total: usize,
    poll_interval: Duration,
}

impl<R> Clone for ResourcePool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            total: self.total,
            poll_interval: self.poll_interval,
        }
    }
}

impl<R: Send + 'static> ResourcePool<R> {
    pub fn new(handles: impl IntoIterator<Item = R>) -> Self {
        let available: VecDeque<R> = handles.into_iter().collect();
        let total = available.len();
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                available,
                leased: 0,
            })),
            total,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner<R>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned resource pool mutex");
            poisoned.into_inner()
        })
    }

    /// Take a handle if one is available right now.
    pub fn try_checkout(&self) -> Option<R> {
        let mut inner = self.lock();
        let handle = inner.available.pop_front()?;
        inner.leased += 1;
        Some(handle)
    }

    /// Take a handle, polling until one is returned. No upper bound on the wait.
    pub async fn checkout(&self) -> R {
        loop {
            if let Some(handle) = self.try_checkout() {
                return handle;
            }
            tracing::debug!(
                poll_ms = self.poll_interval.as_millis() as u64,
                "No free resource, waiting"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Return a handle after `delay`, staggering its reuse.
    pub fn release(&self, handle: R, delay: Duration) {
        if delay.is_zero() {
            self.put_back(handle);
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pool.put_back(handle);
        });
    }

    fn put_back(&self, handle: R) {
        let mut inner = self.lock();
        inner.leased = inner.leased.saturating_sub(1);
        inner.available.push_back(handle);
    }

    pub fn stats(&self) -> ResourceStats {
        let inner = self.lock();
        ResourceStats {
            total: self.total,
            leased: inner.leased,
            available: inner.available.len(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }
}
