use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

/// Named counters shared by the pool and its executor.
///
/// Counters listed at construction start at zero so they always show up in
/// reports. Unknown names are created on first increment.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    counters: Arc<Mutex<BTreeMap<String, u64>>>,
}

/// Point-in-time view of all counters plus the `remaining` gauge.
///
/// `remaining` is `queued + in flight`, or `-1` before the pool starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub counters: BTreeMap<String, u64>,
    pub remaining: i64,
}

impl Metrics {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let counters = names.into_iter().map(|n| (n.into(), 0)).collect();
        Self {
            counters: Arc::new(Mutex::new(counters)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, u64>> {
        self.counters.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned metrics mutex");
            poisoned.into_inner()
        })
    }

    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, amount: u64) {
        let mut counters = self.lock();
        match counters.get_mut(name) {
            Some(value) => *value += amount,
            None => {
                counters.insert(name.to_string(), amount);
            }
        }
    }

    pub fn get(&self, name: &str) -> u64 {
        self.lock().get(name).copied().unwrap_or(0)
    }

    /// Returns true if `name` is a registered counter.
    pub fn has(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn snapshot(&self, remaining: Option<usize>) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.lock().clone(),
            remaining: remaining.map_or(-1, |n| n as i64),
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{json}"),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}
