//! Run configuration.
//!
//! A run is described by one JSON file. File entries are named by key; the
//! `misc` and `results` short lists expand to `misc/<name>_<key>.txt` and
//! `results/<name>_<key>.txt`, and `files` maps keys to explicit paths.
//! Exclusion groups name file keys (or raw paths).
//!
//! An optional override file is merged over the base document. An override
//! that does not parse is reset to `{}` and ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::filter::RemovalSets;
use crate::metrics::Metrics;
use crate::output::{ensure_file, stamp_time};
use crate::pool::TaskPoolConfig;
use crate::record::{Field, RecordSchema};
use crate::refill::{LOW_WATER_FACTOR, RefillConfig};
use crate::sources::resolve_queue;

/// Default in-memory record cap per loaded chunk.
pub const DEFAULT_MAX_RECORDS: usize = 3_000_000;

/// Key of the file holding the source (single mode) or the queue of
/// sources (queue mode).
pub const SOURCE_KEY: &str = "source";
/// Key of the error log file.
pub const ERRORS_KEY: &str = "errors";

/// How sources are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// `source` is the one source file.
    #[default]
    Single,
    /// `source` is a queue file listing sources and directories.
    Queue,
}

/// Names given to the two record slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFields {
    pub key: String,
    pub secret: String,
}

impl Default for RecordFields {
    fn default() -> Self {
        Self {
            key: "email".to_string(),
            secret: "password".to_string(),
        }
    }
}

/// Refill loop tuning, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefillSettings {
    pub low_water_factor: usize,
    pub start_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for RefillSettings {
    fn default() -> Self {
        Self {
            low_water_factor: LOW_WATER_FACTOR,
            start_delay_ms: 5000,
            poll_interval_ms: 500,
            retry_delay_ms: 5000,
        }
    }
}

/// Everything needed to run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub name: String,
    pub concurrency: usize,
    pub mode: LoadMode,
    /// Short names expanded to `misc/<name>_<key>.txt`.
    pub misc: Vec<String>,
    /// Short names expanded to `results/<name>_<key>.txt`.
    pub results: Vec<String>,
    /// Explicit key to path entries. Win over expanded short names.
    pub files: BTreeMap<String, PathBuf>,
    pub exclude_v1: Vec<String>,
    pub exclude_v2: Vec<String>,
    pub exclude_v3: Vec<String>,
    pub fuzzy_field: Field,
    pub max_records: usize,
    pub metrics: Vec<String>,
    pub metrics_interval_ms: u64,
    pub record_fields: RecordFields,
    pub helper_path: PathBuf,
    /// Number of leaseable resource slots. Zero disables leasing.
    pub resources: usize,
    /// File keys that get a timestamp line at startup.
    pub stamp_files: Vec<String>,
    /// File key processed records are appended to.
    pub checkpoint: String,
    pub refill: RefillSettings,
    #[serde(rename = "override", skip_serializing_if = "Option::is_none")]
    pub override_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: "run".to_string(),
            concurrency: 100,
            mode: LoadMode::Single,
            misc: Vec::new(),
            results: Vec::new(),
            files: BTreeMap::new(),
            exclude_v1: Vec::new(),
            exclude_v2: Vec::new(),
            exclude_v3: Vec::new(),
            fuzzy_field: Field::Key,
            max_records: DEFAULT_MAX_RECORDS,
            metrics: Vec::new(),
            metrics_interval_ms: 5000,
            record_fields: RecordFields::default(),
            helper_path: PathBuf::from("./sieve-helper"),
            resources: 0,
            stamp_files: Vec::new(),
            checkpoint: "checked".to_string(),
            refill: RefillSettings::default(),
            override_path: None,
        }
    }
}

impl RunConfig {
    /// Read a configuration file, layering its override file on top.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::io(path, e))?;
        let mut doc: Value = serde_json::from_str(&raw)?;

        let override_path = doc
            .get("override")
            .and_then(Value::as_str)
            .map(PathBuf::from);
        if let Some(override_path) = override_path
            && let Some(layer) = load_override(&override_path).await?
        {
            merge(&mut doc, layer);
            tracing::info!(path = %override_path.display(), "Override config loaded");
        }

        let config: RunConfig = serde_json::from_value(doc)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::Config("name must not be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(AppError::Config("concurrency must be at least 1".into()));
        }
        if self.max_records == 0 {
            return Err(AppError::Config("max_records must be at least 1".into()));
        }
        if self.metrics_interval_ms == 0 {
            return Err(AppError::Config(
                "metrics_interval_ms must be at least 1".into(),
            ));
        }
        if !self.file_paths().contains_key(SOURCE_KEY) {
            return Err(AppError::Config(format!(
                "no '{SOURCE_KEY}' file configured"
            )));
        }
        Ok(())
    }

    /// All configured files by key.
    pub fn file_paths(&self) -> BTreeMap<String, PathBuf> {
        let misc = self
            .misc
            .iter()
            .map(|key| (key.clone(), self.templated("misc", key)));
        let results = self
            .results
            .iter()
            .map(|key| (key.clone(), self.templated("results", key)));
        let mut paths: BTreeMap<String, PathBuf> = misc.chain(results).collect();
        paths.extend(self.files.clone());
        paths
    }

    fn templated(&self, dir: &str, key: &str) -> PathBuf {
        Path::new(dir).join(format!("{}_{}.txt", self.name, key))
    }

    pub fn file(&self, key: &str) -> Option<PathBuf> {
        self.file_paths().remove(key)
    }

    /// Look up a file by key, failing if it is not configured.
    pub fn require_file(&self, key: &str) -> Result<PathBuf, AppError> {
        self.file(key)
            .ok_or_else(|| AppError::Config(format!("no '{key}' file configured")))
    }

    /// A file key if one is configured, otherwise the entry itself as a path.
    fn resolve_entry(&self, files: &BTreeMap<String, PathBuf>, entry: &str) -> PathBuf {
        files
            .get(entry)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(entry))
    }

    /// Exclusion files of all three generations.
    ///
    /// The checkpoint file is always an exact exclusion: refills reload the
    /// sources from the start, and records already processed must not come
    /// back.
    pub fn removal_sets(&self) -> RemovalSets {
        let files = self.file_paths();
        let mut sets = RemovalSets::new().with_fuzzy_field(self.fuzzy_field);
        for entry in &self.exclude_v1 {
            sets = sets.with_exact(self.resolve_entry(&files, entry));
        }
        if let Some(checkpoint) = files.get(&self.checkpoint)
            && !sets.exact.contains(checkpoint)
        {
            sets = sets.with_exact(checkpoint.clone());
        }
        for entry in &self.exclude_v2 {
            sets = sets.with_fuzzy(self.resolve_entry(&files, entry));
        }
        for entry in &self.exclude_v3 {
            sets = sets.with_legacy(self.resolve_entry(&files, entry));
        }
        sets
    }

    pub fn schema(&self) -> RecordSchema {
        RecordSchema::new(&self.record_fields.key, &self.record_fields.secret)
    }

    pub fn build_metrics(&self) -> Metrics {
        Metrics::new(self.metrics.iter().cloned())
    }

    pub fn pool_config(&self) -> TaskPoolConfig {
        TaskPoolConfig::default()
            .with_concurrency(self.concurrency)
            .with_collection(self.name.clone())
            .with_resources(self.resources > 0)
            .with_metrics_interval(Duration::from_millis(self.metrics_interval_ms))
            .with_schema(self.schema())
    }

    pub fn refill_config(&self) -> RefillConfig {
        RefillConfig::for_concurrency(self.concurrency, self.max_records)
            .with_low_water_mark(self.concurrency * self.refill.low_water_factor)
            .with_start_delay(Duration::from_millis(self.refill.start_delay_ms))
            .with_poll_interval(Duration::from_millis(self.refill.poll_interval_ms))
            .with_retry_delay(Duration::from_millis(self.refill.retry_delay_ms))
    }

    /// Source files for this run, according to the load mode.
    pub async fn sources(&self) -> Result<Vec<PathBuf>, AppError> {
        let source = self.require_file(SOURCE_KEY)?;
        match self.mode {
            LoadMode::Single => Ok(vec![source]),
            LoadMode::Queue => resolve_queue(&source).await,
        }
    }

    /// Create every configured file that is missing and stamp the
    /// configured files with the current time.
    pub async fn bootstrap(&self) -> Result<(), AppError> {
        let files = self.file_paths();
        for path in files.values() {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AppError::io(parent, e))?;
            }
            ensure_file(path).await?;
        }

        for key in &self.stamp_files {
            match files.get(key) {
                Some(path) => stamp_time(path).await?,
                None => tracing::warn!(%key, "Stamp file is not configured, skipping"),
            }
        }
        Ok(())
    }
}

/// Read an override layer. A missing file yields `None`; an unparseable one
/// is reset to `{}` and also yields `None`.
async fn load_override(path: &Path) -> Result<Option<Value>, AppError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AppError::io(path, e)),
    };

    match serde_json::from_str::<Value>(&raw) {
        Ok(layer) => Ok(Some(layer)),
        Err(e) => {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Override config is invalid, resetting"
            );
            tokio::fs::write(path, "{}")
                .await
                .map_err(|e| AppError::io(path, e))?;
            Ok(None)
        }
    }
}

/// Merge `layer` into `base`. Objects merge key by key; anything else in
/// `layer` replaces the base value.
fn merge(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}
