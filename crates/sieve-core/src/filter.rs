//! Dedup filters: drop records already known from earlier runs.
//!
//! Two kinds of removal files exist:
//!
//! - **Exact** (generation `v1`): each line is a bare key or a
//!   `key<delim>secret` composite. Only the key is compared. Files are
//!   streamed once each, so their size is unbounded.
//! - **Fuzzy** (generation `v2`): free-form text such as logs. Read fully;
//!   key-like fields match on extracted email addresses (case-insensitive),
//!   other fields match on raw substring containment.
//!
//! A third generation (`v3`) is accepted everywhere but only the native
//! helper may give it distinct semantics. In-process it is folded into the
//! exact pass.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::chunk::Chunk;
use crate::error::AppError;
use crate::lines::LineReader;
use crate::record::{Field, split_line};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:[a-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[a-z0-9!#$%&'*+/=?^_`{|}~-]+)*|"(?:[\x01-\x08\x0b\x0c\x0e-\x1f\x21\x23-\x5b\x5d-\x7f]|\\[\x01-\x09\x0b\x0c\x0e-\x7f])*")@(?:(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z0-9](?:[a-z0-9-]*[a-z0-9])?|\[(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?|[a-z0-9-]*[a-z0-9]:(?:[\x01-\x08\x0b\x0c\x0e-\x1f\x21-\x5a\x53-\x7f]|\\[\x01-\x09\x0b\x0c\x0e-\x7f])+)\])"#,
    )
    .expect("email pattern is valid")
});

/// Removal-file generation, as tagged on the helper command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    V1,
    V2,
    V3,
}

impl Generation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Generation::V1 => "v1",
            Generation::V2 => "v2",
            Generation::V3 => "v3",
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Generation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "v1" => Ok(Generation::V1),
            "v2" => Ok(Generation::V2),
            "v3" => Ok(Generation::V3),
            _ => Err(format!("Unknown removal generation: {}", s)),
        }
    }
}

/// The exclusion files applied to every loaded batch.
#[derive(Debug, Clone, Default)]
pub struct RemovalSets {
    pub exact: Vec<PathBuf>,
    pub fuzzy: Vec<PathBuf>,
    pub legacy: Vec<PathBuf>,
    /// Record slot the fuzzy pass compares.
    pub fuzzy_field: Field,
}

impl RemovalSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exact(mut self, path: impl Into<PathBuf>) -> Self {
        self.exact.push(path.into());
        self
    }

    pub fn with_fuzzy(mut self, path: impl Into<PathBuf>) -> Self {
        self.fuzzy.push(path.into());
        self
    }

    pub fn with_legacy(mut self, path: impl Into<PathBuf>) -> Self {
        self.legacy.push(path.into());
        self
    }

    pub fn with_fuzzy_field(mut self, field: Field) -> Self {
        self.fuzzy_field = field;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.fuzzy.is_empty() && self.legacy.is_empty()
    }

    /// All files with their generation, in helper argument order.
    pub fn tagged(&self) -> impl Iterator<Item = (Generation, &Path)> {
        let exact = self.exact.iter().map(|p| (Generation::V1, p.as_path()));
        let fuzzy = self.fuzzy.iter().map(|p| (Generation::V2, p.as_path()));
        let legacy = self.legacy.iter().map(|p| (Generation::V3, p.as_path()));
        exact.chain(fuzzy).chain(legacy)
    }

    /// Helper command-line arguments: `v1|path`, `v2|path`, `v3|path`.
    pub fn tagged_args(&self) -> Vec<String> {
        self.tagged()
            .map(|(generation, path)| format!("{}|{}", generation, path.display()))
            .collect()
    }

    /// Run the full filter pipeline over a working buffer.
    ///
    /// Exact files first, then fuzzy files, one file at a time. Returns the
    /// number of records dropped.
    pub async fn apply(&self, chunk: &mut Chunk) -> Result<usize, AppError> {
        let mut removed = 0;

        if !self.legacy.is_empty() {
            tracing::warn!(
                files = self.legacy.len(),
                "v3 removal files are treated as v1 without the native helper"
            );
        }
        for path in self.exact.iter().chain(self.legacy.iter()) {
            if chunk.is_empty() {
                return Ok(removed);
            }
            removed += remove_exact(chunk, path).await?;
        }
        for path in &self.fuzzy {
            if chunk.is_empty() {
                return Ok(removed);
            }
            removed += remove_fuzzy(chunk, path, self.fuzzy_field).await?;
        }

        Ok(removed)
    }
}

/// Drop every record whose key appears in an exact-removal file.
///
/// The file is streamed once; matching keys are collected and removed after
/// the scan completes.
pub async fn remove_exact(chunk: &mut Chunk, path: &Path) -> Result<usize, AppError> {
    let mut reader = LineReader::open(path).await?;
    let mut marked: HashSet<String> = HashSet::new();

    while let Some(line) = reader.next_line().await? {
        if line.is_empty() {
            continue;
        }
        if chunk.contains_key(&line) {
            marked.insert(line);
            continue;
        }
        if let Some((key, _)) = split_line(&line)
            && !key.is_empty()
            && chunk.contains_key(key)
        {
            marked.insert(key.to_string());
        }
    }

    let removed = chunk.retain(|r| !marked.contains(r.key()));
    tracing::debug!(path = %path.display(), removed, now = chunk.len(), "Exact removal pass");
    Ok(removed)
}

/// Drop every record whose `field` is mentioned in a free-form removal file.
pub async fn remove_fuzzy(chunk: &mut Chunk, path: &Path, field: Field) -> Result<usize, AppError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AppError::io(path, e))?;

    let removed = match field {
        Field::Key => {
            let known = extract_emails(&text);
            chunk.retain(|r| !known.contains(&r.key().to_lowercase()))
        }
        Field::Secret => chunk.retain(|r| !text.contains(r.secret())),
    };

    tracing::debug!(path = %path.display(), removed, now = chunk.len(), "Fuzzy removal pass");
    Ok(removed)
}

/// Every email address found in `text`, lower-cased.
pub fn extract_emails(text: &str) -> HashSet<String> {
    let lowered = text.to_lowercase();
    EMAIL_RE
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}
