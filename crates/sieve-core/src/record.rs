use std::fmt;

use serde::{Deserialize, Serialize};

/// Delimiters sniffed in raw lines. Whichever occurs first wins.
pub const DELIMITERS: [char; 2] = [';', ':'];

/// A parsed key/secret pair. Immutable once built.
///
/// Hash and equality cover both fields; key-only matching is done by the
/// filters, which look at [`Record::key`] directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Record {
    key: String,
    secret: String,
}

impl Record {
    /// Build a record. Returns `None` if either half is empty.
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Option<Self> {
        let key = key.into();
        let secret = secret.into();
        if key.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self { key, secret })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Value of the requested slot.
    pub fn field(&self, field: Field) -> &str {
        match field {
            Field::Key => &self.key,
            Field::Secret => &self.secret,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.secret)
    }
}

/// One of the two semantic slots of a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    #[default]
    Key,
    Secret,
}

/// Names given to the two record slots when records leave the process
/// (error logs, JSON output). Fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    pub key_name: String,
    pub secret_name: String,
}

impl Default for RecordSchema {
    fn default() -> Self {
        Self {
            key_name: "email".to_string(),
            secret_name: "password".to_string(),
        }
    }
}

impl RecordSchema {
    pub fn new(key_name: impl Into<String>, secret_name: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            secret_name: secret_name.into(),
        }
    }

    /// Render a record as a JSON object using the configured slot names.
    pub fn to_json(&self, record: &Record) -> serde_json::Value {
        let mut map = serde_json::Map::with_capacity(2);
        map.insert(self.key_name.clone(), record.key().into());
        map.insert(self.secret_name.clone(), record.secret().into());
        serde_json::Value::Object(map)
    }
}

/// Split a line on the first delimiter and return both halves.
///
/// Returns `None` if no delimiter is present. Halves may be empty.
pub fn split_line(line: &str) -> Option<(&str, &str)> {
    let pos = line.find(DELIMITERS)?;
    Some((&line[..pos], &line[pos + 1..]))
}

/// Parse a raw line into a [`Record`].
///
/// Malformed lines (no delimiter, empty key or secret) yield `None` and are
/// meant to be dropped silently.
pub fn parse_line(line: &str) -> Option<Record> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let (key, secret) = split_line(line)?;
    Record::new(key, secret)
}
