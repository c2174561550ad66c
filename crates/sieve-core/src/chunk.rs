use std::collections::HashMap;

use crate::record::Record;

/// A bounded batch of records produced by one loader pass.
///
/// Keys are unique within a chunk: inserting a record whose key is already
/// present replaces the earlier record in place, so the last occurrence wins
/// while the original position is kept.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    records: Vec<Record>,
    index: HashMap<String, usize>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert a record, replacing any record with the same key.
    pub fn insert(&mut self, record: Record) {
        match self.index.get(record.key()) {
            Some(&pos) => self.records[pos] = record,
            None => {
                self.index
                    .insert(record.key().to_string(), self.records.len());
                self.records.push(record);
            }
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.index.get(key).map(|&pos| &self.records[pos])
    }

    /// Keep only the records matching `keep`. Returns how many were dropped.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Record) -> bool,
    {
        let before = self.records.len();
        self.records.retain(|r| keep(r));
        if self.records.len() != before {
            self.reindex();
        }
        before - self.records.len()
    }

    /// Merge another chunk into this one; its records win on key collisions.
    pub fn merge(&mut self, other: Chunk) {
        for record in other.records {
            self.insert(record);
        }
    }

    /// Drop records beyond `max`.
    pub fn truncate(&mut self, max: usize) {
        if self.records.len() > max {
            self.records.truncate(max);
            self.reindex();
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (pos, record) in self.records.iter().enumerate() {
            self.index.insert(record.key().to_string(), pos);
        }
    }
}

impl FromIterator<Record> for Chunk {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut chunk = Chunk::new();
        for record in iter {
            chunk.insert(record);
        }
        chunk
    }
}

impl<'a> IntoIterator for &'a Chunk {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
