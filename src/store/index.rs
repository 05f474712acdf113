//! Sparse index over a sorted map file.
//!
//! One entry is kept for roughly every `bytes_per_index` bytes of data; the keys
//! written in between are only counted. Entries are strictly increasing in key
//! and offset, which is what makes the binary searches below valid.

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::diskio::{BufferedReader, BufferedWriter, WriteMode};
use crate::error::{Error, Result};
use crate::store::codec::{read_record, write_record};

const INDEX_IO_BUFFER: usize = 64 * 1024;

// Sparse index entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry<K> {
    pub key: K,
    pub offset: u64,
    /// Keys written without an entry since the previous entry
    pub skipped: u64,
}

/// Sparse index, or a read-only view over part of one.
///
/// Views made by [`MapFileIndex::sub_index`] share the entry storage of the
/// index they came from.
#[derive(Debug, Clone)]
pub struct MapFileIndex<K> {
    entries: Arc<Vec<IndexEntry<K>>>,
    start: usize,
    end: usize,
    skipped: u64,
}

impl<K> Default for MapFileIndex<K> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Vec::new()),
            start: 0,
            end: 0,
            skipped: 0,
        }
    }
}

impl<K: Ord + Clone> MapFileIndex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<IndexEntry<K>>) -> Self {
        let end = entries.len();
        Self {
            entries: Arc::new(entries),
            start: 0,
            end,
            skipped: 0,
        }
    }

    /// Count one key written without an index entry
    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    /// Pending skip count since the last entry
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Append an entry carrying the pending skip count
    pub fn create(&mut self, key: K, offset: u64) {
        if self.start != 0 || self.end != self.entries.len() {
            // Writing through a view detaches it from the shared storage
            self.entries = Arc::new(self.as_slice().to_vec());
            self.start = 0;
        }
        Arc::make_mut(&mut self.entries).push(IndexEntry {
            key,
            offset,
            skipped: self.skipped,
        });
        self.end = self.entries.len();
        self.skipped = 0;
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[IndexEntry<K>] {
        &self.entries[self.start..self.end]
    }

    pub fn get(&self, i: usize) -> Option<&IndexEntry<K>> {
        self.as_slice().get(i)
    }

    pub fn first(&self) -> Option<&IndexEntry<K>> {
        self.as_slice().first()
    }

    pub fn last(&self) -> Option<&IndexEntry<K>> {
        self.as_slice().last()
    }

    /// Binary search for `key`.
    ///
    /// An exact match returns its position. Otherwise `lower_bound` selects the
    /// entry with the largest key below `key`, and its absence selects the entry
    /// with the smallest key above it. `None` when no such entry exists.
    pub fn index_for_key(&self, key: &K, lower_bound: bool) -> Option<usize> {
        let entries = self.as_slice();
        match entries.binary_search_by(|e| e.key.cmp(key)) {
            Ok(mid) => Some(mid),
            Err(low) => {
                let idx = if lower_bound { low.checked_sub(1)? } else { low };
                (idx < entries.len()).then_some(idx)
            }
        }
    }

    /// Entry to start scanning from when looking for `key`
    pub fn entry_for_key(&self, key: &K) -> Option<&IndexEntry<K>> {
        self.index_for_key(key, true).and_then(|i| self.get(i))
    }

    /// Bounding entry positions `(low, high)` for the closed range `[from, to]`.
    ///
    /// A range reaching past either end of the index is clamped to the first or
    /// last entry. `None` when the index is empty or the range misses it.
    pub fn locate_sub_index(&self, from: &K, to: &K) -> Result<Option<(usize, usize)>> {
        if from > to {
            return Err(Error::InvalidArgument(
                "fromKey is greater than toKey".to_string(),
            ));
        }

        let (Some(first), Some(last)) = (self.first(), self.last()) else {
            return Ok(None);
        };
        if *from > last.key || *to < first.key {
            return Ok(None);
        }

        let low = if *from < first.key {
            Some(0)
        } else {
            self.index_for_key(from, true)
        };
        let high = if *to > last.key {
            Some(self.len() - 1)
        } else {
            self.index_for_key(to, false)
        };

        Ok(low.zip(high))
    }

    /// Approximate number of keys between `from` and `to`
    pub fn distance(&self, from: &K, to: &K) -> Result<u64> {
        let Some((low, high)) = self.locate_sub_index(from, to)? else {
            return Ok(0);
        };
        let entries = self.as_slice();
        Ok(((low + 1)..=high).map(|i| entries[i].skipped + 1).sum())
    }

    /// View restricted to the entries bounding `[from, to]`; shares storage.
    pub fn sub_index(&self, from: &K, to: &K) -> Result<MapFileIndex<K>> {
        let (start, end) = match self.locate_sub_index(from, to)? {
            Some((low, high)) => (self.start + low, self.start + high + 1),
            None => (self.start, self.start),
        };
        Ok(MapFileIndex {
            entries: Arc::clone(&self.entries),
            start,
            end,
            skipped: 0,
        })
    }

    /// Whether this index is a view sharing storage with `other`
    pub fn shares_storage_with(&self, other: &MapFileIndex<K>) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

impl<K: Ord + Clone + Serialize + DeserializeOwned> MapFileIndex<K> {
    /// Write every entry as a flat sequence of records, replacing the file
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut writer = BufferedWriter::open(path, WriteMode::Create, INDEX_IO_BUFFER)?;
        for entry in self.as_slice() {
            write_record(&mut writer, entry)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read entries from `path` and append them to this index
    pub fn read_from(&mut self, path: &Path) -> Result<usize> {
        let mut reader = BufferedReader::open(path, INDEX_IO_BUFFER)?;
        let mut count = 0;
        while let Some(entry) = read_record::<_, IndexEntry<K>>(&mut reader)? {
            if self.start != 0 || self.end != self.entries.len() {
                self.entries = Arc::new(self.as_slice().to_vec());
                self.start = 0;
            }
            Arc::make_mut(&mut self.entries).push(entry);
            self.end = self.entries.len();
            count += 1;
        }
        Ok(count)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut index = Self::new();
        index.read_from(path)?;
        Ok(index)
    }
}
