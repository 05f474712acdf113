//! ExternalSortedMap - append-only sorted map stored in a map file.
//!
//! Keys must be put in strictly increasing order. Point lookups need the
//! sparse index; maps written without one (intermediate spills) can only be
//! streamed. Sub-maps and splits are views sharing the file and the index of
//! the map they came from.

use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::collections::{Key, Value};
use crate::config::Config;
use crate::diskio::{FileKind, Storage};
use crate::error::{Error, Result};
use crate::store::{IndexEntry, MapFile, MapFileIndex, MapFileSettings, OpenMode};

pub struct ExternalSortedMap<K, V> {
    path: PathBuf,
    // Read/write handle of a map being written; lazily opened read handle otherwise
    handle: Mutex<Option<MapFile<K>>>,
    // Index of views and reopened maps. A map being written keeps its index in the handle.
    index: Option<MapFileIndex<K>>,
    first_key: Option<K>,
    last_key: Option<K>,
    len: usize,
    // Byte offset where streaming starts; splits know it exactly
    start: Option<u64>,
    // Offset of the next split's first record; lookups stop there
    end: Option<u64>,
    // Skip keys outside [first_key, last_key] while streaming
    bounded: bool,
    settings: MapFileSettings,
    block_size: u64,
    _value: PhantomData<fn() -> V>,
}

/// Serializable description of an external map.
///
/// Lets another rank sharing the filesystem reopen the map read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalMapDescriptor<K> {
    pub path: PathBuf,
    pub index: Option<Vec<IndexEntry<K>>>,
    pub first_key: Option<K>,
    pub last_key: Option<K>,
    pub len: usize,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub bounded: bool,
}

impl<K: Key, V: Value> ExternalSortedMap<K, V> {
    /// New empty map in a fresh file. Final maps are indexed, intermediate ones are not.
    pub fn create(storage: &Storage, kind: FileKind, config: &Config) -> Result<Self> {
        let path = storage.create_file(kind)?;
        let indexed = kind == FileKind::Final;
        Self::create_at(&path, indexed, config)
    }

    pub fn create_at(path: &Path, indexed: bool, config: &Config) -> Result<Self> {
        let settings = MapFileSettings::from(config);
        let index = indexed.then(MapFileIndex::new);
        let file = MapFile::open(path, OpenMode::ReadWrite, index, settings)?;
        debug!("created {} (indexed={})", path.display(), indexed);

        Ok(Self {
            path: path.to_path_buf(),
            handle: Mutex::new(Some(file)),
            index: None,
            first_key: None,
            last_key: None,
            len: 0,
            start: None,
            end: None,
            bounded: false,
            settings,
            block_size: config.block_size,
            _value: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first_key(&self) -> Option<&K> {
        self.first_key.as_ref()
    }

    pub fn last_key(&self) -> Option<&K> {
        self.last_key.as_ref()
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn is_indexed(&self) -> bool {
        self.current_index().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<MapFile<K>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the index; shares entry storage with the live one
    pub fn current_index(&self) -> Option<MapFileIndex<K>> {
        if self.index.is_some() {
            return self.index.clone();
        }
        self.lock().as_ref().and_then(|f| f.index().cloned())
    }

    fn with_handle<R>(&self, f: impl FnOnce(&mut MapFile<K>) -> Result<R>) -> Result<R> {
        let mut guard = self.lock();
        let file = match guard.take() {
            Some(file) => file,
            None => MapFile::open(&self.path, OpenMode::Read, None, self.settings)?,
        };
        f(guard.insert(file))
    }

    fn in_bounds(&self, key: &K) -> bool {
        match (&self.first_key, &self.last_key) {
            (Some(first), Some(last)) => key >= first && key <= last,
            _ => false,
        }
    }

    /// Point lookup through the index; always `None` on an unindexed map.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        if !self.in_bounds(key) {
            return Ok(None);
        }
        let Some(index) = self.current_index() else {
            return Ok(None);
        };
        let Some(entry) = index.entry_for_key(key) else {
            return Ok(None);
        };
        let offset = entry.offset;
        // The boundary key belongs to the next split
        if self.end.is_some_and(|end| offset >= end) {
            return Ok(None);
        }

        self.with_handle(|file| {
            file.seek(offset)?;
            while let Some((k, v)) = file.read_entry::<V>()? {
                match k.cmp(key) {
                    std::cmp::Ordering::Equal => return Ok(Some(v)),
                    std::cmp::Ordering::Greater => break,
                    std::cmp::Ordering::Less => {}
                }
            }
            Ok(None)
        })
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Append a mapping; `key` must be greater than every key already put.
    pub fn put(&mut self, key: K, value: V) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= *last {
                return Err(Error::out_of_order(last));
            }
        }

        let file = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .ok_or_else(|| Error::ReadOnly(self.path.display().to_string()))?;
        file.write(&key, &value)?;

        if self.first_key.is_none() {
            self.first_key = Some(key.clone());
        }
        self.last_key = Some(key);
        self.len += 1;
        Ok(())
    }

    /// Append entries already sorted by key
    pub fn put_all<I>(&mut self, entries: I) -> Result<usize>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut count = 0;
        for (key, value) in entries {
            self.put(key, value)?;
            count += 1;
        }
        Ok(count)
    }

    /// Sort `entries` by key and append them
    pub fn put_all_unsorted(&mut self, mut entries: Vec<(K, V)>) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let sort_start = Instant::now();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let sort_ms = sort_start.elapsed().as_millis();

        let write_start = Instant::now();
        let count = self.put_all(entries)?;
        self.flush()?;
        let write_secs = write_start.elapsed().as_secs_f64();

        let mb = std::fs::metadata(&self.path)
            .map(|m| m.len())
            .unwrap_or(0) as f64
            / 1024.0
            / 1024.0;
        info!("\tSorted {} keys in {}ms", count, sort_ms);
        info!(
            "\tExternalized {:.2}MB in {:.3}sec. Rate={:.2}MB/s",
            mb,
            write_secs,
            if write_secs > 0.0 { mb / write_secs } else { 0.0 }
        );
        Ok(count)
    }

    pub fn remove(&mut self, _key: &K) -> Result<Option<V>> {
        Err(Error::Unsupported("remove on an external sorted map"))
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(file) = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            file.flush()?;
        }
        Ok(())
    }

    /// Flush and release file handles; the map stays readable.
    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            file.close()?;
        }
        Ok(())
    }

    /// Close the map and delete its file.
    pub fn clear(&mut self) -> Result<()> {
        *self.handle.get_mut().unwrap_or_else(PoisonError::into_inner) = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("deleted {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.index = None;
        self.first_key = None;
        self.last_key = None;
        self.len = 0;
        Ok(())
    }

    /// Stream the entries of this map or view from an independent read handle
    pub fn iter(&self) -> Result<Entries<K, V>> {
        if let Some(file) = self.lock().as_mut() {
            file.flush()?;
        }

        let start = match self.start {
            Some(offset) => offset,
            None if self.bounded => self
                .first_key
                .as_ref()
                .and_then(|first| {
                    self.current_index()
                        .and_then(|index| index.entry_for_key(first).map(|e| e.offset))
                })
                .unwrap_or(0),
            None => 0,
        };

        let file = if self.len == 0 {
            None
        } else {
            Some(MapFile::open_read_at(
                &self.path,
                start,
                self.settings.buffer_size,
            )?)
        };

        Ok(Entries {
            file,
            remaining: self.len,
            lower: self.bounded.then(|| self.first_key.clone()).flatten(),
            upper: self.bounded.then(|| self.last_key.clone()).flatten(),
            _value: PhantomData,
        })
    }

    pub fn keys(&self) -> Result<impl Iterator<Item = Result<K>> + use<K, V>> {
        Ok(self.iter()?.map(|e| e.map(|(k, _)| k)))
    }

    pub fn values(&self) -> Result<impl Iterator<Item = Result<V>> + use<K, V>> {
        Ok(self.iter()?.map(|e| e.map(|(_, v)| v)))
    }

    fn make_view(&self, first: Option<K>, last: Option<K>, len: usize, start: Option<u64>, bounded: bool) -> Self {
        Self {
            path: self.path.clone(),
            handle: Mutex::new(None),
            index: self.current_index(),
            first_key: first,
            last_key: last,
            len,
            start,
            end: None,
            bounded,
            settings: self.settings,
            block_size: self.block_size,
            _value: PhantomData,
        }
    }

    /// View over the keys in the closed range `[from, to]`; `None` when `from > to`.
    pub fn sub_map(&self, from: &K, to: &K) -> Result<Option<Self>> {
        if from > to {
            return Ok(None);
        }

        // Count the range exactly so the view streams its recorded size
        let probe = self.make_view(Some(from.clone()), Some(to.clone()), self.len, None, true);
        let mut first = None;
        let mut last = None;
        let mut len = 0;
        for entry in probe.iter()? {
            let (key, _) = entry?;
            if first.is_none() {
                first = Some(key.clone());
            }
            last = Some(key);
            len += 1;
        }

        debug!(
            "view of {} over [{:?}, {:?}] has {} keys",
            self.path.display(),
            from,
            to,
            len
        );
        Ok(Some(self.make_view(first, last, len, None, true)))
    }

    /// Keys up to and including `to`
    pub fn head_map(&self, to: &K) -> Result<Option<Self>> {
        match &self.first_key {
            Some(first) => self.sub_map(&first.clone(), to),
            None => Ok(None),
        }
    }

    /// Keys from `from` on
    pub fn tail_map(&self, from: &K) -> Result<Option<Self>> {
        match &self.last_key {
            Some(last) => self.sub_map(from, &last.clone()),
            None => Ok(None),
        }
    }

    /// Independent handle over the same entries
    pub fn try_clone(&self) -> Result<Self> {
        let mut view = self.make_view(
            self.first_key.clone(),
            self.last_key.clone(),
            self.len,
            self.start,
            self.bounded,
        );
        view.end = self.end;
        Ok(view)
    }

    /// Cut the map into views of roughly `block_size` bytes each.
    ///
    /// Blocks follow index entries: a block starts at an entry and runs up to,
    /// but not including, the entry where the byte span reached `block_size`.
    /// The last block runs to the last key. Each view's key range ends at the
    /// boundary key shared with the next block, but neither streaming nor
    /// `get` reaches past the view's own records. A map without index entries
    /// comes back as a single view.
    pub fn splits(&self, block_size: u64) -> Result<Vec<Self>> {
        if self.len == 0 {
            return Ok(Vec::new());
        }

        let index = match self.current_index() {
            Some(index) if !index.is_empty() && self.start.is_none() && !self.bounded => index,
            _ => return Ok(vec![self.try_clone()?]),
        };

        let entries = index.as_slice();
        let n = entries.len();
        let mut splits = Vec::new();
        let mut from = 0;
        let mut consumed = 0usize;

        while from < n {
            let begin = entries[from].offset;
            let mut to = from + 1;
            let mut keys = 0usize;
            while to < n {
                keys += 1 + entries[to].skipped as usize;
                if entries[to].offset - begin >= block_size {
                    break;
                }
                to += 1;
            }

            let first = entries[from].key.clone();
            if to + 1 >= n {
                let keys = self.len - consumed;
                debug!(
                    "{} split [{:?}, {:?}] keys={}",
                    self.path.display(),
                    first,
                    self.last_key,
                    keys
                );
                splits.push(self.make_view(Some(first), self.last_key.clone(), keys, Some(begin), false));
                break;
            }

            let last = entries[to].key.clone();
            debug!(
                "{} split [{:?}, {:?}] keys={}",
                self.path.display(),
                first,
                last,
                keys
            );
            let mut view = self.make_view(Some(first), Some(last), keys, Some(begin), false);
            view.end = Some(entries[to].offset);
            splits.push(view);
            consumed += keys;
            from = to;
        }

        Ok(splits)
    }

    pub fn descriptor(&mut self) -> Result<ExternalMapDescriptor<K>> {
        self.flush()?;
        Ok(ExternalMapDescriptor {
            path: self.path.clone(),
            index: self.current_index().map(|i| i.as_slice().to_vec()),
            first_key: self.first_key.clone(),
            last_key: self.last_key.clone(),
            len: self.len,
            start: self.start,
            end: self.end,
            bounded: self.bounded,
        })
    }

    /// Reopen a map described by another process, read-only
    pub fn from_descriptor(descriptor: ExternalMapDescriptor<K>, config: &Config) -> Self {
        Self {
            path: descriptor.path,
            handle: Mutex::new(None),
            index: descriptor.index.map(MapFileIndex::from_entries),
            first_key: descriptor.first_key,
            last_key: descriptor.last_key,
            len: descriptor.len,
            start: descriptor.start,
            end: descriptor.end,
            bounded: descriptor.bounded,
            settings: MapFileSettings::from(config),
            block_size: config.block_size,
            _value: PhantomData,
        }
    }
}

impl<K: Key, T: Value + Ord> ExternalSortedMap<K, BTreeSet<T>> {
    /// All values of `key`; empty when absent
    pub fn get_all(&self, key: &K) -> Result<BTreeSet<T>> {
        Ok(self.get(key)?.unwrap_or_default())
    }

    pub fn contains(&self, key: &K, value: &T) -> Result<bool> {
        Ok(self.get(key)?.is_some_and(|values| values.contains(value)))
    }
}

impl<K, V> fmt::Debug for ExternalSortedMap<K, V>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalSortedMap")
            .field("path", &self.path)
            .field("first_key", &self.first_key)
            .field("last_key", &self.last_key)
            .field("len", &self.len)
            .finish()
    }
}

/// Entries of an external map or view, in key order
pub struct Entries<K, V> {
    file: Option<MapFile<K>>,
    remaining: usize,
    lower: Option<K>,
    upper: Option<K>,
    _value: PhantomData<fn() -> V>,
}

impl<K: Key, V: Value> Iterator for Entries<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            self.file = None;
            return None;
        }
        let file = self.file.as_mut()?;

        loop {
            match file.read_entry::<V>() {
                Err(e) => {
                    self.file = None;
                    return Some(Err(e));
                }
                Ok(None) => {
                    self.file = None;
                    return None;
                }
                Ok(Some((key, value))) => {
                    if self.lower.as_ref().is_some_and(|lower| key < *lower) {
                        continue;
                    }
                    if self.upper.as_ref().is_some_and(|upper| key > *upper) {
                        self.file = None;
                        return None;
                    }
                    self.remaining -= 1;
                    return Some(Ok((key, value)));
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.file.is_none() {
            (0, Some(0))
        } else {
            (0, Some(self.remaining))
        }
    }
}
