use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::hash::Hash;

use crate::collections::external::ExternalSortedMap;
use crate::collections::mem::MemMap;
use crate::collections::{Key, Value};
use crate::error::{Error, Result};

/// Sorted, fallible stream of entries feeding a k-way merge
pub type EntrySource<'a, K, V> = Box<dyn Iterator<Item = Result<(K, V)>> + Send + 'a>;

// K-way merge iterator over sorted sources
pub struct MergeIterator<K, V, I> {
    // Min heap of (key, value, source_index)
    heap: BinaryHeap<HeapEntry<K, V>>,
    iterators: Vec<I>,
    // First source failure, reported before anything else
    error: Option<Error>,
}

struct HeapEntry<K, V> {
    key: K,
    value: V,
    source: usize,
}

// Reverse ordering for min-heap; equal keys come out in source order
impl<K: Ord, V> Ord for HeapEntry<K, V> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

impl<K: Ord, V> PartialOrd for HeapEntry<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, V> Eq for HeapEntry<K, V> {}

impl<K: Ord, V> PartialEq for HeapEntry<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl<K, V, I> MergeIterator<K, V, I>
where
    K: Ord,
    I: Iterator<Item = Result<(K, V)>>,
{
    pub fn new(mut iterators: Vec<I>) -> Self {
        let mut heap = BinaryHeap::with_capacity(iterators.len());
        let mut error = None;

        for (i, iter) in iterators.iter_mut().enumerate() {
            match iter.next() {
                Some(Ok((key, value))) => heap.push(HeapEntry {
                    key,
                    value,
                    source: i,
                }),
                Some(Err(e)) => {
                    error.get_or_insert(e);
                }
                None => {}
            }
        }

        Self {
            heap,
            iterators,
            error,
        }
    }
}

impl<K, V, I> Iterator for MergeIterator<K, V, I>
where
    K: Ord,
    I: Iterator<Item = Result<(K, V)>>,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            self.heap.clear();
            return Some(Err(e));
        }

        let entry = self.heap.pop()?;

        // Refill from the same source
        match self.iterators[entry.source].next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry {
                key,
                value,
                source: entry.source,
            }),
            Some(Err(e)) => self.error = Some(e),
            None => {}
        }

        Some(Ok((entry.key, entry.value)))
    }
}

/// Folds runs of equal keys of a sorted stream into one entry.
pub struct Combined<K, V, I, F> {
    inner: I,
    pending: Option<(K, V)>,
    error: Option<Error>,
    combine: F,
}

impl<K, V, I, F> Combined<K, V, I, F>
where
    K: Eq,
    I: Iterator<Item = Result<(K, V)>>,
    F: FnMut(&mut V, V),
{
    pub fn new(inner: I, combine: F) -> Self {
        Self {
            inner,
            pending: None,
            error: None,
            combine,
        }
    }
}

impl<K, V, I, F> Iterator for Combined<K, V, I, F>
where
    K: Eq,
    I: Iterator<Item = Result<(K, V)>>,
    F: FnMut(&mut V, V),
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            return Some(Err(e));
        }

        let mut current = match self.pending.take() {
            Some(entry) => entry,
            None => match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            },
        };

        loop {
            match self.inner.next() {
                Some(Ok((key, value))) if key == current.0 => (self.combine)(&mut current.1, value),
                Some(Ok(next)) => {
                    self.pending = Some(next);
                    break;
                }
                Some(Err(e)) => {
                    self.error = Some(e);
                    break;
                }
                None => break,
            }
        }

        Some(Ok(current))
    }
}

/// Fold every source into `dest`, combining values of keys already present.
///
/// Sources are consumed one at a time so that each one's memory is released
/// as soon as it has been folded in. Returns the number of entries folded.
pub fn merge_in_memory<K, V, F>(dest: &mut MemMap<K, V>, sources: Vec<MemMap<K, V>>, combine: F) -> usize
where
    K: Ord + Hash,
    F: Fn(&mut V, V),
{
    let mut folded = 0;
    for source in sources {
        for (key, value) in source {
            dest.upsert(key, value, &combine);
            folded += 1;
        }
    }
    folded
}

/// K-way merge of sorted sources into an empty external map.
///
/// Writes one entry per distinct key. A single source is copied as is and no
/// entry at all is written when every source is empty. Returns the number of
/// entries written.
pub fn merge_sorted<K, V, F>(
    mut sources: Vec<EntrySource<'_, K, V>>,
    dest: &mut ExternalSortedMap<K, V>,
    combine: F,
) -> Result<usize>
where
    K: Key,
    V: Value,
    F: FnMut(&mut V, V),
{
    let mut written = 0;
    match sources.len() {
        0 => {}
        1 => {
            for entry in sources.remove(0) {
                let (key, value) = entry?;
                dest.put(key, value)?;
                written += 1;
            }
        }
        _ => {
            for entry in Combined::new(MergeIterator::new(sources), combine) {
                let (key, value) = entry?;
                dest.put(key, value)?;
                written += 1;
            }
        }
    }
    dest.flush()?;
    Ok(written)
}
