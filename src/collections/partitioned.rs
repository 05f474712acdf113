//! PartitionedMap - a map or multimap spread over P independent partitions.
//!
//! A key always lands in partition `hash(key) % P`. Threads fill replicas in
//! isolation; merging folds every replica's partition `i` into partition `i`
//! of the target, one pool task per partition. The final merge compacts spilled
//! partitions and, in a distributed run, moves every partition `i` to rank
//! `i % num_workers`, which merges it. The merged partitions are then handed
//! to rank 0, so the master holds the whole result.

use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::collections::external::{ExternalMapDescriptor, ExternalSortedMap};
use crate::collections::iterators::Interleave;
use crate::collections::merge::{EntrySource, MergeIterator};
use crate::collections::partial::{Component, PartialMap, SpillContext};
use crate::collections::policy::{Cardinality, KeyOrder, Multi, Single};
use crate::collections::{Adder, Key, MemMap, Value};
use crate::config::Config;
use crate::diskio::Storage;
use crate::distributed::Exchange;
use crate::error::{Error, Result};
use crate::memory;
use crate::scheduler::Split;
use crate::{MergeContext, Mergeable, Splits, Splittable};

/// Input unit handed out when a partitioned map feeds a later stage
#[derive(Debug)]
pub enum MapSplit<K, S> {
    /// Snapshot of a resident partition
    Memory(Vec<(K, S)>),
    /// Block of an external partition
    External(ExternalSortedMap<K, S>),
}

impl<K: Key, S: Value> MapSplit<K, S> {
    pub fn len(&self) -> usize {
        match self {
            MapSplit::Memory(entries) => entries.len(),
            MapSplit::External(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_entries(self) -> Result<EntrySource<'static, K, S>> {
        match self {
            MapSplit::Memory(entries) => Ok(Box::new(entries.into_iter().map(Ok))),
            MapSplit::External(map) => Ok(Box::new(map.iter()?)),
        }
    }
}

// One partition as it travels between ranks
#[derive(Serialize, Deserialize)]
enum WirePartition<K, S> {
    Entries(Vec<(K, S)>),
    External(ExternalMapDescriptor<K>),
}

pub struct PartitionedMap<K, C: Cardinality, O: KeyOrder> {
    partitions: Vec<PartialMap<K, C>>,
    cardinality: C,
    config: Arc<Config>,
    storage: Arc<Storage>,
    rank: usize,
    num_workers: usize,
    _order: PhantomData<fn() -> O>,
}

impl<K: Key, C: Cardinality, O: KeyOrder> PartitionedMap<K, C, O> {
    pub fn with_cardinality(config: Arc<Config>, cardinality: C) -> Self {
        let storage = Arc::new(Storage::new(&config));
        Self::with_storage(config, storage, cardinality)
    }

    fn with_storage(config: Arc<Config>, storage: Arc<Storage>, cardinality: C) -> Self {
        let count = config.partitions().max(1);
        let partitions = (0..count).map(|_| PartialMap::new(O::new_map())).collect();
        Self {
            partitions,
            cardinality,
            config,
            storage,
            rank: 0,
            num_workers: 1,
            _order: PhantomData,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn cardinality(&self) -> &C {
        &self.cardinality
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Partition a key belongs to; the same for every process
    pub fn partition_of(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    pub fn partition(&self, i: usize) -> &PartialMap<K, C> {
        &self.partitions[i]
    }

    pub fn partitions(&self) -> &[PartialMap<K, C>] {
        &self.partitions
    }

    /// Rank that merges partition `i` in the final round
    pub fn owner_of(&self, i: usize) -> usize {
        i % self.num_workers.max(1)
    }

    pub fn is_owned(&self, i: usize) -> bool {
        self.owner_of(i) == self.rank
    }

    pub fn get_stored(&self, key: &K) -> Result<Option<C::Stored>> {
        self.partitions[self.partition_of(key)].get(key, &self.cardinality)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get_stored(key)?.is_some())
    }

    /// Entries held; a spilled key may count once per component until the final merge
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(|p| p.is_empty())
    }

    /// Drop every entry and delete spilled files
    pub fn clear(&mut self) -> Result<()> {
        for partition in &mut self.partitions {
            partition.clear()?;
        }
        Ok(())
    }

    /// All entries. Sorted maps yield keys in ascending order across
    /// partitions; hashed maps go partition by partition.
    pub fn iter(&self) -> Result<EntrySource<'_, K, C::Stored>> {
        let sources = self
            .partitions
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| p.entries(&self.cardinality))
            .collect::<Result<Vec<_>>>()?;

        if O::SORTED {
            Ok(Box::new(MergeIterator::new(sources)))
        } else {
            Ok(Box::new(sources.into_iter().flatten()))
        }
    }

    pub fn keys(&self) -> Result<impl Iterator<Item = Result<K>> + '_> {
        Ok(self.iter()?.map(|e| e.map(|(k, _)| k)))
    }

    pub fn values(&self) -> Result<impl Iterator<Item = Result<C::Stored>> + '_> {
        Ok(self.iter()?.map(|e| e.map(|(_, v)| v)))
    }

    fn insert_stored(&mut self, key: K, value: C::Stored, combine: bool) -> Result<Option<C::Stored>> {
        let i = self.partition_of(&key);
        let cardinality = &self.cardinality;
        match self.partitions[i].current_mut() {
            Component::Memory(map) if combine => {
                map.upsert(key, value, |acc, v| cardinality.combine(acc, v));
                Ok(None)
            }
            Component::Memory(map) => Ok(map.insert(key, value)),
            Component::External(map) => {
                map.put(key, value)?;
                Ok(None)
            }
        }
    }

    fn remove_stored(&mut self, key: &K) -> Result<Option<C::Stored>> {
        let i = self.partition_of(key);
        if !self.partitions[i].on_disk().is_empty() {
            return Err(Error::Unsupported("remove on a spilled partition"));
        }
        match self.partitions[i].current_mut() {
            Component::Memory(map) => Ok(map.remove(key)),
            Component::External(map) => map.remove(key),
        }
    }

    /// Externalize every partition that holds resident data
    pub fn externalize_all(&mut self, pool: &rayon::ThreadPool) -> Result<()> {
        let ctx = SpillContext {
            storage: &self.storage,
            config: &self.config,
            cardinality: &self.cardinality,
        };
        let start = Instant::now();
        let results: Vec<Result<Option<u64>>> = pool.install(|| {
            self.partitions
                .par_iter_mut()
                .map(|p| p.externalize(true, &ctx))
                .collect()
        });
        let spilled = first_error(results, "externalize")?.iter().filter(|r| r.is_some()).count();
        info!(
            "Externalized {} partitions in {}ms",
            spilled,
            start.elapsed().as_millis()
        );
        Ok(())
    }

    fn merge_partials(&mut self, partials: Vec<Self>, ctx: &MergeContext<'_>) -> Result<()> {
        let count = self.partitions.len();
        for partial in &partials {
            if partial.partitions.len() != count {
                return Err(Error::PartitionMismatch {
                    expected: count,
                    found: partial.partitions.len(),
                });
            }
        }

        let start = Instant::now();
        let mut columns: Vec<Vec<PartialMap<K, C>>> = (0..count).map(|_| Vec::with_capacity(partials.len())).collect();
        for partial in partials {
            for (i, partition) in partial.partitions.into_iter().enumerate() {
                if !partition.is_empty() {
                    columns[i].push(partition);
                }
            }
        }

        let spill = SpillContext {
            storage: &self.storage,
            config: &self.config,
            cardinality: &self.cardinality,
        };
        let results: Vec<Result<u64>> = ctx.pool.install(|| {
            self.partitions
                .par_iter_mut()
                .zip(columns.into_par_iter())
                .map(|(partition, column)| {
                    if column.is_empty() {
                        return Ok(0);
                    }
                    partition.merge(column, &spill)
                })
                .collect()
        });
        let slowest = first_error(results, "merge")?.into_iter().max().unwrap_or(0);
        info!(
            "Merged {} partitions in {}ms (slowest {}ms)",
            count,
            start.elapsed().as_millis(),
            slowest
        );

        memory::collect_garbage(&self.config);
        if memory::should_externalize(&self.config) {
            self.externalize_all(ctx.pool)?;
            memory::collect_garbage(&self.config);
        }
        Ok(())
    }

    // Fold every spilled partition into a single indexed file
    fn compact_all(&mut self, pool: &rayon::ThreadPool) -> Result<()> {
        let start = Instant::now();
        let spill = SpillContext {
            storage: &self.storage,
            config: &self.config,
            cardinality: &self.cardinality,
        };
        let results: Vec<Result<()>> = pool.install(|| {
            self.partitions
                .par_iter_mut()
                .map(|partition| {
                    partition.externalize(false, &spill)?;
                    partition.compact(&spill)?;
                    partition.cleanup()
                })
                .collect()
        });
        first_error(results, "compact")?;
        info!("Compacted partitions in {}ms", start.elapsed().as_millis());
        Ok(())
    }

    fn finish(&mut self, ctx: &MergeContext<'_>) -> Result<()> {
        self.compact_all(ctx.pool)?;

        self.rank = ctx.rank;
        self.num_workers = ctx.num_workers.max(1);
        if self.num_workers > 1 {
            match ctx.exchange {
                Some(exchange) => self.exchange_partitions(exchange, ctx)?,
                None => warn!("no exchange link; partitions stay where they were merged"),
            }
        }
        Ok(())
    }

    fn encode_partition(&mut self, i: usize, inline: bool) -> Result<Option<WirePartition<K, C::Stored>>> {
        let partition = &mut self.partitions[i];
        if partition.is_empty() {
            return Ok(None);
        }
        let wire = match partition.current_mut() {
            Component::Memory(map) => WirePartition::Entries(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            Component::External(map) if inline => WirePartition::Entries(map.iter()?.collect::<Result<Vec<_>>>()?),
            Component::External(map) => WirePartition::External(map.descriptor()?),
        };
        Ok(Some(wire))
    }

    fn decode_partition(&self, wire: WirePartition<K, C::Stored>) -> PartialMap<K, C> {
        let component = match wire {
            WirePartition::Entries(entries) => {
                let mut map: MemMap<K, C::Stored> = O::new_map();
                for (key, value) in entries {
                    map.insert(key, value);
                }
                Component::Memory(map)
            }
            WirePartition::External(descriptor) => {
                Component::External(ExternalSortedMap::from_descriptor(descriptor, &self.config))
            }
        };
        PartialMap::from_component(component, O::SORTED)
    }

    // Move partition i to rank i % num_workers, through rank 0
    fn exchange_partitions(&mut self, exchange: &dyn Exchange, ctx: &MergeContext<'_>) -> Result<()> {
        let start = Instant::now();
        let workers = self.num_workers;
        let count = self.partitions.len();
        // Without shared storage, file contents travel inline
        let inline = self.storage.shared_dir().is_none();

        let mut outgoing = Vec::with_capacity(count);
        for i in 0..count {
            if self.is_owned(i) {
                outgoing.push(None);
            } else {
                outgoing.push(self.encode_partition(i, inline)?);
            }
        }
        let payload = bincode::serialize(&outgoing)?;

        let routed = match exchange.gather(payload)? {
            Some(per_rank) => Some(self.route(per_rank, workers)?),
            None => None,
        };
        let incoming: Vec<(usize, WirePartition<K, C::Stored>)> = bincode::deserialize(&exchange.scatter(routed)?)?;

        for i in 0..count {
            if self.is_owned(i) {
                continue;
            }
            if inline {
                self.partitions[i].clear()?;
            } else {
                self.partitions[i].release();
            }
        }

        let mut columns: Vec<Vec<PartialMap<K, C>>> = (0..count).map(|_| Vec::new()).collect();
        let received = incoming.len();
        for (i, wire) in incoming {
            if i >= count || !self.is_owned(i) {
                warn!("rank {} got partition {} it does not own", self.rank, i);
                continue;
            }
            columns[i].push(self.decode_partition(wire));
        }

        let spill = SpillContext {
            storage: &self.storage,
            config: &self.config,
            cardinality: &self.cardinality,
        };
        let results: Vec<Result<()>> = ctx.pool.install(|| {
            self.partitions
                .par_iter_mut()
                .zip(columns.into_par_iter())
                .map(|(partition, column)| {
                    if column.is_empty() {
                        return Ok(());
                    }
                    partition.merge(column, &spill)?;
                    partition.compact(&spill)?;
                    partition.cleanup()
                })
                .collect()
        });
        first_error(results, "exchange merge")?;

        let owned = (0..count).filter(|i| self.is_owned(*i)).count();
        info!(
            "Rank {} merged {} of {} partitions after exchange ({} received) in {}ms",
            self.rank,
            owned,
            count,
            received,
            start.elapsed().as_millis()
        );

        self.gather_partitions(exchange, ctx)
    }

    // Hand every merged partition to rank 0, which installs them in place
    fn gather_partitions(&mut self, exchange: &dyn Exchange, ctx: &MergeContext<'_>) -> Result<()> {
        let start = Instant::now();
        let count = self.partitions.len();
        let inline = self.storage.shared_dir().is_none();

        let mut outgoing: Vec<(usize, WirePartition<K, C::Stored>)> = Vec::new();
        if self.rank != 0 {
            for i in 0..count {
                if !self.is_owned(i) {
                    continue;
                }
                if let Some(wire) = self.encode_partition(i, inline)? {
                    outgoing.push((i, wire));
                }
            }
        }
        let sent = outgoing.len();
        let gathered = exchange.gather(bincode::serialize(&outgoing)?)?;

        if self.rank != 0 {
            // Rank 0 holds a copy, or the files themselves when they are shared
            for i in 0..count {
                if !self.is_owned(i) {
                    continue;
                }
                if inline {
                    self.partitions[i].clear()?;
                } else {
                    self.partitions[i].release();
                }
            }
            info!("Rank {} handed {} partitions to rank 0", self.rank, sent);
            return Ok(());
        }

        let per_rank = gathered.ok_or_else(|| Error::Protocol("rank 0 gathered no partitions".into()))?;
        let mut installed = 0;
        for (rank, payload) in per_rank.into_iter().enumerate().skip(1) {
            let Some(payload) = payload else {
                warn!("partitions merged by rank {} are missing", rank);
                continue;
            };
            let partitions: Vec<(usize, WirePartition<K, C::Stored>)> = bincode::deserialize(&payload)?;
            for (i, wire) in partitions {
                if i >= count || self.owner_of(i) != rank {
                    warn!("rank {} handed over partition {} it does not own", rank, i);
                    continue;
                }
                let partition = self.decode_partition(wire);
                std::mem::replace(&mut self.partitions[i], partition).clear()?;
                installed += 1;
            }
        }

        if memory::should_externalize(&self.config) {
            self.externalize_all(ctx.pool)?;
            self.compact_all(ctx.pool)?;
        }
        info!(
            "Rank 0 installed {} partitions from {} workers in {}ms",
            installed,
            self.num_workers - 1,
            start.elapsed().as_millis()
        );
        Ok(())
    }

    // Rank 0: regroup every rank's partitions by owner
    fn route(&self, per_rank: Vec<Option<Vec<u8>>>, workers: usize) -> Result<Vec<Vec<u8>>> {
        let mut by_owner: Vec<Vec<(usize, WirePartition<K, C::Stored>)>> = (0..workers).map(|_| Vec::new()).collect();
        for (rank, payload) in per_rank.into_iter().enumerate() {
            let Some(payload) = payload else {
                warn!("partitions of rank {} are missing from the exchange", rank);
                continue;
            };
            let partitions: Vec<Option<WirePartition<K, C::Stored>>> = bincode::deserialize(&payload)?;
            for (i, wire) in partitions.into_iter().enumerate() {
                let Some(wire) = wire else {
                    continue;
                };
                let owner = i % workers;
                if owner != rank {
                    by_owner[owner].push((i, wire));
                }
            }
        }
        by_owner
            .iter()
            .map(|contributions| bincode::serialize(contributions).map_err(Error::from))
            .collect()
    }
}

// Log every failed task, then report the first failure
fn first_error<T>(results: Vec<Result<T>>, what: &str) -> Result<Vec<T>> {
    let mut first = None;
    let mut values = Vec::with_capacity(results.len());
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(value) => values.push(value),
            Err(e) => {
                error!("partition {} {} failed: {}", i, what, e);
                first.get_or_insert(e);
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

impl<K: Key, V: Value, O: KeyOrder> PartitionedMap<K, Single<V>, O> {
    /// Map where a value put again replaces the old one
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_cardinality(config, Single::new())
    }

    /// Map where values of the same key are combined by `adder`
    pub fn with_adder<A: Adder<V> + 'static>(config: Arc<Config>, adder: A) -> Self {
        Self::with_cardinality(config, Single::with_adder(adder))
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.get_stored(key)
    }

    /// Set the value of `key`; the previous resident value is returned
    pub fn put(&mut self, key: K, value: V) -> Result<Option<V>> {
        self.insert_stored(key, value, false)
    }

    /// Combine `value` into the value of `key`
    pub fn add(&mut self, key: K, value: V) -> Result<()> {
        self.insert_stored(key, value, true)?;
        Ok(())
    }

    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        self.remove_stored(key)
    }
}

impl<K: Key, V: Value + Ord, O: KeyOrder> PartitionedMap<K, Multi<V>, O> {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_cardinality(config, Multi::new())
    }

    /// Add `value` to the values of `key`
    pub fn put(&mut self, key: K, value: V) -> Result<()> {
        self.insert_stored(key, BTreeSet::from([value]), true)?;
        Ok(())
    }

    pub fn put_all_values<I: IntoIterator<Item = V>>(&mut self, key: K, values: I) -> Result<()> {
        let values: BTreeSet<V> = values.into_iter().collect();
        if values.is_empty() {
            return Ok(());
        }
        self.insert_stored(key, values, true)?;
        Ok(())
    }

    /// Values of `key`; empty when absent
    pub fn get_all(&self, key: &K) -> Result<BTreeSet<V>> {
        Ok(self.get_stored(key)?.unwrap_or_default())
    }

    pub fn contains(&self, key: &K, value: &V) -> Result<bool> {
        Ok(self.get_stored(key)?.is_some_and(|values| values.contains(value)))
    }

    pub fn remove(&mut self, key: &K) -> Result<Option<BTreeSet<V>>> {
        self.remove_stored(key)
    }
}

impl<K: Key, C: Cardinality, O: KeyOrder> Splittable for PartitionedMap<K, C, O> {
    fn splits(&self) -> Result<Splits<'_>> {
        let mut per_partition: Vec<Splits<'_>> = Vec::new();
        for partition in &self.partitions {
            if partition.is_empty() {
                continue;
            }
            if !partition.on_disk().is_empty() {
                return Err(Error::Unsupported("splitting a partition that was not compacted"));
            }
            match partition.current() {
                Component::External(map) => {
                    let views = map.splits(self.config.block_size)?;
                    per_partition.push(Box::new(
                        views.into_iter().map(|view| Split::new(MapSplit::External(view))),
                    ));
                }
                Component::Memory(map) => {
                    let snapshot: Vec<(K, C::Stored)> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    per_partition.push(Box::new(std::iter::once(Split::new(MapSplit::<K, C::Stored>::Memory(
                        snapshot,
                    )))));
                }
            }
        }
        Ok(Box::new(Interleave::new(per_partition)))
    }
}

impl<K: Key, C: Cardinality, O: KeyOrder> Mergeable for PartitionedMap<K, C, O> {
    fn replicate(&self) -> Self {
        Self::with_storage(
            Arc::clone(&self.config),
            Arc::clone(&self.storage),
            self.cardinality.clone(),
        )
    }

    fn merge(&mut self, partials: Option<Vec<Self>>, ctx: &MergeContext<'_>) -> Result<()> {
        match partials {
            Some(partials) => self.merge_partials(partials, ctx),
            None => self.finish(ctx),
        }
    }
}

impl<K, C: Cardinality, O: KeyOrder> fmt::Debug for PartitionedMap<K, C, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedMap")
            .field("partitions", &self.partitions.len())
            .field("sorted", &O::SORTED)
            .field("rank", &self.rank)
            .field("num_workers", &self.num_workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::adders::Sum;
    use crate::collections::{MergeableMap, MergeableMultimap, MergeableSortedMap};
    use crate::distributed::MemoryExchange;
    use rand::seq::SliceRandom;
    use rayon::ThreadPoolBuilder;
    use tempfile::TempDir;

    fn config(dir: &TempDir, threads: usize) -> Arc<Config> {
        Arc::new(
            Config::default()
                .with_local_dir(dir.path())
                .with_threads(threads)
                .with_bytes_per_index(64)
                .with_block_size(256)
                .with_min_free(0),
        )
    }

    fn pool(threads: usize) -> rayon::ThreadPool {
        ThreadPoolBuilder::new().num_threads(threads).build().unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let dir = TempDir::new().unwrap();
        let mut map = MergeableMap::<String, u32>::new(config(&dir, 4));
        assert_eq!(map.partition_count(), 4);

        assert_eq!(map.put("a".into(), 1).unwrap(), None);
        assert_eq!(map.put("a".into(), 2).unwrap(), Some(1));
        map.put("b".into(), 3).unwrap();
        assert_eq!(map.get(&"a".into()).unwrap(), Some(2));
        assert!(map.contains_key(&"b".into()).unwrap());
        assert_eq!(map.len(), 2);

        assert_eq!(map.remove(&"a".into()).unwrap(), Some(2));
        assert_eq!(map.get(&"a".into()).unwrap(), None);
        assert!(!map.is_empty());
    }

    #[test]
    fn test_partition_is_stable() {
        let dir = TempDir::new().unwrap();
        let a = MergeableMap::<u64, u64>::new(config(&dir, 3));
        let b = MergeableMap::<u64, u64>::new(config(&dir, 3));
        for key in 0..100u64 {
            let p = a.partition_of(&key);
            assert!(p < 3);
            assert_eq!(p, b.partition_of(&key));
        }
    }

    #[test]
    fn test_merge_replicas() {
        let dir = TempDir::new().unwrap();
        let pool = pool(2);
        let ctx = MergeContext::local(&pool);
        let mut map = MergeableMap::<u64, u64>::with_adder(config(&dir, 2), Sum);

        let replicas: Vec<_> = (0..4)
            .map(|_| {
                let mut r = map.replicate();
                assert!(r.is_empty());
                r.add(1, 1).unwrap();
                r
            })
            .collect();
        map.merge(Some(replicas), &ctx).unwrap();
        map.merge(None, &ctx).unwrap();
        assert_eq!(map.get(&1).unwrap(), Some(4));
    }

    #[test]
    fn test_partition_mismatch() {
        let dir = TempDir::new().unwrap();
        let pool = pool(1);
        let mut map = MergeableMap::<u64, u64>::new(config(&dir, 2));
        let other = MergeableMap::<u64, u64>::new(config(&dir, 3));
        assert!(matches!(
            map.merge(Some(vec![other]), &MergeContext::local(&pool)),
            Err(Error::PartitionMismatch {
                expected: 2,
                found: 3
            })
        ));
    }

    #[test]
    fn test_forced_externalization_keeps_results() {
        let dir = TempDir::new().unwrap();
        let pool = pool(2);
        let ctx = MergeContext::local(&pool);
        let base = config(&dir, 2);
        let spilling = Arc::new((*base).clone().with_min_free(u64::MAX));

        let mut resident = MergeableMap::<u64, u64>::with_adder(Arc::clone(&base), Sum);
        let mut spilled = MergeableMap::<u64, u64>::with_adder(Arc::clone(&spilling), Sum);
        for round in 0..3u64 {
            let mut a = resident.replicate();
            let mut b = spilled.replicate();
            for key in 0..50u64 {
                a.add(key, round + 1).unwrap();
                b.add(key, round + 1).unwrap();
            }
            resident.merge(Some(vec![a]), &ctx).unwrap();
            spilled.merge(Some(vec![b]), &ctx).unwrap();
            assert!(spilled.partitions().iter().all(|p| p.is_spilled()));
        }
        resident.merge(None, &ctx).unwrap();
        spilled.merge(None, &ctx).unwrap();

        for key in 0..50u64 {
            assert_eq!(spilled.get(&key).unwrap(), Some(6));
            assert_eq!(resident.get(&key).unwrap(), spilled.get(&key).unwrap());
        }
        assert!(spilled.partitions().iter().all(|p| p.on_disk().is_empty()));
        assert!(spilled.partitions().iter().all(|p| p.current().is_external()));
        assert_eq!(spilled.iter().unwrap().count(), 50);
    }

    #[test]
    fn test_sorted_iteration() {
        let dir = TempDir::new().unwrap();
        let mut map = MergeableSortedMap::<u32, u32>::new(config(&dir, 4));
        let mut keys: Vec<u32> = (0..200).collect();
        keys.shuffle(&mut rand::rng());
        for key in &keys {
            map.put(*key, key * 2).unwrap();
        }

        let entries: Vec<(u32, u32)> = map.iter().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 200);
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(entries[17], (17, 34));
        assert_eq!(
            map.keys().unwrap().map(|k| k.unwrap()).collect::<Vec<_>>(),
            (0..200).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_multimap_union() {
        let dir = TempDir::new().unwrap();
        let pool = pool(2);
        let ctx = MergeContext::local(&pool);
        let mut map = MergeableMultimap::<String, u32>::new(config(&dir, 2));

        let mut a = map.replicate();
        a.put("x".into(), 1).unwrap();
        a.put("x".into(), 2).unwrap();
        let mut b = map.replicate();
        b.put_all_values("x".into(), [2, 3]).unwrap();
        b.put("y".into(), 9).unwrap();
        map.merge(Some(vec![a, b]), &ctx).unwrap();
        map.merge(None, &ctx).unwrap();

        assert_eq!(
            map.get_all(&"x".into()).unwrap(),
            BTreeSet::from([1, 2, 3])
        );
        assert!(map.contains(&"y".into(), &9).unwrap());
        assert!(!map.contains(&"y".into(), &1).unwrap());
        assert!(map.get_all(&"z".into()).unwrap().is_empty());
    }

    #[test]
    fn test_splits_cover_resident_and_external_partitions() {
        let dir = TempDir::new().unwrap();
        let pool = pool(2);
        let ctx = MergeContext::local(&pool);
        let base = config(&dir, 2);

        let mut map = MergeableMap::<u64, u64>::with_adder(Arc::clone(&base), Sum);
        let mut replica = map.replicate();
        for key in 0..300u64 {
            replica.add(key, key).unwrap();
        }
        map.merge(Some(vec![replica]), &ctx).unwrap();
        map.externalize_all(&pool).unwrap();
        map.merge(None, &ctx).unwrap();

        let mut seen = Vec::new();
        let mut splits = 0;
        for split in map.splits().unwrap() {
            splits += 1;
            let split = split.take::<MapSplit<u64, u64>>().unwrap();
            for entry in split.into_entries().unwrap() {
                seen.push(entry.unwrap());
            }
        }
        assert!(splits > map.partition_count());
        seen.sort();
        assert_eq!(seen, (0..300u64).map(|k| (k, k)).collect::<Vec<_>>());

        // A resident map gives one split per non-empty partition
        let mut small = MergeableMap::<u64, u64>::new(Arc::clone(&base));
        small.put(1, 1).unwrap();
        let only: Vec<_> = small.splits().unwrap().collect();
        assert_eq!(only.len(), 1);
    }

    #[test]
    fn test_external_partition_rejects_remove() {
        let dir = TempDir::new().unwrap();
        let pool = pool(1);
        let ctx = MergeContext::local(&pool);
        let mut map = MergeableMap::<u64, u64>::new(config(&dir, 1));
        map.put(1, 1).unwrap();
        map.externalize_all(&pool).unwrap();
        assert!(matches!(map.remove(&1), Err(Error::Unsupported(_))));
        map.merge(None, &ctx).unwrap();
        assert!(matches!(map.remove(&1), Err(Error::Unsupported(_))));
        assert_eq!(map.get(&1).unwrap(), Some(1));
    }

    fn exchange_round(shared: bool) {
        let dir = TempDir::new().unwrap();
        let shared_dir = TempDir::new().unwrap();
        let mut config = Config::default()
            .with_local_dir(dir.path())
            .with_threads(2)
            .with_workers(["w1", "w2"])
            .with_min_free(0);
        if shared {
            config = config.with_shared_dir(shared_dir.path());
        }
        let config = Arc::new(config);

        let maps: Vec<MergeableMap<u64, u64>> = crossbeam::scope(|s| {
            let handles: Vec<_> = MemoryExchange::group(3)
                .into_iter()
                .map(|exchange| {
                    let config = Arc::clone(&config);
                    s.spawn(move |_| {
                        let pool = pool(2);
                        let rank = exchange.rank();
                        let mut map = MergeableMap::<u64, u64>::with_adder(config, Sum);
                        // Every rank sees every key; rank 1 spills its share
                        for key in 0..60u64 {
                            map.add(key, rank as u64 + 1).unwrap();
                        }
                        if rank == 1 {
                            map.externalize_all(&pool).unwrap();
                        }
                        let ctx = MergeContext {
                            pool: &pool,
                            rank,
                            num_workers: 3,
                            exchange: Some(&exchange),
                        };
                        map.merge(None, &ctx).unwrap();
                        map
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
        .unwrap();

        for (rank, map) in maps.iter().enumerate() {
            assert_eq!(map.partition_count(), 6);
            for i in 0..map.partition_count() {
                assert_eq!(map.owner_of(i), i % 3);
                assert_eq!(map.is_owned(i), i % 3 == rank);
            }
        }

        // Workers hand their merged partitions over to rank 0
        let master = &maps[0];
        assert!(maps[1].is_empty());
        assert!(maps[2].is_empty());
        assert_eq!(master.len(), 60);
        if shared {
            // Rank 1 spilled, so every merged partition is a shared file
            assert!(
                master
                    .partitions()
                    .iter()
                    .filter(|p| !p.is_empty())
                    .all(|p| p.current().is_external())
            );
        }
        let mut total = 0;
        for entry in master.iter().unwrap() {
            let (_, value) = entry.unwrap();
            assert_eq!(value, 1 + 2 + 3);
            total += 1;
        }
        assert_eq!(total, 60);
        for key in 0..60u64 {
            assert_eq!(master.get(&key).unwrap(), Some(6));
        }
    }

    #[test]
    fn test_exchange_inline() {
        exchange_round(false);
    }

    #[test]
    fn test_exchange_through_shared_dir() {
        exchange_round(true);
    }
}
