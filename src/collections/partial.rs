//! PartialMap - one partition of a mergeable collection and its spill state.
//!
//! A partition is RESIDENT while all of its data sits in `current` as an
//! in-memory map, and SPILLED once it has on-disk components or `current`
//! itself became an external map. Every transition reports its duration in
//! milliseconds for the merge log lines.

use std::time::Instant;

use tracing::{debug, warn};

use crate::collections::external::ExternalSortedMap;
use crate::collections::mem::MemMap;
use crate::collections::merge::{Combined, EntrySource, MergeIterator, merge_in_memory, merge_sorted};
use crate::collections::policy::Cardinality;
use crate::collections::{Key, Value};
use crate::config::Config;
use crate::diskio::{FileKind, Storage};
use crate::error::Result;

/// What a partition currently holds
#[derive(Debug)]
pub enum Component<K, S> {
    Memory(MemMap<K, S>),
    External(ExternalSortedMap<K, S>),
}

impl<K: Key, S: Value> Component<K, S> {
    pub fn len(&self) -> usize {
        match self {
            Component::Memory(m) => m.len(),
            Component::External(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Component::External(_))
    }

    pub fn get(&self, key: &K) -> Result<Option<S>> {
        match self {
            Component::Memory(m) => Ok(m.get(key).cloned()),
            Component::External(m) => m.get(key),
        }
    }

    /// Entries in key order, borrowing nothing from `self`
    pub fn sorted_entries(&self) -> Result<EntrySource<'static, K, S>> {
        match self {
            Component::Memory(m) => {
                let mut entries: Vec<(K, S)> =
                    m.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                if !m.is_sorted() {
                    entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
                }
                Ok(Box::new(entries.into_iter().map(Ok)))
            }
            Component::External(m) => Ok(Box::new(m.iter()?)),
        }
    }

    /// Release the component; external files are deleted
    fn discard(self) {
        if let Component::External(mut m) = self {
            if let Err(e) = m.clear() {
                warn!("could not delete {}: {}", m.path().display(), e);
            }
        }
    }
}

/// Collaborators a partition needs to spill and merge
pub struct SpillContext<'a, C> {
    pub storage: &'a Storage,
    pub config: &'a Config,
    pub cardinality: &'a C,
}

pub struct PartialMap<K, C: Cardinality> {
    current: Component<K, C::Stored>,
    on_disk: Vec<ExternalSortedMap<K, C::Stored>>,
    sorted: bool,
}

impl<K: Key, C: Cardinality> PartialMap<K, C> {
    pub fn new(map: MemMap<K, C::Stored>) -> Self {
        let sorted = map.is_sorted();
        Self {
            current: Component::Memory(map),
            on_disk: Vec::new(),
            sorted,
        }
    }

    /// Partition holding `component`; `sorted` picks the resident map kind
    pub fn from_component(component: Component<K, C::Stored>, sorted: bool) -> Self {
        Self {
            current: component,
            on_disk: Vec::new(),
            sorted,
        }
    }

    fn empty_map(&self) -> MemMap<K, C::Stored> {
        if self.sorted {
            MemMap::sorted()
        } else {
            MemMap::hashed()
        }
    }

    pub fn current(&self) -> &Component<K, C::Stored> {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut Component<K, C::Stored> {
        &mut self.current
    }

    pub fn on_disk(&self) -> &[ExternalSortedMap<K, C::Stored>] {
        &self.on_disk
    }

    pub fn is_spilled(&self) -> bool {
        !self.on_disk.is_empty() || self.current.is_external()
    }

    /// Entries held, counting a key once per component it appears in
    pub fn len(&self) -> usize {
        self.current.len() + self.on_disk.iter().map(|m| m.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.on_disk.iter().all(|m| m.is_empty())
    }

    /// Value of `key` across the resident map and indexed components
    pub fn get(&self, key: &K, cardinality: &C) -> Result<Option<C::Stored>> {
        let mut found = self.current.get(key)?;
        for map in &self.on_disk {
            if let Some(value) = map.get(key)? {
                match found.as_mut() {
                    Some(acc) => cardinality.combine(acc, value),
                    None => found = Some(value),
                }
            }
        }
        Ok(found)
    }

    /// Entries of all components in key order, equal keys combined.
    ///
    /// A partition that never spilled streams its resident map directly, in
    /// that map's own order.
    pub fn entries<'a>(&'a self, cardinality: &'a C) -> Result<EntrySource<'a, K, C::Stored>> {
        if self.on_disk.is_empty() {
            return match &self.current {
                Component::Memory(m) => Ok(Box::new(m.iter().map(|(k, v)| Ok((k.clone(), v.clone()))))),
                Component::External(m) => Ok(Box::new(m.iter()?)),
            };
        }

        let mut sources: Vec<EntrySource<'a, K, C::Stored>> = Vec::with_capacity(self.on_disk.len() + 1);
        sources.push(self.current.sorted_entries()?);
        for map in &self.on_disk {
            sources.push(Box::new(map.iter()?));
        }
        Ok(Box::new(Combined::new(MergeIterator::new(sources), move |acc, v| {
            cardinality.combine(acc, v)
        })))
    }

    /// Adopt the on-disk components of another partial map
    pub fn add(&mut self, other: PartialMap<K, C>) {
        let PartialMap {
            current, on_disk, ..
        } = other;
        self.on_disk.extend(on_disk);
        if !current.is_empty() {
            warn!(
                "dropping {} resident entries of an adopted partition",
                current.len()
            );
        }
    }

    /// Fold partial results of the same partition into this one.
    pub fn merge(&mut self, partials: Vec<PartialMap<K, C>>, ctx: &SpillContext<'_, C>) -> Result<u64> {
        let start = Instant::now();

        let mut components = Vec::with_capacity(partials.len());
        for partial in partials {
            let PartialMap {
                current, on_disk, ..
            } = partial;
            self.on_disk.extend(on_disk.into_iter().filter(|m| !m.is_empty()));
            if !current.is_empty() {
                components.push(current);
            }
        }
        if components.is_empty() {
            return Ok(0);
        }

        // Nothing to merge into: take one partial as is
        if self.current.is_empty() {
            let adopted = components.remove(0);
            std::mem::replace(&mut self.current, adopted).discard();
            if components.is_empty() {
                return Ok(start.elapsed().as_millis() as u64);
            }
        }

        let all_resident = !self.current.is_external() && components.iter().all(|c| !c.is_external());
        if all_resident {
            if let Component::Memory(dest) = &mut self.current {
                let sources = components
                    .into_iter()
                    .filter_map(|c| match c {
                        Component::Memory(m) => Some(m),
                        Component::External(_) => None,
                    })
                    .collect();
                let cardinality = ctx.cardinality;
                merge_in_memory(dest, sources, |acc, v| cardinality.combine(acc, v));
            }
        } else {
            let current = self.take_current();
            components.push(current);
            let merged = merge_components(components, ctx)?;
            self.current = Component::External(merged);
        }

        Ok(start.elapsed().as_millis() as u64)
    }

    /// Write the resident map out as an unindexed intermediate file.
    ///
    /// Happens only for a non-empty resident map, and only when `force` is set
    /// or the partition already spilled before. Returns `None` when nothing was
    /// written.
    pub fn externalize(&mut self, force: bool, ctx: &SpillContext<'_, C>) -> Result<Option<u64>> {
        let empty = self.empty_map();
        let Component::Memory(map) = &mut self.current else {
            return Ok(None);
        };
        if map.is_empty() || !(force || !self.on_disk.is_empty()) {
            return Ok(None);
        }

        let start = Instant::now();
        let mut external = ExternalSortedMap::create(ctx.storage, FileKind::Intermediate, ctx.config)?;
        let entries: Vec<_> = std::mem::replace(map, empty).into_iter().collect();
        external.put_all_unsorted(entries)?;
        external.close()?;
        self.on_disk.push(external);

        Ok(Some(start.elapsed().as_millis() as u64))
    }

    /// Merge every on-disk component, and `current`, into one indexed map.
    pub fn compact(&mut self, ctx: &SpillContext<'_, C>) -> Result<Option<u64>> {
        if self.on_disk.is_empty() {
            return Ok(None);
        }

        let start = Instant::now();
        let mut components: Vec<_> = self.on_disk.drain(..).map(Component::External).collect();
        let current = self.take_current();
        if !current.is_empty() {
            components.push(current);
        } else {
            current.discard();
        }

        let merged = merge_components(components, ctx)?;
        self.current = Component::External(merged);
        Ok(Some(start.elapsed().as_millis() as u64))
    }

    /// Flush the current external map and delete superseded components.
    pub fn cleanup(&mut self) -> Result<()> {
        if let Component::External(map) = &mut self.current {
            map.flush()?;
        }
        for mut map in self.on_disk.drain(..) {
            map.clear()?;
        }
        Ok(())
    }

    /// Hand the partition's data over, leaving an empty resident map
    pub fn take_current(&mut self) -> Component<K, C::Stored> {
        let empty = Component::Memory(self.empty_map());
        std::mem::replace(&mut self.current, empty)
    }

    /// Empty the partition and delete every file it owns
    pub fn clear(&mut self) -> Result<()> {
        self.take_current().discard();
        for mut map in self.on_disk.drain(..) {
            map.clear()?;
        }
        Ok(())
    }

    /// Drop the partition without deleting any file
    pub fn release(&mut self) {
        self.current = Component::Memory(self.empty_map());
        self.on_disk.clear();
    }
}

// K-way merge into a new final map; consumed external inputs are deleted
fn merge_components<K: Key, C: Cardinality>(
    components: Vec<Component<K, C::Stored>>,
    ctx: &SpillContext<'_, C>,
) -> Result<ExternalSortedMap<K, C::Stored>> {
    let mut dest = ExternalSortedMap::create(ctx.storage, FileKind::Final, ctx.config)?;
    let sources = components
        .iter()
        .map(|c| c.sorted_entries())
        .collect::<Result<Vec<_>>>()?;

    let cardinality = ctx.cardinality;
    let written = merge_sorted(sources, &mut dest, |acc, v| cardinality.combine(acc, v))?;
    debug!(
        "merged {} components into {} ({} keys)",
        components.len(),
        dest.path().display(),
        written
    );

    for component in components {
        component.discard();
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::adders::Sum;
    use crate::collections::policy::{Multi, Single};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: Config,
        storage: Storage,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = Config::default()
            .with_local_dir(dir.path())
            .with_bytes_per_index(64);
        let storage = Storage::new(&config);
        Fixture {
            _dir: dir,
            config,
            storage,
        }
    }

    fn resident(entries: &[(u32, u64)]) -> PartialMap<u32, Single<u64>> {
        let mut map = MemMap::hashed();
        for &(k, v) in entries {
            map.insert(k, v);
        }
        PartialMap::new(map)
    }

    fn contents(partial: &PartialMap<u32, Single<u64>>) -> Vec<(u32, u64)> {
        partial
            .current()
            .sorted_entries()
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
    }

    #[test]
    fn test_merge_adopts_when_empty() {
        let f = fixture();
        let sum = Single::with_adder(Sum);
        let ctx = SpillContext {
            storage: &f.storage,
            config: &f.config,
            cardinality: &sum,
        };

        let mut partial = resident(&[]);
        partial
            .merge(vec![resident(&[]), resident(&[(1, 1)])], &ctx)
            .unwrap();
        assert_eq!(contents(&partial), vec![(1, 1)]);
        assert!(!partial.is_spilled());
    }

    #[test]
    fn test_merge_in_memory_adds() {
        let f = fixture();
        let sum = Single::with_adder(Sum);
        let ctx = SpillContext {
            storage: &f.storage,
            config: &f.config,
            cardinality: &sum,
        };

        let mut partial = resident(&[(1, 1)]);
        partial
            .merge(
                vec![resident(&[(1, 1), (2, 2)]), resident(&[(1, 1)]), resident(&[(1, 1)])],
                &ctx,
            )
            .unwrap();
        assert_eq!(contents(&partial), vec![(1, 4), (2, 2)]);
    }

    #[test]
    fn test_externalize_rules() {
        let f = fixture();
        let sum = Single::with_adder(Sum);
        let ctx = SpillContext {
            storage: &f.storage,
            config: &f.config,
            cardinality: &sum,
        };

        // Not forced and never spilled: stays resident
        let mut partial = resident(&[(1, 1)]);
        assert_eq!(partial.externalize(false, &ctx).unwrap(), None);
        assert!(!partial.is_spilled());

        assert!(partial.externalize(true, &ctx).unwrap().is_some());
        assert!(partial.is_spilled());
        assert!(partial.current().is_empty());
        assert_eq!(partial.on_disk().len(), 1);

        // Empty resident map: nothing to write
        assert_eq!(partial.externalize(true, &ctx).unwrap(), None);

        // Already spilled: the next non-empty resident map follows without force
        partial.merge(vec![resident(&[(1, 5)])], &ctx).unwrap();
        assert!(partial.externalize(false, &ctx).unwrap().is_some());
        assert_eq!(partial.on_disk().len(), 2);
    }

    #[test]
    fn test_compact_and_cleanup() {
        let f = fixture();
        let sum = Single::with_adder(Sum);
        let ctx = SpillContext {
            storage: &f.storage,
            config: &f.config,
            cardinality: &sum,
        };

        let mut partial = resident(&[(1, 1), (2, 2)]);
        partial.externalize(true, &ctx).unwrap();
        partial.merge(vec![resident(&[(2, 3), (3, 3)])], &ctx).unwrap();
        partial.externalize(false, &ctx).unwrap();
        partial.merge(vec![resident(&[(3, 4), (4, 4)])], &ctx).unwrap();

        let spilled: Vec<_> = partial
            .on_disk()
            .iter()
            .map(|m| m.path().to_path_buf())
            .collect();
        assert_eq!(spilled.len(), 2);

        assert!(partial.compact(&ctx).unwrap().is_some());
        partial.cleanup().unwrap();

        assert!(partial.current().is_external());
        assert!(partial.on_disk().is_empty());
        assert!(spilled.iter().all(|p| !p.exists()));
        assert_eq!(contents(&partial), vec![(1, 1), (2, 5), (3, 7), (4, 4)]);
        assert_eq!(partial.get(&3, &sum).unwrap(), Some(7));

        // Nothing left to compact
        assert_eq!(partial.compact(&ctx).unwrap(), None);
    }

    #[test]
    fn test_entries_combine_spilled_components() {
        let f = fixture();
        let sum = Single::with_adder(Sum);
        let ctx = SpillContext {
            storage: &f.storage,
            config: &f.config,
            cardinality: &sum,
        };

        let mut partial = resident(&[(3, 1), (1, 1)]);
        partial.externalize(true, &ctx).unwrap();
        partial.merge(vec![resident(&[(2, 2), (3, 2)])], &ctx).unwrap();

        let entries: Vec<_> = partial.entries(&sum).unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries, vec![(1, 1), (2, 2), (3, 3)]);

        partial.clear().unwrap();
        assert!(partial.is_empty());
        assert!(!partial.is_spilled());
    }

    #[test]
    fn test_merge_into_external_current() {
        let f = fixture();
        let sum = Single::with_adder(Sum);
        let ctx = SpillContext {
            storage: &f.storage,
            config: &f.config,
            cardinality: &sum,
        };

        let mut partial = resident(&[(1, 1)]);
        partial.externalize(true, &ctx).unwrap();
        partial.compact(&ctx).unwrap();
        let old = match partial.current() {
            Component::External(m) => m.path().to_path_buf(),
            Component::Memory(_) => panic!("expected an external map"),
        };

        partial
            .merge(vec![resident(&[(1, 2), (5, 5)])], &ctx)
            .unwrap();
        assert!(partial.current().is_external());
        assert!(!old.exists());
        assert_eq!(contents(&partial), vec![(1, 3), (5, 5)]);
    }

    #[test]
    fn test_multi_partition_unions() {
        let f = fixture();
        let multi = Multi::<u8>::new();
        let ctx = SpillContext {
            storage: &f.storage,
            config: &f.config,
            cardinality: &multi,
        };

        let set = |vals: &[u8]| vals.iter().copied().collect::<BTreeSet<u8>>();
        let part = |k: &str, vals: &[u8]| {
            let mut m = MemMap::sorted();
            m.insert(k.to_string(), set(vals));
            PartialMap::<String, Multi<u8>>::new(m)
        };

        let mut partial = part("a", &[1]);
        partial.externalize(true, &ctx).unwrap();
        partial.merge(vec![part("a", &[2, 3])], &ctx).unwrap();
        partial.compact(&ctx).unwrap();
        partial.cleanup().unwrap();

        assert_eq!(
            partial.get(&"a".to_string(), &multi).unwrap(),
            Some(set(&[1, 2, 3]))
        );
    }
}
