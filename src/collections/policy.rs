//! Strategies a partitioned collection is composed from.
//!
//! [`KeyOrder`] picks the in-memory delegate and the iteration order, and
//! [`Cardinality`] decides what is stored per key and how two stored values for
//! the same key are merged.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::collections::Value;
use crate::collections::adders::Adder;
use crate::collections::mem::MemMap;

pub trait KeyOrder: Send + Sync + 'static {
    /// Iteration over the whole collection yields keys in ascending order
    const SORTED: bool;

    fn new_map<K: Ord + Hash, V>() -> MemMap<K, V> {
        if Self::SORTED {
            MemMap::sorted()
        } else {
            MemMap::hashed()
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Hashed;

impl KeyOrder for Hashed {
    const SORTED: bool = false;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sorted;

impl KeyOrder for Sorted {
    const SORTED: bool = true;
}

pub trait Cardinality: Clone + Send + Sync + 'static {
    /// What one key maps to in memory and on disk
    type Stored: Value;

    fn combine(&self, acc: &mut Self::Stored, other: Self::Stored);
}

/// One value per key. Without an adder a merged value replaces the old one.
pub struct Single<V> {
    adder: Option<Arc<dyn Adder<V>>>,
}

impl<V> Single<V> {
    pub fn new() -> Self {
        Self { adder: None }
    }

    pub fn with_adder<A: Adder<V> + 'static>(adder: A) -> Self {
        Self {
            adder: Some(Arc::new(adder)),
        }
    }

    pub fn has_adder(&self) -> bool {
        self.adder.is_some()
    }
}

impl<V> Default for Single<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for Single<V> {
    fn clone(&self) -> Self {
        Self {
            adder: self.adder.clone(),
        }
    }
}

impl<V> fmt::Debug for Single<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Single")
            .field("adder", &self.adder.is_some())
            .finish()
    }
}

impl<V: Value> Cardinality for Single<V> {
    type Stored = V;

    fn combine(&self, acc: &mut V, other: V) {
        match &self.adder {
            Some(adder) => adder.add(acc, other),
            None => *acc = other,
        }
    }
}

/// Any number of distinct values per key; merging unions the value sets.
pub struct Multi<V>(PhantomData<fn() -> V>);

impl<V> Multi<V> {
    pub fn new() -> Self {
        Multi(PhantomData)
    }
}

impl<V> Default for Multi<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for Multi<V> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for Multi<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Multi")
    }
}

impl<V: Value + Ord> Cardinality for Multi<V> {
    type Stored = BTreeSet<V>;

    fn combine(&self, acc: &mut BTreeSet<V>, mut other: BTreeSet<V>) {
        if acc.len() < other.len() {
            std::mem::swap(acc, &mut other);
        }
        acc.append(&mut other);
    }
}
