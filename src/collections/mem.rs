use std::collections::{BTreeMap, HashMap, btree_map, hash_map};
use std::hash::Hash;

/// In-memory delegate of a partition: hash ordered or key ordered.
#[derive(Debug, Clone)]
pub enum MemMap<K, V> {
    Hash(HashMap<K, V>),
    Sorted(BTreeMap<K, V>),
}

impl<K: Ord + Hash, V: PartialEq> PartialEq for MemMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MemMap::Hash(a), MemMap::Hash(b)) => a == b,
            (MemMap::Sorted(a), MemMap::Sorted(b)) => a == b,
            _ => false,
        }
    }
}

impl<K: Ord + Hash, V> MemMap<K, V> {
    pub fn hashed() -> Self {
        MemMap::Hash(HashMap::new())
    }

    pub fn sorted() -> Self {
        MemMap::Sorted(BTreeMap::new())
    }

    /// Empty map of the same flavour
    pub fn empty_like(&self) -> Self {
        match self {
            MemMap::Hash(_) => Self::hashed(),
            MemMap::Sorted(_) => Self::sorted(),
        }
    }

    pub fn is_sorted(&self) -> bool {
        matches!(self, MemMap::Sorted(_))
    }

    pub fn len(&self) -> usize {
        match self {
            MemMap::Hash(m) => m.len(),
            MemMap::Sorted(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        match self {
            MemMap::Hash(m) => m.get(key),
            MemMap::Sorted(m) => m.get(key),
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        match self {
            MemMap::Hash(m) => m.insert(key, value),
            MemMap::Sorted(m) => m.insert(key, value),
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        match self {
            MemMap::Hash(m) => m.remove(key),
            MemMap::Sorted(m) => m.remove(key),
        }
    }

    /// Insert `value`, or fold it into the existing value with `combine`
    pub fn upsert<F>(&mut self, key: K, value: V, combine: F)
    where
        F: FnOnce(&mut V, V),
    {
        match self {
            MemMap::Hash(m) => match m.entry(key) {
                hash_map::Entry::Occupied(mut e) => combine(e.get_mut(), value),
                hash_map::Entry::Vacant(e) => {
                    e.insert(value);
                }
            },
            MemMap::Sorted(m) => match m.entry(key) {
                btree_map::Entry::Occupied(mut e) => combine(e.get_mut(), value),
                btree_map::Entry::Vacant(e) => {
                    e.insert(value);
                }
            },
        }
    }

    /// Mutable slot for `key`, inserting `default()` when absent
    pub fn get_or_insert_with<F: FnOnce() -> V>(&mut self, key: K, default: F) -> &mut V {
        match self {
            MemMap::Hash(m) => m.entry(key).or_insert_with(default),
            MemMap::Sorted(m) => m.entry(key).or_insert_with(default),
        }
    }

    pub fn clear(&mut self) {
        match self {
            MemMap::Hash(m) => m.clear(),
            MemMap::Sorted(m) => m.clear(),
        }
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        match self {
            MemMap::Hash(m) => Iter::Hash(m.iter()),
            MemMap::Sorted(m) => Iter::Sorted(m.iter()),
        }
    }

    /// Entries ordered by key; hash maps are sorted on the way out.
    pub fn into_sorted_vec(self) -> Vec<(K, V)> {
        match self {
            MemMap::Sorted(m) => m.into_iter().collect(),
            MemMap::Hash(m) => {
                let mut entries: Vec<(K, V)> = m.into_iter().collect();
                entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
                entries
            }
        }
    }
}

impl<K, V> IntoIterator for MemMap<K, V> {
    type Item = (K, V);
    type IntoIter = IntoIter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        match self {
            MemMap::Hash(m) => IntoIter::Hash(m.into_iter()),
            MemMap::Sorted(m) => IntoIter::Sorted(m.into_iter()),
        }
    }
}

pub enum Iter<'a, K, V> {
    Hash(hash_map::Iter<'a, K, V>),
    Sorted(btree_map::Iter<'a, K, V>),
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Iter::Hash(it) => it.next(),
            Iter::Sorted(it) => it.next(),
        }
    }
}

pub enum IntoIter<K, V> {
    Hash(hash_map::IntoIter<K, V>),
    Sorted(btree_map::IntoIter<K, V>),
}

impl<K, V> Iterator for IntoIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            IntoIter::Hash(it) => it.next(),
            IntoIter::Sorted(it) => it.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_combines() {
        for mut map in [MemMap::hashed(), MemMap::sorted()] {
            map.upsert("a", 1, |acc, v| *acc += v);
            map.upsert("a", 2, |acc, v| *acc += v);
            map.upsert("b", 5, |acc, v| *acc += v);
            assert_eq!(map.get(&"a"), Some(&3));
            assert_eq!(map.get(&"b"), Some(&5));
            assert_eq!(map.len(), 2);
        }
    }

    #[test]
    fn test_into_sorted_vec() {
        let mut map = MemMap::hashed();
        for k in [5, 1, 9, 3] {
            map.insert(k, k * 10);
        }
        assert_eq!(
            map.into_sorted_vec(),
            vec![(1, 10), (3, 30), (5, 50), (9, 90)]
        );
    }

    #[test]
    fn test_empty_like_keeps_flavour() {
        let mut sorted = MemMap::<i32, i32>::sorted();
        sorted.insert(1, 1);
        assert!(sorted.empty_like().is_sorted());
        assert!(sorted.empty_like().is_empty());
        assert!(!MemMap::<i32, i32>::hashed().empty_like().is_sorted());
    }
}
