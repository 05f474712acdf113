//! Mergeable collections and the storage they spill to.

use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub mod adders;
pub mod external;
pub mod iterators;
pub mod mem;
pub mod merge;
pub mod partial;
pub mod partitioned;
pub mod policy;

pub use adders::{Adder, Concat, Max, Min, Sum};
pub use external::{Entries, ExternalMapDescriptor, ExternalSortedMap};
pub use iterators::Interleave;
pub use mem::MemMap;
pub use partial::{Component, PartialMap};
pub use partitioned::{MapSplit, PartitionedMap};
pub use policy::{Cardinality, Hashed, KeyOrder, Multi, Single, Sorted};

/// Bounds every collection key satisfies
pub trait Key: Ord + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Key for T where T: Ord + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Bounds every stored value satisfies
pub trait Value: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

pub type MergeableMap<K, V> = PartitionedMap<K, Single<V>, Hashed>;
pub type MergeableSortedMap<K, V> = PartitionedMap<K, Single<V>, Sorted>;
pub type MergeableMultimap<K, V> = PartitionedMap<K, Multi<V>, Hashed>;
pub type MergeableSortedMultimap<K, V> = PartitionedMap<K, Multi<V>, Sorted>;
