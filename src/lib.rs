// Split-Replicate-Merge batch engine

use rayon::ThreadPool;

use crate::distributed::Exchange;
use crate::error::Result;
use crate::scheduler::Split;

// Core traits

/// Lazy, forward-only sequence of splits over an input
pub type Splits<'a> = Box<dyn Iterator<Item = Split> + Send + 'a>;

/// An input that can be cut into independent units of work.
pub trait Splittable: Send + Sync {
    fn splits(&self) -> Result<Splits<'_>>;
}

/// An accumulation target that threads fill in isolation and that is merged
/// afterwards.
pub trait Mergeable: Send + Sync + Sized {
    /// Fresh empty instance with the same shape and policies
    fn replicate(&self) -> Self;

    /// Fold `partials` into `self`.
    ///
    /// `None` marks the final round: finish spilled state and, when running
    /// with several ranks, redistribute data across them.
    fn merge(&mut self, partials: Option<Vec<Self>>, ctx: &MergeContext<'_>) -> Result<()>;
}

/// What a merge may use besides its own data
#[derive(Clone, Copy)]
pub struct MergeContext<'a> {
    pub pool: &'a ThreadPool,
    pub rank: usize,
    pub num_workers: usize,
    pub exchange: Option<&'a dyn Exchange>,
}

impl<'a> MergeContext<'a> {
    /// Single-process context
    pub fn local(pool: &'a ThreadPool) -> Self {
        Self {
            pool,
            rank: 0,
            num_workers: 1,
            exchange: None,
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.num_workers > 1 && self.exchange.is_some()
    }
}

// Implementations
pub mod builtin;
pub mod collections;
pub mod config;
pub mod diskio;
pub mod distributed;
pub mod error;
pub mod input;
pub mod memory;
pub mod scheduler;
pub mod store;

// Export the main types
pub use collections::{
    ExternalSortedMap, MergeableMap, MergeableMultimap, MergeableSortedMap, MergeableSortedMultimap,
    PartitionedMap,
};
pub use config::Config;
pub use distributed::{Distributor, Worker};
pub use error::{Error, Result as SrmResult};
pub use input::VecInput;
pub use scheduler::{Arg, JobBinding, JobRegistry, Scheduler, ThreadArgs};
