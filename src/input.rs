use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::Split;
use crate::{Splits, Splittable};

/// In-memory input cut into fixed-size chunks; each split is a `Vec<T>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VecInput<T> {
    items: Vec<T>,
    chunk_size: usize,
}

impl<T> VecInput<T> {
    pub fn new(items: Vec<T>, chunk_size: usize) -> Self {
        Self {
            items,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn num_splits(&self) -> usize {
        self.items.len().div_ceil(self.chunk_size)
    }
}

impl<T: Clone + Send + Sync + 'static> Splittable for VecInput<T> {
    fn splits(&self) -> Result<Splits<'_>> {
        Ok(Box::new(
            self.items
                .chunks(self.chunk_size)
                .map(|chunk| Split::new(chunk.to_vec())),
        ))
    }
}
