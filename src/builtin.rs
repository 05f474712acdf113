//! Stock operations shared by the demo driver and the worker binary.
//!
//! Master and workers must agree on names, so both call [`register_builtins`].

use std::sync::Arc;

use crate::collections::{MapSplit, MergeableMap, MergeableSortedMultimap, Sum};
use crate::config::Config;
use crate::error::Result;
use crate::input::VecInput;
use crate::scheduler::{JobRegistry, Split, ThreadArgs};

/// Counts every number of a `VecInput<u64>` into a summing map
pub const ADD_ONE: &str = "add_one";
/// Adds every entry of a map split into another summing map
pub const COPY: &str = "copy";
/// Maps each word of at least `min_len` characters to the lines it occurs on
pub const INDEX_WORDS: &str = "index_words";

pub const NUMBERS: &str = "srm.VecInput<u64>";
pub const LINES: &str = "srm.VecInput<(u64,String)>";
pub const COUNTS: &str = "srm.MergeableMap<u64,u64>+Sum";
pub const WORD_INDEX: &str = "srm.MergeableSortedMultimap<String,u64>";
pub const MIN_LEN: &str = "usize";

pub type Counts = MergeableMap<u64, u64>;
pub type WordIndex = MergeableSortedMultimap<String, u64>;

/// Summing map as the `add_one` and `copy` jobs expect it
pub fn counts(config: &Arc<Config>) -> Counts {
    MergeableMap::with_adder(Arc::clone(config), Sum)
}

pub fn word_index(config: &Arc<Config>) -> WordIndex {
    MergeableSortedMultimap::new(Arc::clone(config))
}

fn add_one(split: Split, args: &mut ThreadArgs<'_>) -> Result<()> {
    let numbers = split.take::<Vec<u64>>()?;
    let target = args.get_mut::<Counts>(1)?;
    for n in numbers {
        target.add(n, 1)?;
    }
    Ok(())
}

fn copy(split: Split, args: &mut ThreadArgs<'_>) -> Result<()> {
    let entries = split.take::<MapSplit<u64, u64>>()?.into_entries()?;
    let target = args.get_mut::<Counts>(1)?;
    for entry in entries {
        let (key, value) = entry?;
        target.add(key, value)?;
    }
    Ok(())
}

fn index_words(split: Split, args: &mut ThreadArgs<'_>) -> Result<()> {
    let lines = split.take::<Vec<(u64, String)>>()?;
    let min_len = *args.get::<usize>(2)?;
    let target = args.get_mut::<WordIndex>(1)?;
    for (line, text) in lines {
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if word.chars().count() >= min_len.max(1) {
                target.put(word.to_lowercase(), line)?;
            }
        }
    }
    Ok(())
}

pub fn register_builtins(registry: &mut JobRegistry) -> Result<()> {
    registry
        .register_job(ADD_ONE, &[false, false], add_one)?
        .register_job(COPY, &[false, false], copy)?
        .register_job(INDEX_WORDS, &[false, false, true], index_words)?;

    registry
        .register_input::<VecInput<u64>>(NUMBERS)
        .register_input::<VecInput<(u64, String)>>(LINES)
        .register_value::<usize>(MIN_LEN)
        .register_mergeable(COUNTS, counts)
        .register_mergeable(WORD_INDEX, word_index);
    Ok(())
}
