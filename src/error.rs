use std::io;

use thiserror::Error;

/// Errors raised by the engine.
///
/// Usage errors (unknown operation, arity, ordering violations) are returned
/// synchronously to the caller. Failures on remote links are logged by the
/// distributed layer and only surface here when they affect the local job.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("no operation registered under the name {0:?}")]
    UnknownOperation(String),

    #[error("operation {name:?} expects {expected} parameters but {given} given")]
    Arity {
        name: String,
        expected: usize,
        given: usize,
    },

    #[error("First parameter cannot be shared")]
    SharedFirstParameter,

    #[error("No arguments given")]
    NoArguments,

    #[error("key must be greater than last key {last}")]
    OutOfOrder { last: String },

    #[error("map file {0} is opened in read only mode")]
    ReadOnly(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid size value {0:?}")]
    InvalidSize(String),

    #[error("split is not a {0}")]
    SplitType(&'static str),

    #[error("argument {index} is not a {expected}")]
    ArgumentType {
        index: usize,
        expected: &'static str,
    },

    #[error("expected {expected} partitions, found {found}")]
    PartitionMismatch { expected: usize, found: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("worker {rank}: {message}")]
    Worker { rank: usize, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn out_of_order<K: std::fmt::Debug>(last: &K) -> Self {
        Error::OutOfOrder {
            last: format!("{:?}", last),
        }
    }
}
