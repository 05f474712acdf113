//! Master/worker coordination over TCP.

pub mod distributor;
pub mod exchange;
pub mod protocol;
pub mod worker;

pub use distributor::Distributor;
pub use exchange::{Exchange, MemoryExchange};
pub use protocol::{
    ArgKind, Connection, DEFAULT_PORT, Message, Registration, RunReport, WireArg, WorkRequest,
};
pub use worker::{Worker, WorkerLink};
