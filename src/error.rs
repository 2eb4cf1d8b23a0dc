use thiserror::Error;

use crate::address::Address;

/// Errors the collector surfaces to the embedding runtime.
///
/// Everything else (buffer exhaustion, purpose exhaustion, evacuation failure) is
/// resolved inside the collector. Broken invariants never become a `GcError`: they
/// abort through [`guarantee!`](crate::guarantee).
#[derive(Error, Debug)]
pub enum GcError {
    #[error("out of memory: failed to allocate {requested} bytes after collection and expansion")]
    OutOfMemory { requested: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to reserve {size} bytes of address space")]
    ReserveFailed { size: usize },
    #[error("failed to commit {size} bytes at {addr:?}")]
    CommitFailed { addr: Address, size: usize },
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("failed to start the {name} thread: {source}")]
    ThreadStart {
        name: &'static str,
        source: std::io::Error,
    },
}

pub type GcResult<T> = Result<T, GcError>;
