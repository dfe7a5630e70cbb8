use thiserror::Error;

pub mod scheduling;
pub mod sync;

/// Error type for all primitives
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TempusError {
    #[error("an element with key {0} already occupies a heap slot")]
    DuplicateKey(u64),
    #[error("coordinator thread terminated abnormally")]
    Terminated,
}
