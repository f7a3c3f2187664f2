use crate::block::BlockError;
use thiserror::Error;

pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("no user frame is free and none can be evicted")]
    NoEvictableFrame,
    #[error("swap space is full")]
    SwapFull,
    #[error("no swap device is configured")]
    NoSwap,
    #[error("swap device error: {0}")]
    Block(#[from] BlockError),
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("short write: expected {expected} bytes, wrote {actual}")]
    ShortWrite { expected: usize, actual: usize },
    #[error("could not install mapping for {0:#x}")]
    InstallFailed(usize),
    #[error("page {0:#x} already has an entry")]
    AlreadyMapped(usize),
    #[error("invalid user address {0:#x}")]
    InvalidAddress(usize),
    #[error("cannot map an empty file")]
    EmptyFile,
    #[error("no mapping with id {0}")]
    UnknownMapping(usize),
}
