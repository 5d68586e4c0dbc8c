//! The error type shared by every fallible operation in this crate.

use core::fmt;

use errno::Errno;
use thiserror::Error;

/// Which of the two views of a dual mapping an operation concerned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum View {
    /// The read-write view, used to emit code.
    ReadWrite,
    /// The read-execute view, used to run code.
    ReadExecute,
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            View::ReadWrite => write!(f, "RW"),
            View::ReadExecute => write!(f, "RX"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// A null, zero-sized, overflowing or mismatched argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The anonymous shared memory object could not be created.
    #[error("failed to create backing object: {0}")]
    BackingCreationFailed(Errno),

    /// The backing object was created but could not be sized.
    #[error("failed to size backing object: {0}")]
    BackingResizeFailed(Errno),

    /// One of the two views could not be mapped.
    #[error("failed to map {view} view: {errno}")]
    MappingFailed { view: View, errno: Errno },

    /// The address is not the base of any live allocation.
    #[error("no live allocation at {0:#x}")]
    UnknownAllocation(usize),
}

pub type Result<T> = core::result::Result<T, Error>;
