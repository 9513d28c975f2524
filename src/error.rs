//! Error types returned at the boundary of the pool.
//!
//! Nothing here covers a `MustSucceed` allocation running out of space,
//! that case aborts the process (see [`admission`](crate::admission)).

use std::fmt;
use std::io;

use thiserror::Error;

/// The page-level operation that failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageOp {
    Reserve,
    Commit,
    AdviseFree,
    Decommit,
    Release,
}

impl fmt::Display for PageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PageOp::Reserve => "reserve",
            PageOp::Commit => "commit",
            PageOp::AdviseFree => "advise-free",
            PageOp::Decommit => "decommit",
            PageOp::Release => "release",
        };
        f.write_str(name)
    }
}

/// A commit/decommit/release syscall failed.
#[derive(Debug, Error)]
#[error("page {op} of {len} bytes at {addr:#x} failed: {source}")]
pub struct PageError {
    pub op: PageOp,
    pub addr: usize,
    pub len: usize,
    #[source]
    pub source: io::Error,
}

impl PageError {
    pub fn new(op: PageOp, addr: usize, len: usize, source: io::Error) -> Self {
        PageError { op, addr, len, source }
    }

    /// Builds an error from `errno` of the last failed libc call.
    pub fn last_os_error(op: PageOp, addr: usize, len: usize) -> Self {
        PageError::new(op, addr, len, io::Error::last_os_error())
    }

    /// Whether retrying the same call may succeed (`EAGAIN`, `EINTR`).
    pub fn is_transient(&self) -> bool {
        matches!(
            self.source.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        )
    }
}

/// The OS refused the initial reservation.
#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("refusing to reserve an empty executable pool")]
    EmptyPool,
    #[error("pool size {size} overflows the address space")]
    SizeOverflow { size: usize },
    #[error("could not reserve {size} bytes of executable memory: {source}")]
    Os {
        size: usize,
        #[source]
        source: PageError,
    },
}

/// Why an allocation produced no handle.
///
/// Every variant is recoverable: the caller is expected to fall back to a
/// non-JIT execution path.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("allocation of {requested} bytes denied: projected {projected} exceeds ceiling {ceiling}")]
    AdmissionDenied {
        requested: usize,
        projected: usize,
        ceiling: usize,
    },
    #[error("allocation of {requested} bytes failed by fuzz policy")]
    FuzzDenied { requested: usize },
    #[error("no free span of {rounded} bytes in the executable pool")]
    OutOfSpace { rounded: usize },
    #[error("allocation size {requested} is too large")]
    TooLarge { requested: usize },
    #[error("could not commit pages for allocation: {0}")]
    Commit(#[source] PageError),
    #[error("executable memory is unavailable")]
    Unavailable,
}

/// Failure to bring up the executable memory subsystem.
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    #[error("executable memory was already initialized")]
    AlreadyInitialized,
}
