//! Typed errors for the handful of `ram` operations that return `Result`
//! instead of a sentinel. The raw `map`/`unmap`/`page_size_for_fd` surface
//! keeps the source's pointer-sentinel contract verbatim (see SPEC_FULL.md
//! §4.1); this type exists only for [`crate::ram::GuestRam`].

use std::fmt;
use std::io;

/// Failure to establish a [`crate::ram::GuestRam`] mapping.
#[derive(Debug)]
pub enum MapError {
    /// The underlying `map` call returned the `FAILED` sentinel.
    Mmap(io::Error),
    /// `size` was zero, or `align` was not a power of two, or was smaller
    /// than the fd's page size. Caller error, reported instead of asserted
    /// because `GuestRam::new` is a safe entry point reachable with
    /// arbitrary arguments.
    InvalidArgument(&'static str),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Mmap(e) => write!(f, "guest RAM mapping failed: {}", e),
            MapError::InvalidArgument(msg) => write!(f, "invalid guest RAM mapping request: {}", msg),
        }
    }
}

impl std::error::Error for MapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MapError::Mmap(e) => Some(e),
            MapError::InvalidArgument(_) => None,
        }
    }
}
