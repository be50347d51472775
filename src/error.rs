//! Error types for the persistent log.
//!
//! Mirrors the handwritten `VfsError` pattern used elsewhere in this
//! workspace: a flat enum, a manual `Display` impl, and a `From<io::Error>`
//! so fallible filesystem/mmap calls compose with `?`.

use std::io;

/// Everything that can go wrong while reading or mutating durable state.
#[derive(Debug)]
pub enum PersistenceError {
    /// A filesystem or memory-mapping operation failed.
    IoError(io::Error),
    /// A record's encoded size (metadata + payload) exceeds `max_record_size`.
    EntryTooLarge { encoded_size: u64, max_record_size: u64 },
    /// `append` was called with an empty entry list.
    EmptyEntrySet,
    /// Cancellation was observed at a suspension point before the operation completed.
    Cancelled,
    /// The log, or the partition backing a previously-read entry, has been closed.
    Disposed,
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceError::IoError(e) => write!(f, "I/O error: {}", e),
            PersistenceError::EntryTooLarge { encoded_size, max_record_size } => write!(
                f,
                "entry encodes to {} bytes, exceeding max_record_size of {}",
                encoded_size, max_record_size
            ),
            PersistenceError::EmptyEntrySet => write!(f, "append called with an empty entry list"),
            PersistenceError::Cancelled => write!(f, "operation cancelled"),
            PersistenceError::Disposed => write!(f, "log or partition has been closed"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<io::Error> for PersistenceError {
    fn from(e: io::Error) -> Self {
        PersistenceError::IoError(e)
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
