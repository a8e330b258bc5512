use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// EmberDB column-store errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A mutation was attempted against a container in the wrong state,
    /// typically storing a buffer while other readers still hold it.
    InvalidState(String),
    /// Contradictory user input, e.g. requesting a compressed and a
    /// decompressed view in the same call.
    BadArgument(String),
    /// The memory broker denied a grant. The operation aborted and the
    /// entry keeps its prior form; callers may retry with the compressed
    /// representation.
    LowMemory(String),
    /// The payload disagrees with the tracked compression state beyond
    /// recovery, or an encoded stats row failed to parse.
    CorruptValue(String),
    /// The entry was destroyed while a disk recall was in flight.
    EntryDestroyed,
    /// The owning region was destroyed while a disk recall was in flight.
    RegionDestroyed,
    /// The overflow store could not produce a stored payload (missing
    /// record, torn write, checksum mismatch).
    DiskAccess(String),
    /// An IO error.
    IO(String),
}

impl Error {
    /// True for the failure kinds a reader recovers from locally by
    /// treating the entry as absent. Compaction, bucket migration, and
    /// background consumers must never see these as fatals.
    pub fn is_entry_absent(&self) -> bool {
        matches!(
            self,
            Error::EntryDestroyed | Error::RegionDestroyed | Error::DiskAccess(_)
        )
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Error::BadArgument(msg) => write!(f, "bad argument: {msg}"),
            Error::LowMemory(msg) => write!(f, "low memory: {msg}"),
            Error::CorruptValue(msg) => write!(f, "corrupt value: {msg}"),
            Error::EntryDestroyed => write!(f, "entry destroyed"),
            Error::RegionDestroyed => write!(f, "region destroyed"),
            Error::DiskAccess(msg) => write!(f, "disk access: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::CorruptValue for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::CorruptValue(format!($($args)*)) };
}

/// Constructs an Error::InvalidState for the given format string.
#[macro_export]
macro_rules! errstate {
    ($($args:tt)*) => { $crate::error::Error::InvalidState(format!($($args)*)) };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
