use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Store errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The requested revision is at or below the compacted revision and its
    /// history is no longer available.
    Compacted,
    /// The requested revision is larger than the current revision.
    FutureRev,
    /// A scheduled job or watcher was canceled before it could run.
    Canceled,
    /// The operation was attempted on a closed store.
    Closed,
    /// No revision was recorded for the key at the requested revision.
    NotFound,
    /// Invalid data, typically decoding errors, corruption, or unexpected
    /// internal values.
    InvalidData(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Compacted => write!(f, "required revision has been compacted"),
            Error::FutureRev => write!(f, "required revision is a future revision"),
            Error::Canceled => write!(f, "canceled"),
            Error::Closed => write!(f, "store is closed"),
            Error::NotFound => write!(f, "revision not found"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// A store Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

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
