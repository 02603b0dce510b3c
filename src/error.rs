use std::fmt::Display;

/// Strata errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A chunk could not be buffered because it exceeds the memtable byte
    /// budget on its own.
    AddChunkFailed,
    /// Invalid data, typically decoding errors, corruption, or unexpected
    /// internal values.
    InvalidData(String),
    /// An IO error.
    IO(String),
    /// One or more chunks named by the manifest could not be read back.
    Fetch(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::AddChunkFailed => write!(f, "failed to add chunk"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Fetch(msg) => write!(f, "fetch failed: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// A Strata Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
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
