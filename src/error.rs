//! Crate-wide error and result types.

/// A kvlite error. Argument faults surface to callers; integrity and I/O
/// faults are logged at the public boundary and degrade to defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Invalid data, e.g. a corrupt log image or an unknown record type.
    InvalidData(String),
    /// Invalid user input, e.g. an empty key or an oversize value.
    InvalidInput(String),
    /// An input/output error.
    IO(String),
    /// A value codec failed to encode or decode.
    Serialization(String),
}

/// Constructs an Err(Error::InvalidData) via format!().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidData(format!($($args)*))) };
}

/// Constructs an Err(Error::InvalidInput) via format!().
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidInput(format!($($args)*))) };
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidData(message) => write!(f, "invalid data: {message}"),
            Error::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Error::IO(message) => write!(f, "io error: {message}"),
            Error::Serialization(message) => write!(f, "serialization failed: {message}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

/// A kvlite result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
