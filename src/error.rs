use std::io;

/// String like type that occupies the same space as one usize
type TinyStr = Box<String>;

#[allow(missing_docs)]
#[derive(Debug, Display, Error)]
#[display("{:?}", self)]
#[non_exhaustive]
pub enum Error {
    /// The comparator could not order a key (e.g. NaN under a numeric order).
    UnorderableKey,
    /// `diff` across trees that do not share a comparator.
    ComparatorMismatch,
    /// Mutating call on a frozen tree.
    Frozen,
    /// Operation requires a blob store but none is attached.
    NoStore,
    BlobNotFound(#[error(not(source))] TinyStr),
    CorruptNode(#[error(not(source))] TinyStr),
    Validation(#[error(not(source))] TinyStr),
    Io(io::Error),
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(Box::new(msg.into()))
    }

    pub(crate) fn blob_not_found(id: impl Into<String>) -> Self {
        Self::BlobNotFound(Box::new(id.into()))
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::Io(i) => i.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::CorruptNode(Box::new(value.to_string()))
    }
}

macro_rules! error_validation {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Validation(msg.into())
    }}
}

macro_rules! error_corrupt {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::CorruptNode(msg.into())
    }}
}

pub(crate) use error_corrupt;
pub(crate) use error_validation;
