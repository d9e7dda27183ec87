use std::fmt::Display;

/// FSKV errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The file header failed to parse: bad magic, unsupported version, or
    /// checksum mismatch.
    CorruptHeader(String),
    /// An AEAD tag was rejected while opening the store, most likely because
    /// the wrong encryption key was supplied.
    AuthFailure,
    /// The codec identities in the opened configuration do not match the ones
    /// stamped into the file header at creation time.
    ConfigMismatch(String),
    /// An index entry or value failed to parse or verify. During scans these
    /// are logged and skipped; during reads the value is reported missing.
    CorruptEntry(String),
    /// A post-write read-back did not return the value that was written
    /// (only when update validation is enabled).
    Validation(String),
    /// The header of a freshly compacted file did not round-trip.
    CompactVerify(String),
    /// Invalid caller input, such as an oversized key or a too-short
    /// encryption key.
    InvalidInput(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CorruptHeader(msg) => write!(f, "corrupt header: {msg}"),
            Error::AuthFailure => {
                write!(f, "authentication failed, likely wrong encryption key")
            }
            Error::ConfigMismatch(msg) => write!(f, "config mismatch: {msg}"),
            Error::CorruptEntry(msg) => write!(f, "corrupt entry: {msg}"),
            Error::Validation(msg) => write!(f, "update validation failed: {msg}"),
            Error::CompactVerify(msg) => write!(f, "compaction verify failed: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// An FSKV Result returning Error.
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
