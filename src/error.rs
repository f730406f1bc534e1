use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors. Anything that reaches the driver ends the run with a
/// nonzero status; recoverable numeric trouble never becomes one of these.
#[derive(Debug, Error)]
pub enum Error {
    /// Incompatible or invalid options.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Malformed input file.
    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// A snapshot that does not fit the current run.
    #[error("snapshot mismatch: {what} is {found} in the snapshot but {expected} in this run")]
    SnapshotMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("cannot allocate {bytes} bytes for {what}")]
    Resource { what: &'static str, bytes: usize },

    #[error("invalid snapshot metadata in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Error::Config(message.into())
    }

    pub fn io<P: Into<PathBuf>>(path: P, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source: source,
        }
    }

    pub fn parse<P: Into<PathBuf>, S: Into<String>>(path: P, line: usize, message: S) -> Self {
        Error::Parse {
            path: path.into(),
            line: line,
            message: message.into(),
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::SnapshotMismatch { .. } => 1,
            Error::Io { .. } => 2,
            Error::Parse { .. } | Error::Json { .. } => 3,
            Error::Resource { .. } => 4,
        }
    }
}
