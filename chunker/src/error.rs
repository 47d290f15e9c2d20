use std::{fmt, io};

use thiserror::Error;

/// Failure raised anywhere while validating, reading, hashing or dispatching file chunks.
///
/// Every failure site builds one of these variants directly, so callers can always match on [`Error::kind()`]
/// instead of inspecting messages.
#[derive(Debug, Error)]
pub enum Error {
    /// The input is not a usable file or it has been vetoed by validation.
    #[error("invalid file `{file}`: {message}")]
    InvalidFile { file: String, message: String },

    /// The byte range of a chunk cannot be read.
    #[error("failed to read chunk #{chunk_index} of `{file}`")]
    FileRead {
        file: String,
        chunk_index: u64,
        #[source]
        source: io::Error,
    },

    /// The digest of a chunk cannot be computed.
    #[error("failed to hash chunk: {message}")]
    Hash {
        file: Option<String>,
        chunk_index: Option<u64>,
        message: String,
    },

    /// An execution unit failed while running a task.
    #[error("worker failed: {message}")]
    Worker {
        file: Option<String>,
        chunk_index: Option<u64>,
        message: String,
    },

    /// An execution unit cannot be started at all.
    #[error("failed to start worker: {message}")]
    WorkerLoad { message: String },

    /// Processing has been cooperatively cancelled.
    #[error("processing cancelled")]
    Cancelled,
}

/// Kind of an [`Error`], mostly useful to report failures in a flat way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidFile,
    FileRead,
    Hash,
    Worker,
    WorkerLoad,
    Cancelled,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidFile => "invalid-file",
            ErrorKind::FileRead => "file-read-error",
            ErrorKind::Hash => "hash-error",
            ErrorKind::Worker => "worker-error",
            ErrorKind::WorkerLoad => "worker-load-error",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub(crate) fn invalid_file(file: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidFile {
            file: file.into(),
            message: message.into(),
        }
    }

    pub(crate) fn worker(message: impl Into<String>) -> Self {
        Error::Worker {
            file: None,
            chunk_index: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidFile { .. } => ErrorKind::InvalidFile,
            Error::FileRead { .. } => ErrorKind::FileRead,
            Error::Hash { .. } => ErrorKind::Hash,
            Error::Worker { .. } => ErrorKind::Worker,
            Error::WorkerLoad { .. } => ErrorKind::WorkerLoad,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Name of the file the failure relates to, if known.
    pub fn file(&self) -> Option<&str> {
        match self {
            Error::InvalidFile { file, .. } | Error::FileRead { file, .. } => Some(file),
            Error::Hash { file, .. } | Error::Worker { file, .. } => file.as_deref(),
            Error::WorkerLoad { .. } | Error::Cancelled => None,
        }
    }

    /// Index of the chunk the failure relates to, if known.
    ///
    /// For worker failures, this is the first chunk index of the failing range.
    pub fn chunk_index(&self) -> Option<u64> {
        match self {
            Error::FileRead { chunk_index, .. } => Some(*chunk_index),
            Error::Hash { chunk_index, .. } | Error::Worker { chunk_index, .. } => *chunk_index,
            _ => None,
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Invalid files and cancellations are never retried, neither are workers that could not be started.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::FileRead { .. } | Error::Hash { .. } | Error::Worker { .. })
    }

    /// Attach file context to a failure coming back from an execution unit.
    ///
    /// Missing context is filled in while existing context is kept as is.
    pub(crate) fn in_range(self, name: &str, start_index: u64) -> Self {
        match self {
            Error::Worker {
                file,
                chunk_index,
                message,
            } => Error::Worker {
                file: file.or_else(|| Some(name.to_owned())),
                chunk_index: chunk_index.or(Some(start_index)),
                message,
            },
            Error::Hash {
                file,
                chunk_index,
                message,
            } => Error::Hash {
                file: file.or_else(|| Some(name.to_owned())),
                chunk_index: chunk_index.or(Some(start_index)),
                message,
            },
            err => err,
        }
    }
}
