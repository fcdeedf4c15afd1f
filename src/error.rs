//! Error taxonomy shared by the lease manager, lock, registry and discovery.

use thiserror::Error;

use crate::storage::{LeaseId, StorageError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The store is unreachable, a request timed out or a watch stream closed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The lease is nil, expired or unknown to the store.
    #[error("Lease {0:x} is not valid")]
    LeaseInvalid(LeaseId),

    /// The lock is held by another session.
    #[error("Lock {0} is held by another session")]
    Contended(String),

    #[error("Not held: {0}")]
    NotHeld(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

/// Coarse classification of [`Error`], convenient for matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    LeaseInvalid,
    Contended,
    NotHeld,
    NotFound,
    Cancelled,
    InvalidArgument,
    Storage,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            Error::LeaseInvalid(_) => ErrorKind::LeaseInvalid,
            Error::Contended(_) => ErrorKind::Contended,
            Error::NotHeld(_) => ErrorKind::NotHeld,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => Error::Connection(msg),
            StorageError::LeaseNotFound(id) => Error::LeaseInvalid(id),
            StorageError::InvalidArgument(msg) => Error::InvalidArgument(msg),
            other => Error::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        let err: Error = StorageError::Unavailable("down".into()).into();
        assert_eq!(err.kind(), ErrorKind::Connection);

        let err: Error = StorageError::LeaseNotFound(0x2a).into();
        assert_eq!(err, Error::LeaseInvalid(0x2a));
        assert_eq!(err.to_string(), "Lease 2a is not valid");

        let err: Error = StorageError::Compacted {
            requested: 1,
            compacted: 5,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
