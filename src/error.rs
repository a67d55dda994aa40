//! Error taxonomy shared by every cache operation.

use thiserror::Error;

/// Coarse classification of a [`CacheError`], used by backends to pick a
/// wire-level error code without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidQuery,
    OutOfSync,
    OutOfList,
    InvalidArgument,
    Storage,
}

#[derive(Debug, Error)]
pub enum CacheError {
    /// The uid or key does not exist, or is hidden by the visibility rules.
    #[error("object “{0}” not found")]
    NotFound(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A revision guard or locale no longer matches the store.
    #[error("out of sync: {0}")]
    OutOfSync(String),

    /// A cursor was asked to step past a sentinel it already sits on.
    #[error("end of list: {0}")]
    OutOfList(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::NotFound(_) => ErrorKind::NotFound,
            CacheError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            CacheError::OutOfSync(_) => ErrorKind::OutOfSync,
            CacheError::OutOfList(_) => ErrorKind::OutOfList,
            CacheError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CacheError::Storage(_) | CacheError::Io(_) => ErrorKind::Storage,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_kind() {
        let err = CacheError::NotFound("custom-1".into());
        assert_eq!(err.to_string(), "object “custom-1” not found");
        assert!(err.is_not_found());

        let err = CacheError::InvalidQuery("unexpected token".into());
        assert_eq!(err.kind(), ErrorKind::InvalidQuery);

        let err: CacheError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
