//! Store actor commands and errors.

use std::time::Duration;

use bazaar_core::{SessionId, SessionRecord};
use thiserror::Error;
use tokio::sync::oneshot;

/// Commands sent to the store actor on the persistence loop.
///
/// Each request/response command carries a oneshot for the result;
/// `Sweep` is fire-and-forget from the scheduler loop.
#[derive(Debug)]
pub enum StoreCommand {
    /// Does a record exist for this id?
    Exist {
        id: SessionId,
        respond_to: oneshot::Sender<Result<bool, StoreError>>,
    },

    /// Load the record for this id, if present.
    Load {
        id: SessionId,
        respond_to: oneshot::Sender<Result<Option<SessionRecord>, StoreError>>,
    },

    /// Store a record with a fresh TTL. Last writer wins.
    Save {
        id: SessionId,
        record: SessionRecord,
        ttl: Duration,
        respond_to: oneshot::Sender<Result<(), StoreError>>,
    },

    /// Push the expiry of an existing record out by `ttl`.
    ///
    /// Responds `false` when no record exists for the id.
    UpdateLifetime {
        id: SessionId,
        ttl: Duration,
        respond_to: oneshot::Sender<Result<bool, StoreError>>,
    },

    /// Delete every record whose expiry has passed.
    Sweep,
}

/// Errors from session persistence.
///
/// All variants are recoverable from the caller's point of view: retry
/// or fail the current request, never tear anything down.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The persistence loop has shut down.
    #[error("session store is not running")]
    Closed,

    /// The embedded database rejected the operation.
    #[error("database error: {0}")]
    Database(String),

    /// A stored record could not be decoded.
    #[error("corrupt session record for {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StoreError {
    pub(crate) fn database<E: std::fmt::Display>(err: E) -> Self {
        Self::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            StoreError::Closed.to_string(),
            "session store is not running"
        );
        let err = StoreError::Corrupt {
            id: "abc".into(),
            reason: "truncated".into(),
        };
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("truncated"));
    }
}
