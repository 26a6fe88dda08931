//! Error taxonomy for storage operations
//!
//! Callers branch on these variants: not-found and already-exists are
//! deterministic and safe to retry with corrected input; `Interrupted` and
//! `Serialization` are transient and should be retried unchanged. Negative
//! refcounts and similar consistency violations panic instead of returning,
//! they indicate a bug rather than a recoverable condition.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such user: {0}")]
    UserNotFound(String),

    #[error("user already exists: {0}")]
    UserAlreadyExists(String),

    #[error("no such mailbox: {0}")]
    MailboxNotFound(String),

    #[error("mailbox already exists: {0}")]
    MailboxAlreadyExists(String),

    #[error("INBOX cannot be deleted")]
    InboxProtected,

    /// A delivery target vanished between recipient resolution and commit.
    /// The whole delivery should be retried.
    #[error("delivery target disappeared, retry the delivery")]
    Interrupted,

    /// Transaction conflict detected by the engine. Retry the operation.
    #[error("transaction conflict, retry the operation")]
    Serialization,

    #[error("message size {size} exceeds limit {limit}")]
    SizeLimitExceeded { size: u64, limit: u64 },

    #[error("database schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("invalid message set: {0}")]
    BadNumSet(String),

    #[error("malformed message: {0}")]
    BadMessage(String),

    #[error("{op}: {source}")]
    Sql {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("migration failed: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wrap a driver error with the failing operation's name. Lock
    /// contention surfaces as the retryable serialization class instead.
    pub(crate) fn sql(op: &'static str, source: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, _) = &source {
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return Error::Serialization;
            }
        }
        Error::Sql { op, source }
    }

    /// Whether the caller should retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Interrupted | Error::Serialization)
    }
}

/// Extension for wrapping per-statement errors with the operation name.
pub(crate) trait SqlCtx<T> {
    fn ctx(self, op: &'static str) -> Result<T>;
}

impl<T> SqlCtx<T> for std::result::Result<T, rusqlite::Error> {
    fn ctx(self, op: &'static str) -> Result<T> {
        self.map_err(|e| Error::sql(op, e))
    }
}

/// True when the driver error is a unique/primary-key constraint violation.
pub(crate) fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_serialization() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(Error::sql("op", busy), Error::Serialization));
    }

    #[test]
    fn test_other_errors_keep_operation_name() {
        let e = Error::sql("create_user", rusqlite::Error::InvalidQuery);
        assert!(e.to_string().starts_with("create_user:"));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Serialization.is_retryable());
        assert!(Error::Interrupted.is_retryable());
        assert!(!Error::UserNotFound("a".into()).is_retryable());
    }
}
