use thiserror::Error;

use crate::model::FailureKind;

/// Failures raised by the durable key-value layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt record at {key}: {reason}")]
    Decode { key: String, reason: String },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Failures surfaced by the diary repository and the sync engine.
///
/// `Transient` and `Storage` are the retriable classes; everything else
/// parks the owning task as failed until the caller intervenes.
#[derive(Debug, Error)]
pub enum DiaryError {
    #[error("entry not found: {0}")]
    NotFound(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DiaryError {
    pub fn is_retriable(&self) -> bool {
        self.failure_kind().is_none()
    }

    /// Terminal failure class for a replayed task, or `None` when the
    /// error should be retried with backoff instead.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            // A record that vanished server-side is a conflict with local
            // intent, not a retriable outage.
            DiaryError::Conflict(_) | DiaryError::NotFound(_) => Some(FailureKind::Conflict),
            DiaryError::Validation(_) => Some(FailureKind::Validation),
            DiaryError::Transient(_) | DiaryError::Storage(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classes() {
        assert!(DiaryError::Transient("503".into()).is_retriable());
        assert!(DiaryError::Storage(StorageError::Unavailable("down".into())).is_retriable());
        assert!(!DiaryError::Conflict("revision moved".into()).is_retriable());
        assert!(!DiaryError::Validation("bad field".into()).is_retriable());
        assert!(!DiaryError::NotFound("e1".into()).is_retriable());
    }

    #[test]
    fn failure_kinds() {
        assert_eq!(
            DiaryError::Conflict("x".into()).failure_kind(),
            Some(FailureKind::Conflict)
        );
        assert_eq!(
            DiaryError::NotFound("x".into()).failure_kind(),
            Some(FailureKind::Conflict)
        );
        assert_eq!(
            DiaryError::Validation("x".into()).failure_kind(),
            Some(FailureKind::Validation)
        );
        assert_eq!(DiaryError::Transient("x".into()).failure_kind(), None);
    }
}
