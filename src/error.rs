use thiserror::Error;

/// Every failure a workflow operation can surface. Each kind has a stable
/// machine-readable code; raw storage error text never reaches callers.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    /// Optimistic-concurrency mismatch. Carries the current record state so
    /// the losing caller can merge and retry.
    #[error("data version conflict")]
    Conflict { current: serde_json::Value },

    #[error("already signed for this type and period")]
    AlreadySigned,

    #[error("semester 1 is not completed")]
    NotCompletedSem1,

    #[error("semester 2 is not completed")]
    NotCompletedSem2,

    #[error("actor is not authorized to act on this assignment")]
    NotAuthorized,

    #[error("no end-of-year signature by this actor for the current period")]
    NotSignedByYou,

    #[error("student already promoted for this school year")]
    AlreadyPromoted,

    #[error("current school year could not be determined")]
    CurrentYearUnknown,

    #[error("no next school year is configured")]
    NoNextYear,

    /// Internal marker: the storage backend cannot run multi-record
    /// transactions. Triggers the compensating fallback path, never surfaced.
    #[error("storage backend does not support transactions")]
    TransactionUnsupported,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::InvalidArgument(_) => "invalid_argument",
            WorkflowError::NotFound(_) => "not_found",
            WorkflowError::Conflict { .. } => "conflict",
            WorkflowError::AlreadySigned => "already_signed",
            WorkflowError::NotCompletedSem1 => "not_completed_sem1",
            WorkflowError::NotCompletedSem2 => "not_completed_sem2",
            WorkflowError::NotAuthorized => "not_authorized",
            WorkflowError::NotSignedByYou => "not_signed_by_you",
            WorkflowError::AlreadyPromoted => "already_promoted",
            WorkflowError::CurrentYearUnknown => "current_year_unknown",
            WorkflowError::NoNextYear => "no_next_year",
            WorkflowError::TransactionUnsupported | WorkflowError::Storage(_) => "fatal",
        }
    }

    /// Caller-facing message. Storage details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            WorkflowError::TransactionUnsupported | WorkflowError::Storage(_) => {
                "unexpected storage error".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            WorkflowError::Conflict { current } => {
                Some(serde_json::json!({ "current": current }))
            }
            _ => None,
        }
    }
}

/// True only for UNIQUE/PRIMARY KEY violations. Other constraint failures
/// (foreign keys, CHECK) are storage defects, not duplicates.
pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}
