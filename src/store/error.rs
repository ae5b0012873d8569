//! Record store errors.

use std::fmt;

use thiserror::Error;

/// What kind of database failure a [`StoreError::Database`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDbErrorKind {
    /// Another connection holds the lock, or no pooled connection freed up in time.
    Contention,
    /// A write broke a table constraint, e.g. a second active download for an item.
    Constraint,
    /// Anything else.
    Other,
}

impl StoreDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::Contention,
            sqlx::Error::Database(db) => {
                let code = db.code();
                if matches!(code.as_deref(), Some("5" | "6" | "SQLITE_BUSY" | "SQLITE_LOCKED")) {
                    Self::Contention
                } else if code.as_deref() == Some("2067")
                    || db.is_unique_violation()
                    || db.is_check_violation()
                    || db.is_foreign_key_violation()
                {
                    Self::Constraint
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StoreDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Contention => "contention",
            Self::Constraint => "constraint",
            Self::Other => "other",
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error ({kind}): {message}")]
    Database {
        kind: StoreDbErrorKind,
        message: String,
    },

    #[error("record not found: {0}")]
    RecordNotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: StoreDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    #[must_use]
    pub fn database_kind(&self) -> Option<StoreDbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::RecordNotFound(_) => None,
        }
    }

    /// True when the same write may succeed once other connections let go.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        self.database_kind() == Some(StoreDbErrorKind::Contention)
    }

    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        self.database_kind() == Some(StoreDbErrorKind::Constraint)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_contention() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_contention());
        assert!(!err.is_constraint_violation());
        assert!(err.to_string().contains("contention"));
    }

    #[test]
    fn test_row_not_found_is_other() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.database_kind(), Some(StoreDbErrorKind::Other));
    }

    #[test]
    fn test_record_not_found_has_no_kind() {
        let err = StoreError::RecordNotFound("download abc".to_string());
        assert!(err.to_string().contains("download abc"));
        assert_eq!(err.database_kind(), None);
    }
}
