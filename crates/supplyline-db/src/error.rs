//! # Database Errors
//!
//! Two layers:
//!
//! - [`DbError`] is what a single storage call can fail with. Some of it is
//!   transient (SQLite busy/locked, pool timeouts, lost compare-and-swap) and
//!   worth retrying.
//! - [`LedgerError`] is what engine and workflow operations return: a
//!   business rule from `supplyline-core`, a storage failure, or
//!   `StorageUnavailable` once retries run out.
//!
//! ```text
//! sqlx::Error ──► DbError ──┐
//!                           ├──► LedgerError ──► caller
//! CoreError ────────────────┘         ▲
//!                                     │ RetryPolicy: transient DbError
//!                                     │ N times, then StorageUnavailable
//! ```

use supplyline_core::{CoreError, ValidationError};
use thiserror::Error;

/// SQLite primary result codes this layer cares about.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Entity not found in database.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - Onboarding the same (retailer, product) twice
    /// - A second transfer record for one (request, token)
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// Foreign key constraint violation.
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// CHECK constraint or append-only trigger fired.
    ///
    /// The pure rules should make this unreachable; seeing it means a write
    /// bypassed them.
    #[error("Constraint violation: {message}")]
    ConstraintViolation { message: String },

    /// SQLite reported BUSY or LOCKED (another writer holds the database).
    #[error("Database busy: {0}")]
    Busy(String),

    /// A compare-and-swap on `version` matched no row.
    #[error("Write conflict on {entity} {id}: version {expected_version} is stale")]
    WriteConflict {
        entity: String,
        id: String,
        expected_version: i64,
    },

    /// Database connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a UniqueViolation error.
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn write_conflict(entity: impl Into<String>, id: impl Into<String>, expected_version: i64) -> Self {
        DbError::WriteConflict {
            entity: entity.into(),
            id: id.into(),
            expected_version,
        }
    }

    /// Failures that may succeed if the same unit of work runs again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::Busy(_) | DbError::WriteConflict { .. } | DbError::PoolExhausted
        )
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, DbError::UniqueViolation { .. })
    }
}

/// Extended SQLite result code, if the driver reported one.
fn sqlite_code(db_err: &dyn sqlx::error::DatabaseError) -> Option<i64> {
    db_err.code().and_then(|code| code.parse::<i64>().ok())
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → result code, then message
///   code 5 / 6 (any extended) → DbError::Busy
///   UNIQUE constraint failed  → DbError::UniqueViolation
///   FOREIGN KEY ...           → DbError::ForeignKeyViolation
///   CHECK / trigger abort     → DbError::ConstraintViolation
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message().to_string();

                if let Some(code) = sqlite_code(&*db_err) {
                    let primary = code & 0xff;
                    if primary == SQLITE_BUSY || primary == SQLITE_LOCKED {
                        return DbError::Busy(msg);
                    }
                }

                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation { message: msg }
                } else if msg.contains("CHECK constraint failed") || msg.contains("append-only") {
                    DbError::ConstraintViolation { message: msg }
                } else if msg.contains("database is locked") || msg.contains("database is busy") {
                    DbError::Busy(msg)
                } else {
                    DbError::QueryFailed(msg)
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

// =============================================================================
// Ledger Error
// =============================================================================

/// Errors returned by the mutation engine and the workflows.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A business rule refused the operation. Never retried.
    #[error(transparent)]
    Rule(#[from] CoreError),

    /// A storage failure that was not retried (or not retryable).
    #[error(transparent)]
    Db(#[from] DbError),

    /// Transient storage failures outlasted the retry budget.
    #[error("Storage unavailable during {operation} after {attempts} attempts: {last_error}")]
    StorageUnavailable {
        operation: &'static str,
        attempts: u32,
        #[source]
        last_error: DbError,
    },

    /// The transfer record for this token is already committed.
    ///
    /// Workflows turn this into a replayed result; callers never see it.
    #[error("Transfer {request_id} already recorded for token {idempotency_token}")]
    DuplicateTransfer {
        request_id: String,
        idempotency_token: String,
    },
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Db(e) if e.is_transient())
    }

    /// The business rule that failed, if this is one.
    pub fn as_rule(&self) -> Option<&CoreError> {
        match self {
            LedgerError::Rule(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Db(DbError::from(err))
    }
}

impl From<ValidationError> for LedgerError {
    fn from(err: ValidationError) -> Self {
        LedgerError::Rule(CoreError::Validation(err))
    }
}

/// Result type for engine and workflow operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
