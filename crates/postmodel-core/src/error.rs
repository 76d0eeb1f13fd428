//! Error taxonomy for postmodel.
//!
//! Every fallible operation in the workspace returns [`PostmodelResult`]. The
//! variants are grouped the way callers usually react to them: definition-time
//! mistakes, statement-time driver failures, and row-level domain errors.

use thiserror::Error;

/// The primary error type for postmodel.
#[derive(Error, Debug)]
pub enum PostmodelError {
    // ── Definition time ──────────────────────────────────────────────

    /// Invalid DSN, model metadata or options. Raised at definition/init time.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A field name that the model does not declare.
    #[error("Field error: {0}")]
    FieldError(String),

    /// A value that cannot be converted to the field's semantic type.
    #[error("Field value error: {0}")]
    FieldValueError(String),

    /// Bad arguments passed to a query or model operation.
    #[error("Params error: {0}")]
    ParamsError(String),

    // ── Statement time ───────────────────────────────────────────────

    /// Cannot reach or authenticate to the backend.
    #[error("Database connection error: {0}")]
    DbConnectionError(String),

    /// Malformed SQL, access denied, engine closed, and similar.
    #[error("Operational error: {0}")]
    OperationalError(String),

    /// A uniqueness, not-null or foreign key constraint was violated.
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    /// Commands issued in an invalid transaction state, or nested scopes.
    #[error("Transaction management error: {0}")]
    TransactionManagementError(String),

    /// A driver error with no more specific category.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // ── Row semantics ────────────────────────────────────────────────

    /// Zero rows where exactly one was expected.
    #[error("Object does not exist: {0}")]
    DoesNotExist(String),

    /// More than one row where exactly one was expected.
    #[error("Multiple objects returned when one expected: {0}")]
    MultipleObjectsReturned(String),

    /// The optimistic version check matched no row.
    #[error("Stale object: {0}")]
    StaleObjectError(String),

    /// Assignment to the primary key of a persisted instance.
    #[error("Primary key changed: {0}")]
    PrimaryKeyChanged(String),

    /// A composite-key lookup supplied only part of the key.
    #[error("Primary key integrity error: {0}")]
    PrimaryKeyIntegrityError(String),

    // ── Serialization ────────────────────────────────────────────────

    /// An error occurred during serialization or deserialization.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    // ── IO ───────────────────────────────────────────────────────────

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PostmodelError {
    /// Returns `true` for the "no matching row" error.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::DoesNotExist(_))
    }

    /// Returns `true` for constraint violations.
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::IntegrityError(_))
    }

    /// Returns `true` when the caller may reload and retry the write.
    pub const fn is_retryable_conflict(&self) -> bool {
        matches!(self, Self::StaleObjectError(_))
    }

    /// Returns `true` for errors raised while defining models or engines.
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationError(_) | Self::FieldError(_) | Self::ParamsError(_)
        )
    }
}

/// A convenience type alias for `Result<T, PostmodelError>`.
pub type PostmodelResult<T> = Result<T, PostmodelError>;
