/// Errors that can occur within the storage layer.
///
/// # Examples
///
/// ```rust
/// use mailmon_storage::error::StorageError;
///
/// let err = StorageError::InvalidColumn {
///     column: "status",
///     reason: "unknown target status 'gone'".to_string(),
/// };
/// assert!(err.to_string().contains("status"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failure (details, config, channel lists).
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backing store cannot be reached right now.
    #[error("Storage: backend unavailable: {0}")]
    Unavailable(String),

    /// A column held a value that does not map onto the domain type.
    #[error("Storage: invalid value in column '{column}': {reason}")]
    InvalidColumn { column: &'static str, reason: String },

    /// Generic storage error for cases not covered by other variants.
    #[error("Storage: {0}")]
    Other(String),
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
