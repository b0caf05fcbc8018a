use mailmon_storage::StorageError;

/// Errors raised while evaluating rules or applying their transitions.
///
/// The variants follow how a pass reacts to them: a configuration error
/// skips the single rule or channel, a transient source error leaves the
/// rule untouched until the next pass, and a persistence error means a
/// state write was retried and still failed.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Alert: configuration error: {0}")]
    Configuration(String),

    #[error("Alert: transient source error: {0}")]
    TransientSource(String),

    #[error("Alert: persistence error: {0}")]
    Persistence(String),

    #[error("Alert: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, AlertError>;
