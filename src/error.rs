use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the flag service and rule engine.
#[derive(Debug, Error)]
pub enum FlagError {
    /// Malformed input: bad rule chain, too many tags, capacity exceeded,
    /// invalid update statement.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("duplicate rule chain: {0}")]
    DuplicateChain(String),

    #[error("flag not found: {0}")]
    NotFound(String),

    #[error("flag already exists: {0}")]
    AlreadyExists(String),

    #[error("unable to initialize flags service due to ({}) missing dependencies: {}", .0.len(), .0.join(","))]
    MissingDependencies(Vec<&'static str>),

    /// A stored rule chain that could never have passed validation.
    #[error("corrupt rule chain: {0}")]
    CorruptRuleChain(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for FlagError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => FlagError::NotFound(id),
            StoreError::AlreadyExists(id) => FlagError::AlreadyExists(id),
            StoreError::Query(e) => FlagError::Validation(e.to_string()),
            other => FlagError::Store(other),
        }
    }
}
