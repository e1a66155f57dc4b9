//! Persistence collaborators for flag records.
//!
//! The service only needs four operations from a store: read by id, create,
//! idempotent delete, and a partial field update scoped to one record. Writers
//! express every partial update through [`crate::query::build_update`].

pub mod couchbase;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::flags::Record;
use crate::query::{QueryError, Update};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("unable to build query: {0}")]
    Query(#[from] QueryError),

    #[error("query service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unable to decode flag record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("query service error {code}: {message}")]
    Backend { code: i64, message: String },

    #[error("unable to initialize flag store due to {} dependencies: {}", .0.len(), .0.join(","))]
    MissingDependencies(Vec<&'static str>),
}

/// Reads flag records.
#[async_trait]
pub trait FlagReader: Send + Sync {
    /// Fails with [`StoreError::NotFound`] when no record has this id.
    async fn get(&self, id: &str) -> Result<Record, StoreError>;
}

/// Creates and manipulates flag records.
#[async_trait]
pub trait FlagWriter: Send + Sync {
    /// Fails with [`StoreError::AlreadyExists`] on a duplicate id.
    async fn create(&self, record: &Record) -> Result<(), StoreError>;

    /// Succeeds when the record is already gone.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Update only the given fields of the record with this id.
    async fn update_fields(&self, id: &str, updates: &[Update]) -> Result<(), StoreError>;
}
