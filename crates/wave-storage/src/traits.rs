//! Storage abstraction trait
//!
//! This module defines the Storage trait that all storage backends must implement.

use crate::context::OperationContext;
use crate::keys::derive_key;
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Boxed error carried by [`StorageError::Backend`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("{backend} storage backend error on {key}: {source}")]
    Backend {
        backend: StorageBackend,
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage operation cancelled")]
    Cancelled,

    #[error("Storage operation deadline exceeded")]
    DeadlineExceeded,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The filesystem layout holds a file where the key needs a directory, or
    /// a directory where it needs a file.
    #[error("Storage key collides with an existing entry: {0}")]
    Conflict(String),
}

impl StorageError {
    /// Wrap an I/O or API failure with the backend and key it happened on.
    pub fn backend(
        backend: StorageBackend,
        key: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        StorageError::Backend {
            backend,
            key: key.into(),
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage abstraction trait
///
/// Both backends (local filesystem, S3-compatible object store) implement this
/// trait, so the consuming service never couples to a specific backend.
///
/// Keys are logical: each backend shards them into a physical path or object
/// key itself (see [`crate::keys::shard`]). Derivative ("linked") files are
/// addressed by `(derivative_key, source_key)` and are stored under the
/// source's name stem, so deleting the source can cascade to them.
///
/// Every operation takes an [`OperationContext`] and stops with
/// [`StorageError::Cancelled`] or [`StorageError::DeadlineExceeded`] once it fires.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Check if a file exists
    async fn exists(&self, ctx: &OperationContext, key: &str) -> StorageResult<bool>;

    /// Store `data` under `key`.
    ///
    /// Fails with [`StorageError::AlreadyExists`] when the key is present. Readers
    /// never observe a partially written object.
    async fn upload(&self, ctx: &OperationContext, key: &str, data: Bytes) -> StorageResult<()>;

    /// Read the whole object stored under `key`.
    async fn get(&self, ctx: &OperationContext, key: &str) -> StorageResult<Bytes>;

    /// Delete `key` together with every derivative grouped under its stem.
    ///
    /// Derivatives go first. If removing them fails the error is returned as
    /// [`StorageError::Backend`] and the source is left untouched. An empty
    /// derivative group is not an error.
    async fn delete(&self, ctx: &OperationContext, key: &str) -> StorageResult<()>;

    /// Delete exactly one derivative. Never cascades.
    async fn delete_cache(
        &self,
        ctx: &OperationContext,
        derivative_key: &str,
        source_key: &str,
    ) -> StorageResult<()>;

    /// Total bytes stored, or [`StorageError::Unsupported`] when the backend
    /// cannot compute it economically.
    async fn space_usage(&self, ctx: &OperationContext) -> StorageResult<u64>;

    /// Get the storage backend type
    fn backend_type(&self) -> StorageBackend;

    async fn exists_linked(
        &self,
        ctx: &OperationContext,
        derivative_key: &str,
        source_key: &str,
    ) -> StorageResult<bool> {
        let key = derive_key(derivative_key, source_key)?;
        self.exists(ctx, &key).await
    }

    async fn upload_linked(
        &self,
        ctx: &OperationContext,
        derivative_key: &str,
        source_key: &str,
        data: Bytes,
    ) -> StorageResult<()> {
        let key = derive_key(derivative_key, source_key)?;
        self.upload(ctx, &key, data).await
    }

    async fn get_linked(
        &self,
        ctx: &OperationContext,
        derivative_key: &str,
        source_key: &str,
    ) -> StorageResult<Bytes> {
        let key = derive_key(derivative_key, source_key)?;
        self.get(ctx, &key).await
    }
}
