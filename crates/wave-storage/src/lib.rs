//! Wave Storage Library
//!
//! This crate provides the storage abstraction and its two implementations:
//! a local filesystem tree and an S3-compatible object store.
//!
//! # Storage key format
//!
//! Callers pass logical keys. Every backend shards them the same way (see
//! [`keys::shard`]): `song.mp3` is stored at `so/ng/.m/song.mp3`, under the
//! root directory or the configured object key prefix.
//!
//! Derivative files (thumbnails, waveforms, transcodes) are addressed by a
//! derivative key and their source key, and stored as `{stem}/{derivative}`
//! where `stem` is the source's file name without extension. Deleting a source
//! removes its derivatives first.

pub mod context;
pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use context::OperationContext;
pub use factory::create_storage;
pub use keys::{derive_key, shard, stem};
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
#[cfg(feature = "storage-s3")]
pub use s3::{S3Settings, S3Storage};
pub use traits::{BoxError, Storage, StorageError, StorageResult};
pub use wave_core::StorageBackend;
