//! Wave Core Library
//!
//! Types shared by every Wave crate: the storage backend selector and the
//! storage configuration it is chosen from.

pub mod config;
pub mod storage_types;

// Re-export commonly used types
pub use config::StorageConfig;
pub use storage_types::StorageBackend;
