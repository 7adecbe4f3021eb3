//! Configuration module
//!
//! Storage configuration is read once at process start and handed to the
//! storage factory. Nothing here is global: callers own the returned value.

use std::env;

use crate::storage_types::StorageBackend;

const DEFAULT_BACKEND: StorageBackend = StorageBackend::Local;

/// Storage configuration consumed at backend construction time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StorageConfig {
    pub backend: Option<StorageBackend>,
    // Filesystem backend
    pub local_storage_path: Option<String>,
    // Object store backend
    pub s3_endpoint: Option<String>, // Custom endpoint for S3-compatible providers (MinIO, Ceph, etc.)
    pub s3_region: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub s3_force_path_style: bool,
    pub s3_bucket: Option<String>,
    pub s3_prefix: String,
    /// Use a conditional create for uploads instead of check-then-put.
    pub s3_conditional_put: bool,
    // Reserved for a size-bounded eviction tier; no storage component reads these.
    pub max_size_bytes: Option<u64>,
    pub retention_threshold: Option<f64>,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|s| !s.trim().is_empty());

        let backend = var("STORAGE_BACKEND")
            .map(|s| s.parse::<StorageBackend>())
            .transpose()?;

        let config = StorageConfig {
            backend,
            local_storage_path: var("LOCAL_STORAGE_PATH"),
            s3_endpoint: var("S3_ENDPOINT"),
            s3_region: var("S3_REGION").or_else(|| var("AWS_REGION")),
            s3_access_key_id: var("S3_ACCESS_KEY_ID").or_else(|| var("AWS_ACCESS_KEY_ID")),
            s3_secret_access_key: var("S3_SECRET_ACCESS_KEY")
                .or_else(|| var("AWS_SECRET_ACCESS_KEY")),
            s3_force_path_style: parse_bool(var("S3_FORCE_PATH_STYLE"), false),
            s3_bucket: var("S3_BUCKET"),
            s3_prefix: var("S3_PREFIX").unwrap_or_default(),
            s3_conditional_put: parse_bool(var("S3_CONDITIONAL_PUT"), false),
            max_size_bytes: var("STORAGE_MAX_SIZE_BYTES")
                .map(|s| s.trim().parse::<u64>())
                .transpose()
                .map_err(|e| anyhow::anyhow!("STORAGE_MAX_SIZE_BYTES must be an integer: {}", e))?,
            retention_threshold: var("STORAGE_RETENTION_THRESHOLD")
                .map(|s| s.trim().parse::<f64>())
                .transpose()
                .map_err(|e| {
                    anyhow::anyhow!("STORAGE_RETENTION_THRESHOLD must be a number: {}", e)
                })?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Backend selected by configuration, falling back to the filesystem.
    pub fn storage_backend(&self) -> StorageBackend {
        self.backend.unwrap_or(DEFAULT_BACKEND)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        match self.storage_backend() {
            StorageBackend::Local => {
                if self.local_storage_path.is_none() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_PATH must be set when using local storage backend"
                    ));
                }
            }
            StorageBackend::S3 => {
                if self.s3_bucket.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_BUCKET must be set when using S3 storage backend"
                    ));
                }
                if self.s3_region.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_REGION or AWS_REGION must be set when using S3 storage backend"
                    ));
                }
                if self.s3_access_key_id.is_some() != self.s3_secret_access_key.is_some() {
                    return Err(anyhow::anyhow!(
                        "S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together"
                    ));
                }
            }
        }

        if let Some(threshold) = self.retention_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(anyhow::anyhow!(
                    "STORAGE_RETENTION_THRESHOLD must be between 0.0 and 1.0"
                ));
            }
        }

        Ok(())
    }
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(|s| s.trim().to_lowercase()) {
        Some(s) if matches!(s.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(s) if matches!(s.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
