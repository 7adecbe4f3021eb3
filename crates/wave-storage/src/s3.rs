use crate::context::OperationContext;
use crate::keys::{
    derivative_group, derive_key, location_is_shared, shard_prefixed, validate_key, SEPARATOR,
};
use crate::traits::{Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use object_store::{
    Attribute, Attributes, ObjectMeta, ObjectStore, ObjectStoreExt, PutMode, PutOptions,
    PutPayload,
};
use std::future::Future;
use tracing::{Instrument, Span};

/// Connection settings for [`S3Storage::new`].
#[derive(Clone, Debug, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible providers (e.g. "http://localhost:9000" for MinIO)
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    /// Key prefix every object is stored under
    pub prefix: String,
    pub conditional_put: bool,
}

/// S3 storage implementation
///
/// Objects are stored at their sharded key under `prefix`. By default uploads
/// check for the key and then put it, which is not atomic: two concurrent
/// uploads of one key can both succeed and the later write wins. With
/// conditional puts enabled the create itself is conditional and a raced
/// upload fails with [`StorageError::AlreadyExists`].
///
/// Generic over the [`ObjectStore`] so any S3-compatible client can be plugged in.
#[derive(Clone, Debug)]
pub struct S3Storage<S = AmazonS3> {
    store: S,
    bucket: String,
    prefix: String,
    conditional_put: bool,
}

impl S3Storage<AmazonS3> {
    /// Create a new S3Storage instance talking to an S3-compatible endpoint
    pub fn new(settings: S3Settings) -> StorageResult<Self> {
        let store = Self::builder(&settings)
            .build()
            .map_err(|e| StorageError::ConfigError(e.to_string()))?;

        Ok(S3Storage::with_store(store, settings.bucket, settings.prefix)
            .with_conditional_put(settings.conditional_put))
    }

    fn builder(settings: &S3Settings) -> AmazonS3Builder {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(settings.region.clone())
            .with_bucket_name(settings.bucket.clone())
            .with_virtual_hosted_style_request(!settings.force_path_style);

        if let Some(ref endpoint) = settings.endpoint {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(allow_http);
        }

        if let (Some(access_key_id), Some(secret_access_key)) =
            (&settings.access_key_id, &settings.secret_access_key)
        {
            builder = builder
                .with_access_key_id(access_key_id.clone())
                .with_secret_access_key(secret_access_key.clone());
        }

        builder
    }
}

impl<S: ObjectStore> S3Storage<S> {
    pub fn with_store(store: S, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        S3Storage {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
            conditional_put: false,
        }
    }

    pub fn with_conditional_put(mut self, enabled: bool) -> Self {
        self.conditional_put = enabled;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_key(&self, key: &str) -> StorageResult<String> {
        validate_key(key)?;
        Ok(shard_prefixed(&self.prefix, key))
    }

    fn backend_error(key: &str, e: ObjectStoreError) -> StorageError {
        StorageError::backend(StorageBackend::S3, key, e)
    }

    fn map_error(key: &str, e: ObjectStoreError) -> StorageError {
        match e {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(key.to_string()),
            ObjectStoreError::AlreadyExists { .. } => StorageError::AlreadyExists(key.to_string()),
            other => Self::backend_error(key, other),
        }
    }

    fn span(&self, operation: &'static str, key: &str) -> Span {
        tracing::info_span!(
            "s3_operation",
            otel.name = operation,
            otel.status_code = tracing::field::Empty,
            otel.status_message = tracing::field::Empty,
            wave.key = %key,
            aws.s3.key = tracing::field::Empty,
            aws.s3.bucket = %self.bucket,
        )
    }

    /// Run `fut` inside `span`, marking the span failed if it errors.
    async fn traced<T, F>(span: Span, fut: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        let result = fut.instrument(span.clone()).await;
        if let Err(ref e) = result {
            span.record("otel.status_code", "ERROR");
            span.record("otel.status_message", e.to_string().as_str());
        }
        result
    }

    /// Metadata-only presence probe; not-found is `false`, not an error.
    async fn probe(&self, ctx: &OperationContext, key: &str, location: &Path) -> StorageResult<bool> {
        ctx.run(async {
            match self.store.head(location).await {
                Ok(_) => Ok(true),
                Err(ObjectStoreError::NotFound { .. }) => Ok(false),
                Err(e) => Err(Self::backend_error(key, e)),
            }
        })
        .await
    }

    async fn remove_object(&self, ctx: &OperationContext, key: &str, location: &Path) -> StorageResult<()> {
        ctx.run(async {
            self.store
                .delete(location)
                .await
                .map_err(|e| Self::map_error(key, e))
        })
        .await
    }

    /// Delete every derivative object under the derivative prefix of `key`.
    ///
    /// Objects whose location is also the location of another key are kept.
    async fn remove_derivatives(
        &self,
        ctx: &OperationContext,
        key: &str,
        group: &str,
        group_key: &str,
        source_location: &Path,
    ) -> StorageResult<usize> {
        let prefix = Path::from(group_key);
        let listed: Vec<ObjectMeta> = ctx
            .run(async {
                self.store
                    .list(Some(&prefix))
                    .try_collect::<Vec<ObjectMeta>>()
                    .await
                    .map_err(|e| Self::backend_error(key, e))
            })
            .await?;

        let group_prefix = format!("{}{}", prefix, SEPARATOR);
        let derivatives = listed.iter().filter(|meta| {
            if meta.location == *source_location {
                return false;
            }
            match meta.location.as_ref().strip_prefix(group_prefix.as_str()) {
                Some(relative) => {
                    let shared = location_is_shared(&format!("{}{}{}", group, SEPARATOR, relative));
                    if shared {
                        tracing::debug!(
                            bucket = %self.bucket,
                            key = %meta.location,
                            "S3 cascade kept object shared with another key"
                        );
                    }
                    !shared
                }
                None => false,
            }
        });

        let mut removed = 0;
        for meta in derivatives {
            match self.remove_object(ctx, key, &meta.location).await {
                Ok(()) | Err(StorageError::NotFound(_)) => removed += 1,
                Err(StorageError::Cancelled) => return Err(StorageError::Cancelled),
                Err(StorageError::DeadlineExceeded) => return Err(StorageError::DeadlineExceeded),
                Err(StorageError::Backend { source, .. }) => {
                    return Err(StorageError::backend(StorageBackend::S3, key, source))
                }
                Err(other) => return Err(StorageError::backend(StorageBackend::S3, key, other)),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl<S: ObjectStore> Storage for S3Storage<S> {
    async fn exists(&self, ctx: &OperationContext, key: &str) -> StorageResult<bool> {
        Self::traced(self.span("s3.exists", key), async {
            let object_key = self.object_key(key)?;
            Span::current().record("aws.s3.key", object_key.as_str());
            self.probe(ctx, key, &Path::from(object_key)).await
        })
        .await
    }

    async fn upload(&self, ctx: &OperationContext, key: &str, data: Bytes) -> StorageResult<()> {
        Self::traced(self.span("s3.upload", key), async {
            let object_key = self.object_key(key)?;
            Span::current().record("aws.s3.key", object_key.as_str());
            let location = Path::from(object_key.as_str());
            let size = data.len() as u64;
            let start = std::time::Instant::now();

            let mode = if self.conditional_put {
                PutMode::Create
            } else {
                // Check-then-put: a concurrent writer can still slip in between.
                if self.probe(ctx, key, &location).await? {
                    return Err(StorageError::AlreadyExists(key.to_string()));
                }
                PutMode::Overwrite
            };

            let mut attributes = Attributes::new();
            attributes.insert(Attribute::ContentDisposition, "attachment".into());
            let options = PutOptions {
                mode,
                attributes,
                ..Default::default()
            };

            ctx.run(async {
                self.store
                    .put_opts(&location, PutPayload::from(data), options)
                    .await
                    .map_err(|e| match e {
                        ObjectStoreError::AlreadyExists { .. }
                        | ObjectStoreError::Precondition { .. } => {
                            StorageError::AlreadyExists(key.to_string())
                        }
                        other => Self::backend_error(key, other),
                    })
            })
            .await
            .map_err(|e| {
                if !e.is_already_exists() {
                    tracing::error!(
                        error = %e,
                        bucket = %self.bucket,
                        key = %object_key,
                        size_bytes = size,
                        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "S3 upload failed"
                    );
                }
                e
            })?;

            tracing::info!(
                bucket = %self.bucket,
                key = %object_key,
                size_bytes = size,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 upload successful"
            );
            Ok(())
        })
        .await
    }

    async fn get(&self, ctx: &OperationContext, key: &str) -> StorageResult<Bytes> {
        Self::traced(self.span("s3.get", key), async {
            let object_key = self.object_key(key)?;
            Span::current().record("aws.s3.key", object_key.as_str());
            let location = Path::from(object_key.as_str());
            let start = std::time::Instant::now();

            let bytes = ctx
                .run(async {
                    let result = self
                        .store
                        .get(&location)
                        .await
                        .map_err(|e| Self::map_error(key, e))?;
                    result.bytes().await.map_err(|e| Self::map_error(key, e))
                })
                .await?;

            tracing::debug!(
                bucket = %self.bucket,
                key = %object_key,
                size_bytes = bytes.len() as u64,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 download successful"
            );
            Ok(bytes)
        })
        .await
    }

    async fn delete(&self, ctx: &OperationContext, key: &str) -> StorageResult<()> {
        Self::traced(self.span("s3.delete", key), async {
            let object_key = self.object_key(key)?;
            Span::current().record("aws.s3.key", object_key.as_str());
            let location = Path::from(object_key.as_str());
            let start = std::time::Instant::now();

            // Derivatives first; a failure here leaves the source untouched.
            if let Some(group) = derivative_group(key) {
                let group_key = shard_prefixed(&self.prefix, group);
                let linked_span = self.span("s3.delete.linked", key);
                linked_span.record("aws.s3.key", group_key.as_str());

                let removed = Self::traced(
                    linked_span,
                    self.remove_derivatives(ctx, key, group, &group_key, &location),
                )
                .await?;

                tracing::debug!(
                    bucket = %self.bucket,
                    prefix = %group_key,
                    removed,
                    "S3 derivatives removed"
                );
            }

            let source_span = self.span("s3.delete.source", key);
            source_span.record("aws.s3.key", object_key.as_str());
            Self::traced(source_span, async {
                if !self.probe(ctx, key, &location).await? {
                    return Err(StorageError::NotFound(key.to_string()));
                }
                self.remove_object(ctx, key, &location).await
            })
            .await?;

            tracing::info!(
                bucket = %self.bucket,
                key = %object_key,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 delete successful"
            );
            Ok(())
        })
        .await
    }

    async fn delete_cache(
        &self,
        ctx: &OperationContext,
        derivative_key: &str,
        source_key: &str,
    ) -> StorageResult<()> {
        let span = self.span("s3.delete_cache", derivative_key);
        Self::traced(span, async {
            let key = derive_key(derivative_key, source_key)?;
            let object_key = self.object_key(&key)?;
            Span::current().record("aws.s3.key", object_key.as_str());
            let location = Path::from(object_key.as_str());

            if !self.probe(ctx, &key, &location).await? {
                return Err(StorageError::NotFound(key));
            }
            self.remove_object(ctx, &key, &location).await?;

            tracing::info!(
                bucket = %self.bucket,
                key = %object_key,
                "S3 cache entry deleted"
            );
            Ok(())
        })
        .await
    }

    async fn space_usage(&self, _ctx: &OperationContext) -> StorageResult<u64> {
        // Expected outcome, so the span is not marked failed.
        let _entered = self.span("s3.space_usage", &self.prefix).entered();
        Err(StorageError::Unsupported(
            "space usage is not computed for object storage".to_string(),
        ))
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }
}
