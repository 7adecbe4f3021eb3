use crate::context::OperationContext;
use crate::keys::{derivative_group, derive_key, location_is_shared, shard_path, validate_key, SEPARATOR};
use crate::traits::{Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Local filesystem storage implementation
///
/// Files live under `base_path` at their sharded location. Uploads are
/// exclusive: of two concurrent uploads of one key exactly one succeeds.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `base_path` - Root directory for file storage (e.g., "/var/lib/wave/source")
    pub async fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalStorage { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Convert storage key to its sharded filesystem path
    fn key_to_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(shard_path(&self.base_path, key))
    }

    fn backend_error(key: &str, e: io::Error) -> StorageError {
        StorageError::backend(StorageBackend::Local, key, e)
    }

    /// Map an error from touching the file of `key` itself.
    fn file_error(key: &str, e: io::Error) -> StorageError {
        match e.kind() {
            // A directory or a file standing where the path expects a directory
            // means no file by that key either.
            ErrorKind::NotFound | ErrorKind::NotADirectory | ErrorKind::IsADirectory => {
                StorageError::NotFound(key.to_string())
            }
            ErrorKind::AlreadyExists => StorageError::AlreadyExists(key.to_string()),
            _ => Self::backend_error(key, e),
        }
    }

    /// Write `data` to a fresh temporary file next to `path`, then publish it.
    ///
    /// Publishing is a hard link, which fails if `path` exists. The file only
    /// appears under its final name once it is complete and synced.
    async fn write_exclusive(
        &self,
        ctx: &OperationContext,
        key: &str,
        temp_path: &Path,
        path: &Path,
        data: &[u8],
    ) -> StorageResult<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp_path)
            .await
            .map_err(|e| Self::backend_error(key, e))?;

        file.write_all(data)
            .await
            .map_err(|e| Self::backend_error(key, e))?;
        file.sync_all()
            .await
            .map_err(|e| Self::backend_error(key, e))?;
        drop(file);

        ctx.check()?;

        match fs::hard_link(temp_path, path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && is_dir(path).await => {
                Err(StorageError::Conflict(key.to_string()))
            }
            Err(e) => Err(Self::file_error(key, e)),
        }
    }

    /// Remove the derivatives grouped under the stem of `key`.
    ///
    /// Files in the group directory that are also the location of another key
    /// are left alone, as are the directories still holding them.
    async fn remove_derivatives(&self, ctx: &OperationContext, key: &str) -> StorageResult<usize> {
        let Some(group) = derivative_group(key) else {
            return Ok(0);
        };
        let group_path = shard_path(&self.base_path, group);

        match fs::symlink_metadata(&group_path).await {
            Ok(meta) if meta.is_dir() => {}
            // Nothing to cascade to, or the path is some other regular file.
            Ok(_) => return Ok(0),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                return Ok(0)
            }
            Err(e) => return Err(Self::backend_error(group, e)),
        }

        let mut removed = 0;
        let mut visited = Vec::new();
        let mut pending = vec![group_path.clone()];

        while let Some(dir) = pending.pop() {
            ctx.check()?;
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::backend_error(group, e)),
            };
            visited.push(dir);

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::backend_error(group, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Self::backend_error(group, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Some(derivative) = derivative_key_at(group, &group_path, &path) else {
                    continue;
                };
                if location_is_shared(&derivative) {
                    tracing::debug!(
                        path = %path.display(),
                        key = %key,
                        "Local storage cascade kept entry shared with another key"
                    );
                    continue;
                }

                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(Self::backend_error(&derivative, e)),
                }
            }
        }

        // Children were visited after their parents.
        for dir in visited.iter().rev() {
            match fs::remove_dir(dir).await {
                Ok(()) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::DirectoryNotEmpty | ErrorKind::NotFound
                    ) => {}
                Err(e) => return Err(Self::backend_error(group, e)),
            }
        }

        tracing::debug!(
            path = %group_path.display(),
            key = %key,
            removed,
            "Local storage derivatives removed"
        );
        Ok(removed)
    }
}

/// Derivative key stored at `path` inside the group directory of `group`.
fn derivative_key_at(group: &str, group_path: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(group_path).ok()?;
    let mut key = group.to_string();
    for component in relative.components() {
        key.push(SEPARATOR);
        key.push_str(component.as_os_str().to_str()?);
    }
    Some(key)
}

async fn is_dir(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// Unique sibling path for an upload in progress.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

#[async_trait]
impl Storage for LocalStorage {
    async fn exists(&self, ctx: &OperationContext, key: &str) -> StorageResult<bool> {
        ctx.check()?;
        let path = self.key_to_path(key)?;

        let exists = match fs::metadata(&path).await {
            Ok(meta) => meta.is_file(),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => false,
            Err(e) => return Err(Self::backend_error(key, e)),
        };

        ctx.check()?;
        Ok(exists)
    }

    async fn upload(&self, ctx: &OperationContext, key: &str, data: Bytes) -> StorageResult<()> {
        ctx.check()?;
        let path = self.key_to_path(key)?;
        let size = data.len();
        let start = std::time::Instant::now();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| match e.kind() {
                // A file stands where the key needs a directory.
                ErrorKind::AlreadyExists | ErrorKind::NotADirectory => {
                    StorageError::Conflict(key.to_string())
                }
                _ => Self::backend_error(key, e),
            })?;
        }
        ctx.check()?;

        let temp_path = temp_path_for(&path);
        let result = self
            .write_exclusive(ctx, key, &temp_path, &path, &data)
            .await;

        if let Err(e) = fs::remove_file(&temp_path).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(
                    error = %e,
                    path = %temp_path.display(),
                    "Failed to remove temporary upload file"
                );
            }
        }

        match &result {
            Ok(()) => tracing::info!(
                path = %path.display(),
                key = %key,
                size_bytes = size,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "Local storage upload successful"
            ),
            Err(StorageError::AlreadyExists(_)) => tracing::debug!(
                path = %path.display(),
                key = %key,
                "Local storage upload rejected, key exists"
            ),
            Err(e) => tracing::error!(
                error = %e,
                path = %path.display(),
                key = %key,
                size_bytes = size,
                "Local storage upload failed"
            ),
        }

        result
    }

    async fn get(&self, ctx: &OperationContext, key: &str) -> StorageResult<Bytes> {
        ctx.check()?;
        let path = self.key_to_path(key)?;
        let start = std::time::Instant::now();

        let data = fs::read(&path)
            .await
            .map_err(|e| Self::file_error(key, e))?;

        ctx.check()?;

        tracing::debug!(
            path = %path.display(),
            key = %key,
            size_bytes = data.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage download successful"
        );

        Ok(Bytes::from(data))
    }

    async fn delete(&self, ctx: &OperationContext, key: &str) -> StorageResult<()> {
        ctx.check()?;
        let path = self.key_to_path(key)?;
        let start = std::time::Instant::now();

        self.remove_derivatives(ctx, key).await.map_err(|e| {
            tracing::error!(
                error = %e,
                key = %key,
                "Local storage delete aborted, derivatives could not be removed"
            );
            e
        })?;
        ctx.check()?;

        fs::remove_file(&path)
            .await
            .map_err(|e| Self::file_error(key, e))?;

        tracing::info!(
            path = %path.display(),
            key = %key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage delete successful"
        );

        Ok(())
    }

    async fn delete_cache(
        &self,
        ctx: &OperationContext,
        derivative_key: &str,
        source_key: &str,
    ) -> StorageResult<()> {
        ctx.check()?;
        let key = derive_key(derivative_key, source_key)?;
        let path = self.key_to_path(&key)?;

        fs::remove_file(&path)
            .await
            .map_err(|e| Self::file_error(&key, e))?;

        tracing::info!(
            path = %path.display(),
            key = %key,
            "Local storage cache entry deleted"
        );

        Ok(())
    }

    async fn space_usage(&self, ctx: &OperationContext) -> StorageResult<u64> {
        let root = self.base_path.display().to_string();
        let mut total = 0u64;
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            ctx.check()?;
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // Removed by a concurrent delete while walking.
                Err(e) if e.kind() == ErrorKind::NotFound && dir != self.base_path => continue,
                Err(e) => return Err(Self::backend_error(&root, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::backend_error(&root, e))?
            {
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(Self::backend_error(&root, e)),
                };
                if meta.is_dir() {
                    pending.push(entry.path());
                } else if meta.is_file() {
                    total += meta.len();
                }
            }
        }

        tracing::debug!(path = %root, size_bytes = total, "Local storage usage computed");
        Ok(total)
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }
}

#[cfg(all(test, feature = "storage-local"))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    async fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_upload_lands_at_sharded_path() {
        let (dir, storage) = storage().await;
        let ctx = OperationContext::new();

        storage
            .upload(&ctx, "ab1234/song.mp3", Bytes::from_static(b"id3"))
            .await
            .unwrap();

        let expected = dir.path().join("ab/12/34/ab1234/song.mp3");
        assert_eq!(std::fs::read(expected).unwrap(), b"id3");
    }

    #[tokio::test]
    async fn test_upload_leaves_no_temporary_files() {
        let (dir, storage) = storage().await;
        let ctx = OperationContext::new();

        storage
            .upload(&ctx, "abcd", Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert!(storage
            .upload(&ctx, "abcd", Bytes::from_static(b"other"))
            .await
            .unwrap_err()
            .is_already_exists());

        let names: Vec<String> = std::fs::read_dir(dir.path().join("ab/cd"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["abcd".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_exactly_one_wins() {
        let (_dir, storage) = storage().await;
        let storage = Arc::new(storage);

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let storage = storage.clone();
                tokio::spawn(async move {
                    storage
                        .upload(&OperationContext::new(), "race.mp3", Bytes::from(vec![i; 1024]))
                        .await
                })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => successes += 1,
                Err(e) => assert!(e.is_already_exists(), "unexpected error: {}", e),
            }
        }
        assert_eq!(successes, 1);

        let data = storage.get(&OperationContext::new(), "race.mp3").await.unwrap();
        assert_eq!(data.len(), 1024);
        assert!(data.iter().all(|b| *b == data[0]));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, storage) = storage().await;
        let ctx = OperationContext::new();

        let result = storage.get(&ctx, "../../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.delete(&ctx, "../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.exists(&ctx, "/etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_not_found() {
        let (_dir, storage) = storage().await;
        let result = storage.delete(&OperationContext::new(), "nonexistent.txt").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_ignores_unrelated_file_at_group_path() {
        let (_dir, storage) = storage().await;
        let ctx = OperationContext::new();

        // "song" is its own extensionless key, not the derivative group of "song.mp3".
        storage.upload(&ctx, "song", Bytes::from_static(b"a")).await.unwrap();
        storage.upload(&ctx, "song.mp3", Bytes::from_static(b"b")).await.unwrap();

        storage.delete(&ctx, "song.mp3").await.unwrap();

        assert!(storage.exists(&ctx, "song").await.unwrap());
        assert!(!storage.exists(&ctx, "song.mp3").await.unwrap());
    }

    #[tokio::test]
    async fn test_derivative_cannot_nest_under_extensionless_file() {
        let (_dir, storage) = storage().await;
        let ctx = OperationContext::new();

        storage.upload(&ctx, "song", Bytes::from_static(b"a")).await.unwrap();

        assert!(!storage.exists_linked(&ctx, "thumb.png", "song").await.unwrap());
        let result = storage
            .upload_linked(&ctx, "thumb.png", "song", Bytes::from_static(b"t"))
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_upload_onto_group_directory_conflicts() {
        let (_dir, storage) = storage().await;
        let ctx = OperationContext::new();

        storage
            .upload_linked(&ctx, "thumb.png", "song.mp3", Bytes::from_static(b"t"))
            .await
            .unwrap();

        assert!(!storage.exists(&ctx, "song").await.unwrap());
        let result = storage.upload(&ctx, "song", Bytes::from_static(b"a")).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))), "{:?}", result);
        assert!(storage.get(&ctx, "song").await.unwrap_err().is_not_found());

        // Once the group is gone the key is writable.
        storage.delete_cache(&ctx, "thumb.png", "song.mp3").await.unwrap();
        storage.upload(&ctx, "song.mp3", Bytes::from_static(b"s")).await.unwrap();
        storage.delete(&ctx, "song.mp3").await.unwrap();
        storage.upload(&ctx, "song", Bytes::from_static(b"a")).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_emptied_group_directories() {
        let (dir, storage) = storage().await;
        let ctx = OperationContext::new();

        storage.upload(&ctx, "clip.mp4", Bytes::from_static(b"v")).await.unwrap();
        storage
            .upload_linked(&ctx, "hls/seg1.ts", "clip.mp4", Bytes::from_static(b"1"))
            .await
            .unwrap();
        storage
            .upload_linked(&ctx, "hls/seg2.ts", "clip.mp4", Bytes::from_static(b"2"))
            .await
            .unwrap();

        storage.delete(&ctx, "clip.mp4").await.unwrap();

        assert!(!dir.path().join("cl/ip/clip").exists());
        assert!(dir.path().join("cl/ip").is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_delete_keeps_source_when_derivatives_cannot_be_removed() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, storage) = storage().await;
        let ctx = OperationContext::new();

        storage.upload(&ctx, "song.mp3", Bytes::from_static(b"source")).await.unwrap();
        storage
            .upload_linked(&ctx, "thumb.png", "song.mp3", Bytes::from_static(b"thumb"))
            .await
            .unwrap();

        let group_dir = dir.path().join("so/ng/song");
        std::fs::set_permissions(&group_dir, std::fs::Permissions::from_mode(0o555)).unwrap();

        // Root ignores directory permissions, so there is nothing to observe.
        if std::fs::File::create(group_dir.join(".writable")).is_ok() {
            std::fs::set_permissions(&group_dir, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let result = storage.delete(&ctx, "song.mp3").await;
        std::fs::set_permissions(&group_dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(matches!(result, Err(StorageError::Backend { .. })), "{:?}", result);
        assert_eq!(storage.get(&ctx, "song.mp3").await.unwrap().as_ref(), b"source");
        assert!(storage.exists_linked(&ctx, "thumb.png", "song.mp3").await.unwrap());
    }

    #[tokio::test]
    async fn test_space_usage_sums_file_sizes() {
        let (_dir, storage) = storage().await;
        let ctx = OperationContext::new();

        assert_eq!(storage.space_usage(&ctx).await.unwrap(), 0);

        storage.upload(&ctx, "song.mp3", Bytes::from(vec![0u8; 100])).await.unwrap();
        storage
            .upload_linked(&ctx, "thumb.png", "song.mp3", Bytes::from(vec![0u8; 25]))
            .await
            .unwrap();
        storage.upload(&ctx, "ab", Bytes::from(vec![0u8; 7])).await.unwrap();

        assert_eq!(storage.space_usage(&ctx).await.unwrap(), 132);
    }

    #[tokio::test]
    async fn test_cancelled_upload_writes_nothing() {
        let (dir, storage) = storage().await;
        let token = CancellationToken::new();
        token.cancel();
        let ctx = OperationContext::new().with_token(token);

        let result = storage.upload(&ctx, "song.mp3", Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert!(!dir.path().join("so").exists());
    }

    #[tokio::test]
    async fn test_backend_type() {
        let (_dir, storage) = storage().await;
        assert_eq!(storage.backend_type(), StorageBackend::Local);
    }
}
