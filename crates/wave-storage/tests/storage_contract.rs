//! Behaviour every storage backend must share, run against each implementation.

use bytes::Bytes;
use object_store::memory::InMemory;
use std::sync::Arc;
use tempfile::TempDir;
use wave_storage::{
    derive_key, LocalStorage, OperationContext, S3Storage, Storage, StorageError,
};

struct Backend {
    name: &'static str,
    storage: Arc<dyn Storage>,
    _dir: Option<TempDir>,
}

async fn backends() -> Vec<Backend> {
    let dir = tempfile::tempdir().unwrap();
    let local = LocalStorage::new(dir.path().join("data")).await.unwrap();
    let s3 = S3Storage::with_store(InMemory::new(), "songs", "source");

    vec![
        Backend {
            name: "local",
            storage: Arc::new(local),
            _dir: Some(dir),
        },
        Backend {
            name: "s3",
            storage: Arc::new(s3),
            _dir: None,
        },
    ]
}

#[tokio::test]
async fn never_stored_key_is_absent() {
    let ctx = OperationContext::new();
    for backend in backends().await {
        let storage = &backend.storage;
        assert!(!storage.exists(&ctx, "missing.mp3").await.unwrap(), "{}", backend.name);
        assert!(
            storage.get(&ctx, "missing.mp3").await.unwrap_err().is_not_found(),
            "{}",
            backend.name
        );
    }
}

#[tokio::test]
async fn upload_then_get_is_byte_exact() {
    let ctx = OperationContext::new();
    let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();

    for backend in backends().await {
        let storage = &backend.storage;
        storage
            .upload(&ctx, "song.mp3", Bytes::from(payload.clone()))
            .await
            .unwrap();

        assert!(storage.exists(&ctx, "song.mp3").await.unwrap(), "{}", backend.name);
        let data = storage.get(&ctx, "song.mp3").await.unwrap();
        assert_eq!(data.as_ref(), payload.as_slice(), "{}", backend.name);
    }
}

#[tokio::test]
async fn empty_payload_round_trips() {
    let ctx = OperationContext::new();
    for backend in backends().await {
        let storage = &backend.storage;
        storage.upload(&ctx, "silence.wav", Bytes::new()).await.unwrap();
        assert!(storage.exists(&ctx, "silence.wav").await.unwrap(), "{}", backend.name);
        assert!(storage.get(&ctx, "silence.wav").await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn second_upload_is_rejected_and_original_kept() {
    let ctx = OperationContext::new();
    for backend in backends().await {
        let storage = &backend.storage;
        storage
            .upload(&ctx, "song.mp3", Bytes::from_static(b"original"))
            .await
            .unwrap();

        let err = storage
            .upload(&ctx, "song.mp3", Bytes::from_static(b"replacement"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists(), "{}: {}", backend.name, err);

        let data = storage.get(&ctx, "song.mp3").await.unwrap();
        assert_eq!(data.as_ref(), b"original", "{}", backend.name);
    }
}

#[tokio::test]
async fn linked_operations_match_plain_operations_on_derived_key() {
    let ctx = OperationContext::new();
    let derived = derive_key("thumb.png", "song.mp3").unwrap();
    assert_eq!(derived, "song/thumb.png");

    for backend in backends().await {
        let storage = &backend.storage;
        assert!(!storage.exists_linked(&ctx, "thumb.png", "song.mp3").await.unwrap());

        storage
            .upload_linked(&ctx, "thumb.png", "song.mp3", Bytes::from_static(b"png"))
            .await
            .unwrap();

        assert!(storage.exists(&ctx, &derived).await.unwrap(), "{}", backend.name);
        assert!(storage.exists_linked(&ctx, "thumb.png", "song.mp3").await.unwrap());
        assert_eq!(
            storage.get(&ctx, &derived).await.unwrap(),
            storage.get_linked(&ctx, "thumb.png", "song.mp3").await.unwrap()
        );

        // Uploading through the derived key hits the same object.
        let err = storage
            .upload(&ctx, &derived, Bytes::from_static(b"again"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists(), "{}", backend.name);
    }
}

#[tokio::test]
async fn delete_cascades_to_derivatives() {
    let ctx = OperationContext::new();
    for backend in backends().await {
        let storage = &backend.storage;
        storage
            .upload(&ctx, "song.mp3", Bytes::from_static(b"source"))
            .await
            .unwrap();
        storage
            .upload_linked(&ctx, "thumb.png", "song.mp3", Bytes::from_static(b"thumb"))
            .await
            .unwrap();
        storage
            .upload_linked(&ctx, "wave.json", "song.mp3", Bytes::from_static(b"[]"))
            .await
            .unwrap();

        storage.delete(&ctx, "song.mp3").await.unwrap();

        assert!(!storage.exists(&ctx, "song.mp3").await.unwrap(), "{}", backend.name);
        assert!(!storage.exists_linked(&ctx, "thumb.png", "song.mp3").await.unwrap());
        assert!(!storage.exists_linked(&ctx, "wave.json", "song.mp3").await.unwrap());
    }
}

#[tokio::test]
async fn delete_without_derivatives_succeeds_and_repeats_as_not_found() {
    let ctx = OperationContext::new();
    for backend in backends().await {
        let storage = &backend.storage;
        storage
            .upload(&ctx, "song.mp3", Bytes::from_static(b"source"))
            .await
            .unwrap();

        storage.delete(&ctx, "song.mp3").await.unwrap();

        let err = storage.delete(&ctx, "song.mp3").await.unwrap_err();
        assert!(err.is_not_found(), "{}: {}", backend.name, err);
    }
}

#[tokio::test]
async fn delete_retry_after_derivatives_removed() {
    let ctx = OperationContext::new();
    for backend in backends().await {
        let storage = &backend.storage;
        storage
            .upload(&ctx, "song.mp3", Bytes::from_static(b"source"))
            .await
            .unwrap();
        storage
            .upload_linked(&ctx, "thumb.png", "song.mp3", Bytes::from_static(b"thumb"))
            .await
            .unwrap();

        // Simulates an interrupted cascade: derivatives gone, source intact.
        storage
            .delete_cache(&ctx, "thumb.png", "song.mp3")
            .await
            .unwrap();
        assert!(storage.exists(&ctx, "song.mp3").await.unwrap());

        storage.delete(&ctx, "song.mp3").await.unwrap();
        assert!(!storage.exists(&ctx, "song.mp3").await.unwrap(), "{}", backend.name);
    }
}

#[tokio::test]
async fn delete_cache_removes_only_its_target() {
    let ctx = OperationContext::new();
    for backend in backends().await {
        let storage = &backend.storage;
        storage
            .upload(&ctx, "song.mp3", Bytes::from_static(b"source"))
            .await
            .unwrap();
        storage
            .upload_linked(&ctx, "thumb.png", "song.mp3", Bytes::from_static(b"thumb"))
            .await
            .unwrap();
        storage
            .upload_linked(&ctx, "wave.json", "song.mp3", Bytes::from_static(b"[]"))
            .await
            .unwrap();

        storage
            .delete_cache(&ctx, "thumb.png", "song.mp3")
            .await
            .unwrap();

        assert!(!storage.exists_linked(&ctx, "thumb.png", "song.mp3").await.unwrap());
        assert_eq!(
            storage.get_linked(&ctx, "wave.json", "song.mp3").await.unwrap().as_ref(),
            b"[]",
            "{}",
            backend.name
        );
        assert_eq!(storage.get(&ctx, "song.mp3").await.unwrap().as_ref(), b"source");

        let err = storage
            .delete_cache(&ctx, "thumb.png", "song.mp3")
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{}: {}", backend.name, err);
    }
}

#[tokio::test]
async fn sources_sharing_a_stem_share_derivatives() {
    let ctx = OperationContext::new();
    for backend in backends().await {
        let storage = &backend.storage;
        storage
            .upload_linked(&ctx, "thumb.png", "a.mp3", Bytes::from_static(b"thumb"))
            .await
            .unwrap();

        assert!(
            storage.exists_linked(&ctx, "thumb.png", "a.wav").await.unwrap(),
            "{}",
            backend.name
        );
    }
}

#[tokio::test]
async fn invalid_keys_are_rejected() {
    let ctx = OperationContext::new();
    for backend in backends().await {
        let storage = &backend.storage;
        for key in ["", "/abs.mp3", "dir/", "../escape.mp3", "a//b", "..x.mp3"] {
            let result = storage.upload(&ctx, key, Bytes::from_static(b"x")).await;
            assert!(
                matches!(result, Err(StorageError::InvalidKey(_))),
                "{}: {:?} accepted",
                backend.name,
                key
            );
        }
    }
}

#[tokio::test]
async fn expired_deadline_aborts_before_writing() {
    let expired = OperationContext::new().with_timeout(std::time::Duration::ZERO);
    let ctx = OperationContext::new();

    for backend in backends().await {
        let storage = &backend.storage;
        let result = storage
            .upload(&expired, "song.mp3", Bytes::from_static(b"x"))
            .await;
        assert!(
            matches!(result, Err(StorageError::DeadlineExceeded)),
            "{}",
            backend.name
        );
        assert!(!storage.exists(&ctx, "song.mp3").await.unwrap(), "{}", backend.name);
    }
}

#[tokio::test]
async fn local_layout_matches_sharding_rule() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");
    let storage = LocalStorage::new(&root).await.unwrap();
    let ctx = OperationContext::new();

    storage
        .upload(&ctx, "ab1234/song.mp3", Bytes::from_static(b"id3"))
        .await
        .unwrap();

    assert!(root.join("ab/12/34/ab1234/song.mp3").is_file());
}

#[tokio::test]
async fn delete_of_short_stem_keeps_keys_bucketed_under_its_group() {
    let ctx = OperationContext::new();
    for backend in backends().await {
        let storage = &backend.storage;
        for key in ["ab.mp3", "abab.wav", "abab12.flac", "abab12/cover.jpg"] {
            storage.upload(&ctx, key, Bytes::from_static(b"x")).await.unwrap();
        }
        storage
            .upload_linked(&ctx, "thumb.png", "ab.mp3", Bytes::from_static(b"t"))
            .await
            .unwrap();

        storage.delete(&ctx, "ab.mp3").await.unwrap();

        assert!(!storage.exists(&ctx, "ab.mp3").await.unwrap(), "{}", backend.name);
        assert!(!storage.exists_linked(&ctx, "thumb.png", "ab.mp3").await.unwrap());
        for key in ["abab.wav", "abab12.flac", "abab12/cover.jpg"] {
            assert!(
                storage.exists(&ctx, key).await.unwrap(),
                "{}: {} removed by cascade",
                backend.name,
                key
            );
        }
    }
}

#[tokio::test]
async fn short_key_file_blocks_longer_keys_on_filesystem_only() {
    let ctx = OperationContext::new();
    for backend in backends().await {
        let storage = &backend.storage;
        storage.upload(&ctx, "ab", Bytes::from_static(b"short")).await.unwrap();

        let result = storage.upload(&ctx, "abab.wav", Bytes::from_static(b"long")).await;
        match backend.name {
            "local" => {
                assert!(matches!(result, Err(StorageError::Conflict(_))), "{:?}", result);
                assert!(!storage.exists(&ctx, "abab.wav").await.unwrap());
                assert!(storage.get(&ctx, "abab.wav").await.unwrap_err().is_not_found());
                assert!(storage.delete(&ctx, "abab.wav").await.unwrap_err().is_not_found());
            }
            _ => {
                result.unwrap();
                assert_eq!(storage.get(&ctx, "abab.wav").await.unwrap().as_ref(), b"long");
            }
        }

        assert_eq!(storage.get(&ctx, "ab").await.unwrap().as_ref(), b"short", "{}", backend.name);
    }
}

#[tokio::test]
async fn plain_key_over_derivative_group_conflicts_on_filesystem_only() {
    let ctx = OperationContext::new();
    for backend in backends().await {
        let storage = &backend.storage;
        storage
            .upload_linked(&ctx, "thumb.png", "song.mp3", Bytes::from_static(b"t"))
            .await
            .unwrap();

        assert!(!storage.exists(&ctx, "song").await.unwrap(), "{}", backend.name);
        let result = storage.upload(&ctx, "song", Bytes::from_static(b"plain")).await;
        match backend.name {
            "local" => {
                assert!(matches!(result, Err(StorageError::Conflict(_))), "{:?}", result);
                assert!(storage.get(&ctx, "song").await.unwrap_err().is_not_found());
            }
            _ => result.unwrap(),
        }
        assert!(storage.exists_linked(&ctx, "thumb.png", "song.mp3").await.unwrap());
    }
}
