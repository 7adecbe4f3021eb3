//! Key sharding and derivative key resolution shared by all backends.
//!
//! A logical key is stored at `bucket/[bucket/[bucket/]]key`, where each bucket
//! is a two-character slice of the key's shard seed. The seed is the key itself,
//! or its leading directory component when the key already encodes a
//! source/derivative pair (`stem/derivative`), so derivatives are bucketed with
//! their source and live under a single directory or prefix.
//!
//! Keys must not be empty, start or end with `/`, or contain empty, `.` or `..`
//! segments. A seed starting with `..` is rejected too, since its first bucket
//! would be `..`.

use crate::traits::{StorageError, StorageResult};
use std::path::{Path, PathBuf};

pub const SEPARATOR: char = '/';

const BUCKET_WIDTH: usize = 2;
const MAX_BUCKETS: usize = 3;

/// Reject keys that could escape the namespace or name a directory.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("Storage key is empty".to_string()));
    }
    if key.starts_with(SEPARATOR) || key.ends_with(SEPARATOR) {
        return Err(StorageError::InvalidKey(format!(
            "Storage key must not start or end with a separator: {}",
            key
        )));
    }
    if key
        .split(SEPARATOR)
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::InvalidKey(format!(
            "Storage key contains an invalid segment: {}",
            key
        )));
    }
    if shard_seed(key).starts_with("..") {
        return Err(StorageError::InvalidKey(format!(
            "Storage key would shard outside the namespace: {}",
            key
        )));
    }
    Ok(())
}

/// The part of `key` the buckets are cut from.
pub fn shard_seed(key: &str) -> &str {
    match key.split_once(SEPARATOR) {
        Some((leading, _)) => leading,
        None => key,
    }
}

/// Bucket segments for `key`, at most three of at most two characters each.
fn buckets(key: &str) -> Vec<String> {
    let seed: Vec<char> = shard_seed(key).chars().collect();
    let slice = |level: usize| -> String {
        seed[level * BUCKET_WIDTH..(level + 1) * BUCKET_WIDTH]
            .iter()
            .collect()
    };

    match seed.len() {
        // Too short to split: the whole seed is the bucket.
        n if n < 3 => vec![seed.iter().collect()],
        3 => vec![slice(0)],
        4 | 5 => vec![slice(0), slice(1)],
        _ => (0..MAX_BUCKETS).map(slice).collect(),
    }
}

/// Sharded location of `key`, relative to a backend's base.
pub fn shard(key: &str) -> String {
    let mut segments = buckets(key);
    segments.push(key.to_string());
    segments.join("/")
}

/// Sharded filesystem path of `key` under `base`.
pub fn shard_path(base: &Path, key: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for segment in shard(key).split(SEPARATOR) {
        path.push(segment);
    }
    path
}

/// Sharded object key of `key` under an object-store key prefix.
pub fn shard_prefixed(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_matches(SEPARATOR);
    if prefix.is_empty() {
        shard(key)
    } else {
        format!("{}/{}", prefix, shard(key))
    }
}

/// Whether the sharded location of `key` is also the sharded location of a
/// different key.
///
/// Short group stems bucket onto the same directories as longer keys:
/// `ab/.w/abab.wav` and `abab.wav` are both stored at `ab/ab/.w/abab.wav`.
pub fn location_is_shared(key: &str) -> bool {
    let location = shard(key);
    let segments: Vec<&str> = location.split(SEPARATOR).collect();

    (0..segments.len()).any(|start| {
        let candidate = segments[start..].join("/");
        candidate != key && validate_key(&candidate).is_ok() && shard(&candidate) == location
    })
}

/// Basename of `source_key` without its last extension.
///
/// Trailing separators are ignored and a leading dot is part of the name, so
/// `album/song.mp3` → `song`, `archive.tar.gz` → `archive.tar`,
/// `README` → `README`, `.hidden` → `.hidden`.
pub fn stem(source_key: &str) -> &str {
    let trimmed = source_key.trim_end_matches(SEPARATOR);
    let base = match trimmed.rsplit_once(SEPARATOR) {
        Some((_, base)) => base,
        None => trimmed,
    };
    match base.rfind('.') {
        None | Some(0) => base,
        Some(idx) => &base[..idx],
    }
}

/// Stem under which the derivatives of `source_key` are grouped, if it can
/// name a group at all.
pub fn derivative_group(source_key: &str) -> Option<&str> {
    match stem(source_key) {
        "" | "." | ".." => None,
        group => Some(group),
    }
}

/// Composite key of a derivative: `stem(source_key)/derivative_key`.
pub fn derive_key(derivative_key: &str, source_key: &str) -> StorageResult<String> {
    validate_key(derivative_key)?;
    let group = derivative_group(source_key).ok_or_else(|| {
        StorageError::InvalidKey(format!(
            "Source key has no usable name stem: {}",
            source_key
        ))
    })?;
    Ok(format!("{}{}{}", group, SEPARATOR, derivative_key))
}
