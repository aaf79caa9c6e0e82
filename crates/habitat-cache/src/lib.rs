//! Caches: the per-repository entries cache and the global artifact cache.
//!
//! The entries cache records the source stamp every node resolved to, as a
//! JSON blob stored in the host repository's object database and referenced
//! by a `habitat_entries_<HEAD>` tag, so it travels with the repo without
//! touching the working tree.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const ENTRIES_CACHE_TAG_PREFIX: &str = "habitat_entries";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Git(#[from] habitat_git::GitError),
    #[error("failed to serialize entries cache: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The persisted `name -> source_stamp` table plus its integrity hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntriesCache {
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
    #[serde(default)]
    pub hash: String,
}

impl EntriesCache {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        let hash = stamp(&entries);
        Self { entries, hash }
    }

    /// A cache whose hash does not match its entries is treated as absent.
    pub fn is_valid(&self) -> bool {
        self.hash == stamp(&self.entries)
    }
}

/// md5 over the canonical JSON rendering of the sorted entries map.
pub fn stamp(entries: &BTreeMap<String, String>) -> String {
    let canonical = serde_json::to_string(entries).expect("string map serializes");
    hex_md5(canonical.as_bytes())
}

pub fn hex_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn entries_tag(head: &str) -> String {
    format!("{ENTRIES_CACHE_TAG_PREFIX}_{head}")
}

/// Load the entries cache recorded for the repository's current HEAD.
/// Returns an empty cache when the tag is missing or the hash check fails.
pub async fn load_entries_cache(root_dir: &Path) -> EntriesCache {
    let Ok(head) = habitat_git::head_commit_id(root_dir).await else {
        return EntriesCache::default();
    };
    let Some(blob) = habitat_git::read_tag_blob(root_dir, &entries_tag(&head)).await else {
        return EntriesCache::default();
    };
    let Ok(cache) = serde_json::from_str::<EntriesCache>(&blob) else {
        debug!("entries cache is not parseable, try a complete synchronization");
        return EntriesCache::default();
    };
    if !cache.is_valid() {
        debug!("entries cache is broken, try a complete synchronization");
        return EntriesCache::default();
    }
    cache
}

/// Persist the entries cache as a blob tagged onto the current HEAD.
pub async fn store_entries_cache(root_dir: &Path, cache: &EntriesCache) -> Result<(), CacheError> {
    let head = habitat_git::head_commit_id(root_dir).await?;
    let temp_file = root_dir.join(format!(".habitat_entries_{head}"));
    debug!("writing entries cache: {cache:?}");
    let payload = serde_json::to_string(cache)?;
    std::fs::write(&temp_file, payload).map_err(|source| CacheError::Io {
        path: temp_file.display().to_string(),
        source,
    })?;
    let result = async {
        let sha = habitat_git::hash_object_write(root_dir, &temp_file).await?;
        habitat_git::force_tag(root_dir, &entries_tag(&head), &sha).await?;
        Ok(())
    }
    .await;
    let _ = std::fs::remove_file(&temp_file);
    result
}

/// Drop the entries cache tag for the current HEAD, if present.
pub async fn clean_entries_cache(root_dir: &Path) -> Result<bool, CacheError> {
    let head = habitat_git::head_commit_id(root_dir).await?;
    let tag = entries_tag(&head);
    if !habitat_git::tag_exists(root_dir, &tag).await {
        return Ok(false);
    }
    habitat_git::delete_tag(root_dir, &tag).await?;
    Ok(true)
}

/// On-disk cache of downloaded artifacts, keyed by URL.
///
/// `https://www.example.com/test/file.zip` lands at
/// `<dir>/www.example.com/test/file.zip`.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: Option<PathBuf>,
}

impl ArtifactCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: Some(cache_dir.join("objects")),
        }
    }

    /// A cache that stores nothing and finds nothing.
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    /// Relative cache key for a URL: host plus path, scheme dropped.
    pub fn key_for(url: &str) -> PathBuf {
        if let Ok(parsed) = url::Url::parse(url) {
            let mut key = PathBuf::new();
            if let Some(host) = parsed.host_str() {
                key.push(host);
            }
            for segment in parsed.path_segments().into_iter().flatten() {
                if !segment.is_empty() {
                    key.push(segment);
                }
            }
            key
        } else {
            url.split('/').filter(|s| !s.is_empty()).collect()
        }
    }

    pub fn get(&self, url: &str) -> Option<PathBuf> {
        let path = self.dir.as_ref()?.join(Self::key_for(url));
        path.exists().then_some(path)
    }

    pub fn put(&self, url: &str, file: &Path) -> Result<(), CacheError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let cache_path = dir.join(Self::key_for(url));
        if cache_path.exists() {
            return Ok(());
        }
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::copy(file, &cache_path).map_err(|source| CacheError::Io {
            path: cache_path.display().to_string(),
            source,
        })?;
        debug!("stored {} into artifact cache", cache_path.display());
        Ok(())
    }
}
