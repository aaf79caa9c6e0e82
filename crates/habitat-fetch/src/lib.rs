//! Protocol fetchers.
//!
//! Every node kind acquires its contents through the [`Fetcher`] trait:
//! `fetch` suspends on subprocess and network I/O and returns the absolute
//! paths it materialized, which downstream local mirrors replicate.

use async_trait::async_trait;
use habitat_types::SyncOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

mod action;
mod git;
mod http;
mod http_client;

pub use action::ActionFetcher;
pub use git::GitFetcher;
pub use http::HttpFetcher;
pub use http_client::HttpClient;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Git(#[from] habitat_git::GitError),
    #[error(transparent)]
    Fs(#[from] habitat_fs::FsError),
    #[error(transparent)]
    Cache(#[from] habitat_cache::CacheError),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("got a status code {status} when downloading {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("failed to download part {start}..{end} of {url}: {source}")]
    ChunkFailed {
        url: String,
        start: u64,
        end: u64,
        #[source]
        source: Box<FetchError>,
    },
    #[error("{url}'s sha256 does not match the downloaded content")]
    Integrity { url: String },
    #[error("invalid patch pattern {pattern}: {reason}")]
    BadPatchPattern { pattern: String, reason: String },
    #[error("{output}\nThis might be caused by conflicts between patches and code.")]
    PatchFailed { output: String },
    #[error("failed to pull lfs objects: {source}. This may be caused by not installing git lfs")]
    LfsPull {
        #[source]
        source: habitat_git::GitError,
    },
    #[error("command {command:?} failed with {status} in {cwd:?}")]
    Command {
        command: String,
        status: String,
        cwd: PathBuf,
    },
    #[error("background task failed: {0}")]
    Join(String),
}

/// Uniform contract for acquiring a node's contents.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Materialize the node under its target directory and return the
    /// absolute paths created on the local filesystem.
    async fn fetch(&self, root_dir: &Path, options: &SyncOptions)
        -> Result<Vec<PathBuf>, FetchError>;
}

/// Fallback for unrecognized configurations: logs and fetches nothing.
pub struct DummyFetcher {
    pub name: String,
}

#[async_trait]
impl Fetcher for DummyFetcher {
    async fn fetch(
        &self,
        _root_dir: &Path,
        _options: &SyncOptions,
    ) -> Result<Vec<PathBuf>, FetchError> {
        warn!("unsupported dependency config {}, skip", self.name);
        Ok(Vec::new())
    }
}

/// Run blocking filesystem work on the shared thread pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, FetchError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, FetchError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FetchError::Join(e.to_string()))?
}
