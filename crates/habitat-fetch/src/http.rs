//! The http fetcher: download, verify, decompress, materialize.

use crate::http_client::HttpClient;
use crate::{blocking, FetchError, Fetcher};
use async_trait::async_trait;
use habitat_cache::ArtifactCache;
use habitat_fs::{archive::extract_archive, create_temp_dir, move_path, rmtree};
use habitat_types::settings::FILE_PART_SIZE;
use habitat_types::{HttpSpec, SyncOptions};
use indicatif::ProgressBar;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct HttpFetcher {
    name: String,
    target_dir: PathBuf,
    spec: HttpSpec,
}

impl HttpFetcher {
    pub fn new(name: impl Into<String>, target_dir: impl Into<PathBuf>, spec: HttpSpec) -> Self {
        Self {
            name: name.into(),
            target_dir: target_dir.into(),
            spec,
        }
    }

    async fn download(
        &self,
        client: &HttpClient,
        file_path: &Path,
    ) -> Result<(), FetchError> {
        let url = self.spec.url.clone();
        let head = client.head(&url).await?;

        if head.accepts_ranges {
            if let Some(size) = head.content_length {
                return self.download_parts(client, &url, size, file_path).await;
            }
        }
        // Without a usable HEAD there is no length to chunk against.
        let data = client.get_all(&url).await?;
        std::fs::write(file_path, data)?;
        Ok(())
    }

    async fn download_parts(
        &self,
        client: &HttpClient,
        url: &str,
        size: u64,
        file_path: &Path,
    ) -> Result<(), FetchError> {
        let progress = ProgressBar::new(size);
        progress.set_message(format!("Download {}", self.name));

        let mut parts = Vec::new();
        let mut start = 0u64;
        while start < size {
            let len = FILE_PART_SIZE.min(size - start);
            parts.push((start, start + len - 1));
            start += len;
        }
        debug!("download {url} in {} parts", parts.len());

        let chunks = futures::future::try_join_all(parts.into_iter().map(|(start, end)| {
            let client = client.clone();
            let url = url.to_string();
            let progress = progress.clone();
            async move {
                let data = client.get_range(&url, start, end, 2).await?;
                progress.inc(data.len() as u64);
                Ok::<_, FetchError>(data)
            }
        }))
        .await?;

        let mut file = std::fs::File::create(file_path)?;
        for chunk in chunks {
            file.write_all(&chunk)?;
        }
        progress.finish_and_clear();
        Ok(())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        _root_dir: &Path,
        options: &SyncOptions,
    ) -> Result<Vec<PathBuf>, FetchError> {
        let target_dir = self.target_dir.clone();
        let url = self.spec.url.clone();
        info!(
            "{} will be downloaded to path {}, the operation will {}override existing files",
            self.name,
            target_dir.display(),
            if options.force { "" } else { "not " }
        );

        let parent = target_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)?;
        if target_dir.exists() {
            if !options.force {
                info!("{} existed, skip fetching", target_dir.display());
                return Ok(vec![target_dir]);
            }
            if target_dir.is_dir() {
                let existing = target_dir.clone();
                blocking(move || rmtree(&existing).map_err(Into::into)).await?;
            } else {
                std::fs::remove_file(&target_dir)?;
            }
        }

        let cache = if options.disable_cache {
            ArtifactCache::disabled()
        } else {
            ArtifactCache::new(&options.cache_dir)
        };

        let file_name = file_name_of(&url);
        let temp_dir = create_temp_dir(&parent, "HTTP")?;
        let file_path = temp_dir.join(file_name);

        // The cache key is the dependency's url; a hit skips the network
        // entirely.
        match cache.get(&url) {
            Some(cached) => {
                debug!("artifact cache hit for {url}");
                std::fs::copy(&cached, &file_path)?;
            }
            None => {
                let client = HttpClient::new(options.runtime.http_concurrency)?;
                self.download(&client, &file_path).await?;
            }
        }

        if let Some(expected) = &self.spec.sha256 {
            let expected = expected.to_ascii_lowercase();
            let path = file_path.clone();
            let actual = blocking(move || sha256_of(&path)).await?;
            if actual != expected {
                return Err(FetchError::Integrity { url });
            }
        }
        cache.put(&url, &file_path)?;

        let paths = self.spec.paths.clone();
        let is_single_file = !self.spec.decompress;
        if self.spec.decompress {
            let (src, dst, filter) = (file_path.clone(), temp_dir.clone(), paths.clone());
            blocking(move || extract_archive(&src, &dst, &filter).map_err(Into::into)).await?;
        }

        let result = {
            let (temp, target) = (temp_dir.clone(), target_dir.clone());
            blocking(move || {
                if paths.is_empty() {
                    move_into_target(&temp, &target, is_single_file)?;
                } else if paths.len() == 1 {
                    move_into_target(&temp.join(&paths[0]), &target, false)?;
                } else {
                    std::fs::create_dir_all(&target).map_err(FetchError::Io)?;
                    // Each selected subtree gets the same lone-directory
                    // flatten as a whole archive.
                    for path in &paths {
                        move_into_target(&temp.join(path), &target, false)?;
                    }
                }
                Ok(())
            })
            .await
        };
        let _ = rmtree(&temp_dir);
        result?;

        Ok(vec![target_dir])
    }
}

/// Move extracted content onto the target, flattening a lone top-level
/// directory (or the downloaded file itself in no-decompress mode).
fn move_into_target(
    temp_dir: &Path,
    target_dir: &Path,
    is_single_file: bool,
) -> Result<(), FetchError> {
    let entries: Vec<PathBuf> = std::fs::read_dir(temp_dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    if entries.len() == 1 && (entries[0].is_dir() || is_single_file) {
        move_path(&entries[0], target_dir)?;
    } else {
        move_path(temp_dir, target_dir)?;
    }
    Ok(())
}

fn file_name_of(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}

fn sha256_of(path: &Path) -> Result<String, FetchError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
