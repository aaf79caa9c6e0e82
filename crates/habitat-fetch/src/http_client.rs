//! Shared HTTP client.
//!
//! All requests in the process go through one reqwest client behind one
//! semaphore, so a wide fetch fan-out cannot exhaust sockets no matter how
//! many archives are chunk-downloaded at once.

use crate::FetchError;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

static HTTP_SEMAPHORE: OnceLock<Arc<Semaphore>> = OnceLock::new();

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(600);

/// What a HEAD probe learned about an artifact.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadInfo {
    pub accepts_ranges: bool,
    pub content_length: Option<u64>,
}

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

impl HttpClient {
    pub fn new(concurrency: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()?;
        let semaphore = HTTP_SEMAPHORE
            .get_or_init(|| Arc::new(Semaphore::new(concurrency.max(1))))
            .clone();
        Ok(Self { client, semaphore })
    }

    /// Probe whether the server supports ranged downloads. A failing HEAD
    /// is not an error; it just disables chunking.
    pub async fn head(&self, url: &str) -> Result<HeadInfo, FetchError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        debug!("send HEAD request to {url}");
        let response = match self.client.head(url).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => return Ok(HeadInfo::default()),
        };
        let accepts_ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .map(|v| v.as_bytes() == b"bytes")
            .unwrap_or(false);
        Ok(HeadInfo {
            accepts_ranges,
            content_length: response.content_length(),
        })
    }

    /// Download one `Range` chunk, retrying transient failures.
    pub async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
        retries: u32,
    ) -> Result<Vec<u8>, FetchError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        let mut remaining = retries + 1;
        loop {
            remaining -= 1;
            debug!("download part [{start}, {end}] of {url}");
            match self.try_get(url, Some((start, end))).await {
                Ok(data) => return Ok(data),
                Err(e) if remaining > 0 => {
                    warn!("got an exception: \"{e}\", retry");
                }
                Err(e) => {
                    return Err(FetchError::ChunkFailed {
                        url: url.to_string(),
                        start,
                        end,
                        source: Box::new(e),
                    })
                }
            }
        }
    }

    /// Plain full-body GET, for servers without range support.
    pub async fn get_all(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        self.try_get(url, None).await
    }

    async fn try_get(&self, url: &str, range: Option<(u64, u64)>) -> Result<Vec<u8>, FetchError> {
        let mut request = self.client.get(url);
        if let Some((start, end)) = range {
            request = request.header(reqwest::header::RANGE, format!("bytes={start}-{end}"));
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
