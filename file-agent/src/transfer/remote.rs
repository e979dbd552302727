//! Remote downloads into the agent's scratch space.

use super::progress::ProgressTracker;
use crate::fs::path::validate_name;
use crate::utils::errors::{AgentError, Result};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const FALLBACK_FILE_NAME: &str = "download";

/// A downloaded file, waiting to be placed by the caller.
#[derive(Debug)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    scratch_dir: PathBuf,
}

impl DownloadedFile {
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.scratch_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove download dir {}: {}", self.scratch_dir.display(), e);
            }
        }
    }
}

pub struct RemoteFetcher {
    client: reqwest::Client,
    temp_dir: PathBuf,
    default_timeout: Duration,
}

impl RemoteFetcher {
    pub fn new(temp_dir: PathBuf, default_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            temp_dir,
            default_timeout,
        }
    }

    /// Download `url` into a private scratch directory.
    ///
    /// The whole transfer, headers and body, is bounded by `timeout` (or the
    /// configured default). Timeouts, connection failures and 5xx answers
    /// are reported as retryable.
    pub async fn fetch(&self, url: &str, timeout: Option<Duration>) -> Result<DownloadedFile> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| AgentError::InvalidArgument(format!("invalid url {}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AgentError::InvalidArgument(format!(
                "unsupported url scheme: {}",
                parsed.scheme()
            )));
        }

        let file_name = file_name_from_url(&parsed);
        let scratch_dir = self.temp_dir.join(format!("download-{}", uuid::Uuid::new_v4()));
        let path = scratch_dir.join(&file_name);
        let timeout = timeout.unwrap_or(self.default_timeout);

        tokio::fs::create_dir_all(&scratch_dir).await?;
        let result = tokio::time::timeout(timeout, self.stream_to(parsed, &path)).await;

        let size = match result {
            Ok(Ok(size)) => size,
            Ok(Err(e)) => {
                let _ = tokio::fs::remove_dir_all(&scratch_dir).await;
                return Err(e);
            }
            Err(_) => {
                let _ = tokio::fs::remove_dir_all(&scratch_dir).await;
                return Err(AgentError::Download {
                    message: format!("timed out after {}s: {}", timeout.as_secs_f64(), url),
                    retryable: true,
                });
            }
        };

        Ok(DownloadedFile {
            path,
            file_name,
            size,
            scratch_dir,
        })
    }

    async fn stream_to(&self, url: reqwest::Url, dest: &std::path::Path) -> Result<u64> {
        let response = self.client.get(url.clone()).send().await.map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Download {
                message: format!("HTTP {}: {}", status, url),
                retryable: status.is_server_error(),
            });
        }

        let mut tracker = ProgressTracker::new(response.content_length());
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(request_error)?;
            file.write_all(&chunk).await?;
            if tracker.advance(chunk.len() as u64) {
                info!("Downloading {}: {}", url, tracker.summary());
            }
        }
        file.flush().await?;

        info!("Downloaded {}: {}", url, tracker.summary());
        Ok(tracker.transferred_bytes())
    }
}

fn request_error(e: reqwest::Error) -> AgentError {
    AgentError::Download {
        retryable: e.is_timeout() || e.is_connect() || e.is_body(),
        message: e.to_string(),
    }
}

/// Last non-empty path segment of `url`, or a fixed fallback.
pub fn file_name_from_url(url: &reqwest::Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.rev().find(|s| !s.is_empty()))
        .map(|s| s.to_string())
        .filter(|s| validate_name(s).is_ok())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}
