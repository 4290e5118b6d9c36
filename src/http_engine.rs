// src/http_engine.rs

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    Engine, Metadata, MetadataError, Progress, ProgressFn, TransferError, TransferPhase,
};
use crate::limiter::RateLimiter;
use crate::models::{JobConfig, Mode};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";

/// Engine for targets that are plain HTTP(S) media URLs: one streaming GET,
/// staged into the temp directory, no merging or postprocessing phases.
///
/// Format hints are ignored; a direct URL has exactly one representation.
pub struct HttpEngine {
    client: Client,
    request_timeout: Duration,
}

impl HttpEngine {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Output name derived from the URL's last path segment. The engine owns
    /// naming; the controller only joins it onto the destination directory.
    fn output_filename(target: &str, mode: Mode) -> String {
        let trimmed = target
            .split(['?', '#'])
            .next()
            .unwrap_or(target)
            .trim_end_matches('/');
        let rest = trimmed
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(trimmed);
        let segment = match rest.split_once('/') {
            Some((_, path)) => path.rsplit('/').next().unwrap_or(""),
            None => "",
        };
        if segment.is_empty() {
            return match mode {
                Mode::Video => "download.mp4".to_string(),
                Mode::Audio => "download.mp3".to_string(),
            };
        }
        segment.to_string()
    }

    fn metadata_error(status: StatusCode) -> MetadataError {
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => MetadataError::NotFound,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                MetadataError::AuthStale(format!("remote answered {status}"))
            }
            StatusCode::TOO_MANY_REQUESTS => MetadataError::RateLimited,
            s if s.is_server_error() => MetadataError::Unavailable(format!("remote answered {s}")),
            s => MetadataError::Unknown(format!("unexpected status {s}")),
        }
    }

    fn transfer_error(status: StatusCode) -> TransferError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                TransferError::AuthStale(format!("remote answered {status}"))
            }
            StatusCode::TOO_MANY_REQUESTS => TransferError::RateLimited,
            s if s.is_server_error() => TransferError::Network(format!("remote answered {s}")),
            s => TransferError::Unknown(format!("unexpected status {s}")),
        }
    }
}

impl Default for HttpEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for HttpEngine {
    async fn fetch_metadata(
        &self,
        target: &str,
        config: &JobConfig,
    ) -> Result<Metadata, MetadataError> {
        let resp = self
            .client
            .head(target)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| MetadataError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::metadata_error(resp.status()));
        }

        let output_filename = Self::output_filename(target, config.mode);
        let title = Path::new(&output_filename)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| output_filename.clone());
        Ok(Metadata {
            title,
            output_filename,
        })
    }

    async fn transfer(
        &self,
        target: &str,
        config: &JobConfig,
        _format: Option<&str>,
        staging_path: &Path,
        on_progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let resp = self
            .client
            .get(target)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::transfer_error(resp.status()));
        }
        let total = resp.content_length();

        if let Some(parent) = staging_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::Unknown(format!("cannot create temp dir: {e}")))?;
        }
        let mut file = tokio::fs::File::create(staging_path)
            .await
            .map_err(|e| TransferError::Unknown(format!("cannot create staging file: {e}")))?;

        let limiter = match config.rate_limit {
            Some(rate) => RateLimiter::new(rate),
            None => RateLimiter::unlimited(),
        };

        let mut done: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            // Partial bytes stay in the staging area; the caller cleans up.
            if cancel.is_cancelled() {
                return Err(TransferError::Aborted);
            }
            let bytes = chunk.map_err(|e| TransferError::Network(e.to_string()))?;
            limiter.acquire(bytes.len() as u64).await;
            file.write_all(&bytes)
                .await
                .map_err(|e| TransferError::Unknown(format!("staging write failed: {e}")))?;
            done += bytes.len() as u64;
            on_progress(Progress {
                bytes_done: done,
                bytes_total: total,
                phase: TransferPhase::Downloading,
            });
        }
        file.flush()
            .await
            .map_err(|e| TransferError::Unknown(format!("staging flush failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_comes_from_last_path_segment() {
        assert_eq!(
            HttpEngine::output_filename("https://cdn.example.com/media/clip.mp4?sig=abc", Mode::Video),
            "clip.mp4"
        );
        assert_eq!(
            HttpEngine::output_filename("https://cdn.example.com/a/b/track.opus#frag", Mode::Audio),
            "track.opus"
        );
    }

    #[test]
    fn bare_host_falls_back_to_mode_default() {
        assert_eq!(
            HttpEngine::output_filename("https://example.com/", Mode::Video),
            "download.mp4"
        );
        assert_eq!(
            HttpEngine::output_filename("https://example.com", Mode::Audio),
            "download.mp3"
        );
    }
}
