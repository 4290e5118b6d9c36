// src/engine.rs

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::JobConfig;

/// Errors from a side-effect-free metadata fetch.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("target not found")]
    NotFound,
    #[error("target unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited by remote")]
    RateLimited,
    #[error("stale session or auth state: {0}")]
    AuthStale(String),
    #[error("metadata fetch failed: {0}")]
    Unknown(String),
}

/// Errors from a transfer attempt.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited by remote")]
    RateLimited,
    #[error("requested format unavailable: {0}")]
    FormatUnavailable(String),
    #[error("stale session or auth state: {0}")]
    AuthStale(String),
    #[error("transfer aborted")]
    Aborted,
    #[error("transfer failed: {0}")]
    Unknown(String),
}

/// Provisional item description returned before any bytes move.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub title: String,
    /// Output file name the engine will produce for this target under the
    /// job's config. The expected final path is this name joined onto the
    /// configured destination directory.
    pub output_filename: String,
}

/// Phase reported alongside transfer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Downloading,
    Merging,
    Postprocessing,
}

/// One progress callback payload. `bytes_total` may be unknown; consumers
/// must report an indeterminate status instead of dividing.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub phase: TransferPhase,
}

impl Progress {
    /// Completed fraction in [0, 1], or `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_total {
            Some(total) if total > 0 => Some((self.bytes_done as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

/// Progress sink handed to the engine for the duration of one transfer.
pub type ProgressFn = Box<dyn Fn(Progress) + Send + Sync>;

/// Uniform capability wrapping the external download engine.
///
/// Implementations must guarantee that once `cancel` fires no byte-complete
/// output is silently committed outside the staging area. Cancellation is
/// cooperative: an engine without fine-grained abort hooks may take
/// arbitrarily long to actually stop after the token fires.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Fetches the provisional title and output file name for a target.
    /// Writes no bytes.
    async fn fetch_metadata(
        &self,
        target: &str,
        config: &JobConfig,
    ) -> Result<Metadata, MetadataError>;

    /// Runs a full transfer, streaming the artifact into `staging_path`
    /// (inside the job's temp directory) and invoking `on_progress` zero or
    /// more times. `format` is the quality hint selected for this attempt.
    async fn transfer(
        &self,
        target: &str,
        config: &JobConfig,
        format: Option<&str>,
        staging_path: &Path,
        on_progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError>;

    /// Invalidates any cached session/auth state. Invoked by the retry
    /// policy before retrying an auth-staleness failure.
    async fn clear_cache(&self) {}
}
