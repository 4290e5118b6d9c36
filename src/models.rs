// src/models.rs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Identifier assigned to a job at submission time.
pub type JobId = u64;

/// What the engine should produce for this job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Mode {
    Video,
    Audio,
}

/// Immutable per-job configuration, snapshotted at submission.
///
/// Owned exclusively by the job; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Directory finished files are moved into.
    pub destination_dir: PathBuf,
    /// Staging directory for in-flight transfers.
    pub temp_dir: PathBuf,
    pub mode: Mode,
    /// Ordered format/quality ladder. Index 0 is the preferred hint; the
    /// rest are fallbacks consumed one per attempt when the engine reports
    /// the requested format as unavailable. Empty means engine default.
    pub formats: Vec<String>,
    /// Transfer rate cap in bytes per second. `None` means unlimited.
    pub rate_limit: Option<u64>,
    /// Ceiling on transfer attempts before the job fails.
    pub max_attempts: u32,
    /// Optional per-job deadline, enforced through the cancellation token.
    pub timeout: Option<Duration>,
    /// Whether this job was expanded out of a playlist. Passthrough only.
    pub playlist_member: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            destination_dir: PathBuf::new(),
            temp_dir: PathBuf::new(),
            mode: Mode::Video,
            formats: Vec::new(),
            rate_limit: None,
            max_attempts: 10,
            timeout: None,
            playlist_member: false,
        }
    }
}

/// Lifecycle state of a download job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    Queued,
    FetchingMetadata,
    AwaitingDecision,
    Transferring,
    Finalizing,
    Succeeded,
    Skipped,
    Cancelled,
    Failed,
}

impl JobState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Skipped | JobState::Cancelled | JobState::Failed
        )
    }
}

/// Why a cancelled job stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CancelReason {
    User,
    Timeout,
}

/// Structured category attached to a failed outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    NotFound,
    Unavailable,
    Network,
    RateLimited,
    AuthStale,
    FormatUnavailable,
    AttemptsExhausted,
    CannotOverwrite,
    MoveFailed,
    Contract,
    Unknown,
}

/// Terminal result of a job, delivered exactly once on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Outcome {
    Succeeded { final_path: PathBuf },
    Skipped,
    Cancelled(CancelReason),
    Failed { kind: FailureKind, message: String },
}

impl Outcome {
    pub fn state(&self) -> JobState {
        match self {
            Outcome::Succeeded { .. } => JobState::Succeeded,
            Outcome::Skipped => JobState::Skipped,
            Outcome::Cancelled(_) => JobState::Cancelled,
            Outcome::Failed { .. } => JobState::Failed,
        }
    }
}

/// One requested download, tracked end-to-end by the controller.
///
/// While running, a job is mutated only by the single worker executing it;
/// everyone else sees clones handed out by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Opaque target identifier. Never parsed by the core.
    pub target: String,
    pub config: JobConfig,
    pub state: JobState,
    /// Human-readable label, populated once metadata fetch succeeds.
    pub title: Option<String>,
    /// Fraction in [0, 1], non-decreasing within a single attempt.
    pub progress: f64,
    /// Transfer attempts made so far.
    pub attempts: u32,
    pub expected_final_path: Option<PathBuf>,
    /// Set once the user grants an overwrite; retries never re-prompt.
    pub overwrite_authorized: bool,
    pub outcome: Option<Outcome>,
}

impl Job {
    pub fn new(id: JobId, target: String, config: JobConfig) -> Self {
        Self {
            id,
            target,
            config,
            state: JobState::Queued,
            title: None,
            progress: 0.0,
            attempts: 0,
            expected_final_path: None,
            overwrite_authorized: false,
            outcome: None,
        }
    }

    /// Records the title the first time it is learned. Later fetches during
    /// retry attempts are idempotent no-ops.
    pub fn set_title(&mut self, title: &str) -> bool {
        if self.title.is_some() {
            return false;
        }
        self.title = Some(title.to_string());
        true
    }

    /// Starts a new attempt: bumps the counter and resets progress to zero.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.progress = 0.0;
    }

    /// Clamps progress to be monotonically non-decreasing within an attempt.
    pub fn record_progress(&mut self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction > self.progress {
            self.progress = fraction;
        }
    }

    /// Moves the job into the terminal state implied by `outcome`.
    pub fn finish(&mut self, outcome: Outcome) {
        self.state = outcome.state();
        self.outcome = Some(outcome);
    }
}
