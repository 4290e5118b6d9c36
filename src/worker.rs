// src/worker.rs

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::collision::{CollisionResolver, Decision};
use crate::engine::{Engine, MetadataError, ProgressFn, TransferError};
use crate::events::{Event, EventBus};
use crate::finalize::{self, PathLocks};
use crate::models::{CancelReason, FailureKind, Job, JobState, Outcome};

/// Shared collaborators a worker needs to drive one job.
pub(crate) struct WorkerContext {
    pub engine: Arc<dyn Engine>,
    pub resolver: Arc<CollisionResolver>,
    pub path_locks: Arc<PathLocks>,
    pub bus: EventBus,
    pub cancel: CancellationToken,
    /// Set by the timeout watchdog so cancellation can be attributed.
    pub timed_out: Arc<AtomicBool>,
}

/// Locks a job, recovering from poisoning: job state must stay readable for
/// snapshots even if a worker panicked mid-update.
pub(crate) fn hold_job(job: &Mutex<Job>) -> MutexGuard<'_, Job> {
    job.lock().unwrap_or_else(|e| e.into_inner())
}

fn transition(job: &Mutex<Job>, ctx: &WorkerContext, state: JobState, status: &str) {
    let id = {
        let mut j = hold_job(job);
        j.state = state;
        j.id
    };
    tracing::debug!(job = id, ?state, status, "state transition");
    ctx.bus.publish(Event::Status {
        job: id,
        text: status.to_string(),
    });
}

/// Publishes the single terminal event for a job. Idempotent: a job already
/// in a terminal state is left untouched.
fn conclude(job: &Mutex<Job>, ctx: &WorkerContext, outcome: Outcome) {
    let id = {
        let mut j = hold_job(job);
        if j.state.is_terminal() {
            return;
        }
        j.finish(outcome.clone());
        j.id
    };
    tracing::info!(job = id, ?outcome, "job reached terminal state");
    ctx.bus.publish(Event::Terminal { job: id, outcome });
}

async fn conclude_cancelled(
    job: &Mutex<Job>,
    ctx: &WorkerContext,
    staged: Option<&PathBuf>,
) {
    if let Some(staged) = staged {
        finalize::discard_staged(staged).await;
    }
    let reason = if ctx.timed_out.load(Ordering::SeqCst) {
        CancelReason::Timeout
    } else {
        CancelReason::User
    };
    conclude(job, ctx, Outcome::Cancelled(reason));
}

fn metadata_failure_kind(err: &MetadataError) -> FailureKind {
    match err {
        MetadataError::NotFound => FailureKind::NotFound,
        MetadataError::Unavailable(_) => FailureKind::Unavailable,
        MetadataError::RateLimited => FailureKind::RateLimited,
        MetadataError::AuthStale(_) => FailureKind::AuthStale,
        MetadataError::Unknown(_) => FailureKind::Unknown,
    }
}

/// Drives one job from `Queued` to a terminal state.
///
/// Each loop iteration is one attempt: cancellation check, metadata fetch,
/// collision arbitration, transfer, finalize. Cancellation is cooperative
/// and observed at each of those suspension points.
pub(crate) async fn run_job(job: Arc<Mutex<Job>>, ctx: WorkerContext) {
    let (id, target, config) = {
        let j = hold_job(&job);
        (j.id, j.target.clone(), j.config.clone())
    };
    let max_attempts = config.max_attempts.max(1);
    // Fallback ladder cursor, advanced on FormatUnavailable only.
    let mut format_idx = 0usize;

    loop {
        if ctx.cancel.is_cancelled() {
            conclude_cancelled(&job, &ctx, None).await;
            return;
        }

        let attempt = {
            let mut j = hold_job(&job);
            j.begin_attempt();
            j.attempts
        };
        transition(&job, &ctx, JobState::FetchingMetadata, "fetching metadata");

        let meta = match ctx.engine.fetch_metadata(&target, &config).await {
            Ok(meta) => meta,
            Err(err) => {
                let transient = matches!(
                    err,
                    MetadataError::RateLimited | MetadataError::AuthStale(_)
                );
                if transient && attempt < max_attempts {
                    if matches!(err, MetadataError::AuthStale(_)) {
                        ctx.engine.clear_cache().await;
                    }
                    tracing::warn!(job = id, attempt, error = %err, "metadata fetch failed, retrying");
                    continue;
                }
                conclude(
                    &job,
                    &ctx,
                    Outcome::Failed {
                        kind: metadata_failure_kind(&err),
                        message: err.to_string(),
                    },
                );
                return;
            }
        };

        {
            let mut j = hold_job(&job);
            if j.set_title(&meta.title) {
                ctx.bus.publish(Event::Title {
                    job: id,
                    title: meta.title.clone(),
                });
            }
        }

        let expected = config.destination_dir.join(&meta.output_filename);
        let staging = config.temp_dir.join(format!("{}.part", meta.output_filename));
        {
            hold_job(&job).expected_final_path = Some(expected.clone());
        }

        // Held through finalize so same-path jobs cannot race on the
        // existence check or the delete+rename.
        let _path_guard = ctx.path_locks.acquire(&expected).await;

        let authorized = hold_job(&job).overwrite_authorized;
        if !authorized && tokio::fs::try_exists(&expected).await.unwrap_or(false) {
            transition(
                &job,
                &ctx,
                JobState::AwaitingDecision,
                "file exists, awaiting overwrite decision",
            );
            match ctx.resolver.resolve(id, &expected, &ctx.bus, &ctx.cancel).await {
                Err(violation) => {
                    tracing::error!(job = id, %violation, "collision prompt contract violated");
                    conclude(
                        &job,
                        &ctx,
                        Outcome::Failed {
                            kind: FailureKind::Contract,
                            message: violation.to_string(),
                        },
                    );
                    return;
                }
                Ok(_) if ctx.cancel.is_cancelled() => {
                    conclude_cancelled(&job, &ctx, None).await;
                    return;
                }
                Ok(Decision::Skip) => {
                    conclude(&job, &ctx, Outcome::Skipped);
                    return;
                }
                Ok(Decision::Overwrite) => {
                    hold_job(&job).overwrite_authorized = true;
                }
            }
        }

        transition(
            &job,
            &ctx,
            JobState::Transferring,
            &format!("transferring (attempt {attempt}/{max_attempts})"),
        );
        ctx.bus.publish(Event::Progress {
            job: id,
            fraction: Some(0.0),
        });

        let format = config.formats.get(format_idx).map(String::as_str);
        let on_progress: ProgressFn = {
            let job = job.clone();
            let bus = ctx.bus.clone();
            Box::new(move |progress| match progress.fraction() {
                Some(fraction) => {
                    let clamped = {
                        let mut j = hold_job(&job);
                        j.record_progress(fraction);
                        j.progress
                    };
                    bus.publish(Event::Progress {
                        job: id,
                        fraction: Some(clamped),
                    });
                }
                None => bus.publish(Event::Progress {
                    job: id,
                    fraction: None,
                }),
            })
        };

        let result = ctx
            .engine
            .transfer(&target, &config, format, &staging, on_progress, &ctx.cancel)
            .await;

        match result {
            Ok(()) => {
                if ctx.cancel.is_cancelled() {
                    conclude_cancelled(&job, &ctx, Some(&staging)).await;
                    return;
                }
                transition(&job, &ctx, JobState::Finalizing, "finalizing");
                let authorized = hold_job(&job).overwrite_authorized;
                match finalize::commit(&staging, &expected, authorized).await {
                    Ok(()) => {
                        conclude(
                            &job,
                            &ctx,
                            Outcome::Succeeded {
                                final_path: expected,
                            },
                        );
                    }
                    Err(err) => {
                        // Staged file stays put for manual recovery.
                        tracing::warn!(job = id, error = %err, "finalize failed");
                        conclude(
                            &job,
                            &ctx,
                            Outcome::Failed {
                                kind: err.kind(),
                                message: err.to_string(),
                            },
                        );
                    }
                }
                return;
            }
            Err(TransferError::Aborted) => {
                conclude_cancelled(&job, &ctx, Some(&staging)).await;
                return;
            }
            Err(err) => {
                if ctx.cancel.is_cancelled() {
                    conclude_cancelled(&job, &ctx, Some(&staging)).await;
                    return;
                }
                finalize::discard_staged(&staging).await;

                let (kind, retryable) = match &err {
                    TransferError::Network(_) => (FailureKind::Network, true),
                    TransferError::RateLimited => (FailureKind::RateLimited, true),
                    TransferError::AuthStale(_) => (FailureKind::AuthStale, true),
                    TransferError::FormatUnavailable(_) => (
                        FailureKind::FormatUnavailable,
                        format_idx + 1 < config.formats.len(),
                    ),
                    TransferError::Unknown(_) => (FailureKind::Unknown, false),
                    TransferError::Aborted => (FailureKind::Unknown, false),
                };

                if !retryable {
                    conclude(
                        &job,
                        &ctx,
                        Outcome::Failed {
                            kind,
                            message: err.to_string(),
                        },
                    );
                    return;
                }
                if attempt >= max_attempts {
                    conclude(
                        &job,
                        &ctx,
                        Outcome::Failed {
                            kind: FailureKind::AttemptsExhausted,
                            message: format!("gave up after {attempt} attempts: {err}"),
                        },
                    );
                    return;
                }
                if matches!(err, TransferError::AuthStale(_)) {
                    ctx.engine.clear_cache().await;
                }
                if matches!(err, TransferError::FormatUnavailable(_)) {
                    format_idx += 1;
                }
                tracing::warn!(job = id, attempt, error = %err, "transfer failed, will retry");
            }
        }
    }
}
