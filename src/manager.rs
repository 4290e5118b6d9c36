// src/manager.rs

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collision::CollisionResolver;
use crate::engine::Engine;
use crate::events::{Event, EventBus, Events};
use crate::finalize::PathLocks;
use crate::models::{CancelReason, Job, JobConfig, JobId, JobState, Outcome};
use crate::worker::{self, hold_job, WorkerContext};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("job with ID {0} not found")]
    JobNotFound(JobId),
}

/// Size of the event buffer; progress chatter beyond this is shed oldest
/// first, decision and terminal events never are.
const EVENT_BUFFER: usize = 256;

/// Scheduler poll interval.
const TICK: Duration = Duration::from_millis(100);

fn hold<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// The central component that supervises all download jobs: FIFO queue,
/// bounded worker pool, cancellation, and the event stream consumers
/// subscribe to.
pub struct DownloadManager {
    engine: Arc<dyn Engine>,
    jobs: Mutex<HashMap<JobId, Arc<Mutex<Job>>>>,
    queue: Mutex<VecDeque<JobId>>,
    capacity: AtomicUsize,
    active: Mutex<HashMap<JobId, JoinHandle<()>>>,
    // Tokens are created on demand so a cancel racing worker startup parks a
    // pre-cancelled token for the spawner to reuse.
    cancel_tokens: Mutex<HashMap<JobId, CancellationToken>>,
    timeout_flags: Mutex<HashMap<JobId, Arc<AtomicBool>>>,
    resolver: Arc<CollisionResolver>,
    path_locks: Arc<PathLocks>,
    bus: EventBus,
    next_job_id: AtomicU64,
}

impl DownloadManager {
    pub fn new(engine: Arc<dyn Engine>, capacity: usize) -> Self {
        Self {
            engine,
            jobs: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            capacity: AtomicUsize::new(capacity.max(1)),
            active: Mutex::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
            timeout_flags: Mutex::new(HashMap::new()),
            resolver: Arc::new(CollisionResolver::new()),
            path_locks: Arc::new(PathLocks::new()),
            bus: EventBus::new(EVENT_BUFFER),
            next_job_id: AtomicU64::new(1),
        }
    }

    /// The event stream. One logical subscriber is supported.
    pub fn subscribe(&self) -> Events {
        self.bus.subscribe()
    }

    /// Queues a new job and returns immediately with its id.
    pub fn submit(&self, target: impl Into<String>, config: JobConfig) -> JobId {
        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let job = Job::new(id, target.into(), config);
        hold(&self.jobs).insert(id, Arc::new(Mutex::new(job)));
        hold(&self.queue).push_back(id);
        tracing::info!(job = id, "job submitted");
        id
    }

    /// Requests cancellation. A still-queued job is removed from the queue
    /// and terminally cancelled without ever starting; a running job gets
    /// its token cancelled and stops at its next cooperative check.
    pub fn cancel(&self, id: JobId) -> Result<(), ManagerError> {
        let job = hold(&self.jobs)
            .get(&id)
            .cloned()
            .ok_or(ManagerError::JobNotFound(id))?;

        // A job already concluded has had its token pruned; creating one
        // here would leak a map entry nothing ever removes.
        if hold_job(&job).state.is_terminal() {
            return Ok(());
        }

        let dequeued = {
            let mut queue = hold(&self.queue);
            match queue.iter().position(|queued| *queued == id) {
                Some(pos) => {
                    queue.remove(pos);
                    true
                }
                None => false,
            }
        };

        if dequeued {
            let outcome = Outcome::Cancelled(CancelReason::User);
            {
                let mut j = hold_job(&job);
                if j.state.is_terminal() {
                    return Ok(());
                }
                j.finish(outcome.clone());
            }
            tracing::info!(job = id, "cancelled while queued");
            self.bus.publish(Event::Terminal { job: id, outcome });
            return Ok(());
        }

        // Running (or about to run): get-or-create the token so a racing
        // spawn picks up an already-cancelled one.
        let token = hold(&self.cancel_tokens)
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone();
        tracing::info!(job = id, "cancellation requested");
        token.cancel();
        Ok(())
    }

    /// Reconfigures pool capacity. Applies to future slot acquisitions only;
    /// running jobs are never preempted.
    pub fn set_capacity(&self, n: usize) {
        self.capacity.store(n.max(1), Ordering::SeqCst);
        tracing::info!(capacity = n.max(1), "pool capacity updated");
    }

    /// Answers an outstanding collision prompt. Must be called exactly once
    /// per prompt; with no outstanding prompt for `id` it is a no-op.
    pub fn provide_collision_decision(&self, id: JobId, allow: bool) {
        self.resolver.provide(id, allow);
    }

    /// Snapshot of every tracked job.
    pub fn jobs(&self) -> Vec<Job> {
        hold(&self.jobs)
            .values()
            .map(|job| hold_job(job).clone())
            .collect()
    }

    /// Snapshot of a single job.
    pub fn job(&self, id: JobId) -> Option<Job> {
        hold(&self.jobs).get(&id).map(|job| hold_job(job).clone())
    }

    /// Scheduler loop: recycle finished worker slots, then bind queued jobs
    /// to free slots FIFO. Runs until the task is dropped/aborted.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.prune_finished_workers();

            let startable = {
                let active = hold(&self.active);
                let capacity = self.capacity.load(Ordering::SeqCst);
                let mut free = capacity.saturating_sub(active.len());
                drop(active);

                let mut queue = hold(&self.queue);
                let jobs = hold(&self.jobs);
                let mut startable = Vec::new();
                while free > 0 {
                    let Some(id) = queue.pop_front() else { break };
                    let Some(job) = jobs.get(&id).cloned() else { continue };
                    // Jobs terminally cancelled while queued stay dequeued.
                    if hold_job(&job).state != JobState::Queued {
                        continue;
                    }
                    startable.push((id, job));
                    free -= 1;
                }
                startable
            };

            for (id, job) in startable {
                self.spawn_worker(id, job);
            }

            tokio::time::sleep(TICK).await;
        }
    }

    fn spawn_worker(self: &Arc<Self>, id: JobId, job: Arc<Mutex<Job>>) {
        let cancel = hold(&self.cancel_tokens)
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone();
        let timed_out = Arc::new(AtomicBool::new(false));
        hold(&self.timeout_flags).insert(id, timed_out.clone());

        let ctx = WorkerContext {
            engine: self.engine.clone(),
            resolver: self.resolver.clone(),
            path_locks: self.path_locks.clone(),
            bus: self.bus.clone(),
            cancel: cancel.clone(),
            timed_out: timed_out.clone(),
        };
        let timeout = hold_job(&job).config.timeout;

        tracing::debug!(job = id, "binding job to worker slot");
        let handle = tokio::spawn(async move {
            let watchdog = timeout.map(|deadline| {
                Self::spawn_watchdog(id, deadline, timed_out.clone(), cancel.clone())
            });
            worker::run_job(job, ctx).await;
            // The deadline is moot once the job concluded; do not leave the
            // watchdog sleeping it out.
            if let Some(watchdog) = watchdog {
                watchdog.abort();
            }
        });

        hold(&self.active).insert(id, handle);
    }

    fn spawn_watchdog(
        id: JobId,
        deadline: Duration,
        timed_out: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    tracing::warn!(job = id, ?deadline, "job timed out");
                    timed_out.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        })
    }

    fn prune_finished_workers(&self) {
        let finished: Vec<JobId> = hold(&self.active)
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        if finished.is_empty() {
            return;
        }

        let mut active = hold(&self.active);
        let mut tokens = hold(&self.cancel_tokens);
        let mut flags = hold(&self.timeout_flags);
        for id in finished {
            tracing::debug!(job = id, "recycling worker slot");
            active.remove(&id);
            tokens.remove(&id);
            flags.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Metadata, MetadataError, ProgressFn, TransferError};
    use async_trait::async_trait;
    use std::path::Path;

    struct NullEngine;

    #[async_trait]
    impl Engine for NullEngine {
        async fn fetch_metadata(
            &self,
            _target: &str,
            _config: &JobConfig,
        ) -> Result<Metadata, MetadataError> {
            Ok(Metadata {
                title: "clip".to_string(),
                output_filename: "clip.mp4".to_string(),
            })
        }

        async fn transfer(
            &self,
            _target: &str,
            _config: &JobConfig,
            _format: Option<&str>,
            _staging_path: &Path,
            _on_progress: ProgressFn,
            _cancel: &CancellationToken,
        ) -> Result<(), TransferError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancelling_a_finished_job_leaves_no_token_behind() {
        let manager = DownloadManager::new(Arc::new(NullEngine), 1);
        let id = manager.submit("https://example.com/clip", JobConfig::default());

        manager.cancel(id).unwrap();
        assert!(manager.job(id).unwrap().state.is_terminal());

        manager.cancel(id).unwrap();
        manager.cancel(id).unwrap();
        assert!(hold(&manager.cancel_tokens).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_watchdog_never_fires() {
        let timed_out = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();
        let watchdog = DownloadManager::spawn_watchdog(
            7,
            Duration::from_secs(60),
            timed_out.clone(),
            token.clone(),
        );

        watchdog.abort();
        let _ = watchdog.await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!timed_out.load(Ordering::SeqCst));
        assert!(!token.is_cancelled());
    }
}
