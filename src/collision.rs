// src/collision.rs

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventBus};
use crate::models::JobId;

/// Answer to an overwrite prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Overwrite,
    Skip,
}

/// Programming-contract violation, fatal to the offending job only.
#[derive(Debug, Error)]
pub enum ContractViolation {
    #[error("job {0} already has an outstanding collision prompt")]
    PromptAlreadyPending(JobId),
}

/// Arbitrates "may I overwrite this existing file?" questions without
/// blocking anything but the asking job.
///
/// Each prompt is a one-shot slot: `resolve` parks the calling job on it,
/// `provide` fires it from the consumer side. At most one outstanding
/// prompt per job at a time.
pub struct CollisionResolver {
    pending: Mutex<HashMap<JobId, oneshot::Sender<bool>>>,
}

impl CollisionResolver {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn hold(&self) -> MutexGuard<'_, HashMap<JobId, oneshot::Sender<bool>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publishes a collision prompt for `job` and suspends until a decision
    /// arrives or `cancel` fires (which short-circuits to `Skip`; the
    /// caller observes the token and concludes cancellation itself).
    pub async fn resolve(
        &self,
        job: JobId,
        path: &Path,
        bus: &EventBus,
        cancel: &CancellationToken,
    ) -> Result<Decision, ContractViolation> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.hold();
            if pending.contains_key(&job) {
                return Err(ContractViolation::PromptAlreadyPending(job));
            }
            pending.insert(job, tx);
        }

        tracing::info!(job, path = %path.display(), "existing file at final path, prompting");
        bus.publish(Event::CollisionPrompt {
            job,
            path: path.to_path_buf(),
        });

        let decision = tokio::select! {
            answer = rx => match answer {
                Ok(true) => Decision::Overwrite,
                // A dropped sender means the prompt was withdrawn; treat it
                // like a refusal rather than guessing.
                Ok(false) | Err(_) => Decision::Skip,
            },
            _ = cancel.cancelled() => {
                self.hold().remove(&job);
                Decision::Skip
            }
        };
        Ok(decision)
    }

    /// Supplies the decision for an outstanding prompt. Calling this with no
    /// outstanding prompt for `job` is a no-op.
    pub fn provide(&self, job: JobId, allow: bool) {
        let slot = self.hold().remove(&job);
        match slot {
            Some(tx) => {
                tracing::info!(job, allow, "collision decision received");
                let _ = tx.send(allow);
            }
            None => {
                tracing::debug!(job, "collision decision with no outstanding prompt, ignored");
            }
        }
    }
}

impl Default for CollisionResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<CollisionResolver>, EventBus, CancellationToken) {
        (
            Arc::new(CollisionResolver::new()),
            EventBus::new(16),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn resolve_returns_provided_decision() {
        let (resolver, bus, cancel) = setup();
        let path = PathBuf::from("/final/video.mp4");

        let waiter = {
            let resolver = resolver.clone();
            let bus = bus.clone();
            let cancel = cancel.clone();
            let path = path.clone();
            tokio::spawn(async move { resolver.resolve(9, &path, &bus, &cancel).await })
        };

        // Wait for the prompt to land on the bus before answering.
        let mut events = bus.subscribe();
        assert_eq!(events.recv().await, Event::CollisionPrompt { job: 9, path });

        resolver.provide(9, true);
        assert_eq!(waiter.await.unwrap().unwrap(), Decision::Overwrite);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_to_skip() {
        let (resolver, bus, cancel) = setup();
        let path = PathBuf::from("/final/video.mp4");

        let waiter = {
            let resolver = resolver.clone();
            let bus = bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { resolver.resolve(3, &path, &bus, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap().unwrap(), Decision::Skip);
        // The slot must be gone so a later decision is a no-op.
        resolver.provide(3, true);
    }

    #[tokio::test]
    async fn second_prompt_for_same_job_is_a_contract_violation() {
        let (resolver, bus, cancel) = setup();
        let path = PathBuf::from("/final/video.mp4");

        let _first = {
            let resolver = resolver.clone();
            let bus = bus.clone();
            let cancel = cancel.clone();
            let path = path.clone();
            tokio::spawn(async move { resolver.resolve(5, &path, &bus, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = resolver.resolve(5, &path, &bus, &cancel).await;
        assert!(matches!(
            second,
            Err(ContractViolation::PromptAlreadyPending(5))
        ));
    }

    #[tokio::test]
    async fn provide_without_prompt_is_a_noop() {
        let (resolver, _bus, _cancel) = setup();
        resolver.provide(42, true);
    }
}
