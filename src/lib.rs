pub mod collision;
pub mod engine;
pub mod events;
pub mod finalize;
pub mod http_engine;
pub mod limiter;
pub mod manager;
pub mod models;
mod worker;

/// Convenient re-exports of the public surface.
pub mod prelude {
    pub use crate::collision::{CollisionResolver, ContractViolation, Decision};
    pub use crate::engine::{
        Engine, Metadata, MetadataError, Progress, ProgressFn, TransferError, TransferPhase,
    };
    pub use crate::events::{Event, EventBus, Events};
    pub use crate::http_engine::HttpEngine;
    pub use crate::limiter::RateLimiter;
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{
        CancelReason, FailureKind, Job, JobConfig, JobId, JobState, Mode, Outcome,
    };
}
