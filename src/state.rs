//! Job state machine.
//!
//! ```text
//! queued ──┐
//!          ├─▶ running ─┬─▶ completed ─▶ indexing ─┬─▶ indexed
//! retryable┘            ├─▶ retryable              └─▶ index_failed
//!     ▲                 └─▶ failed                        │
//!     └──── (re-pick, after cooldown)        (explicit re-index) ─▶ indexing
//! ```
//!
//! Every edge is applied through a compare-and-set in [`crate::jobs`]; this
//! module only decides which edges exist and who may take them.

use crate::error::IllegalTransition;
use crate::models::{Actor, JobStatus};

/// Check that `actor` may move a job from `from` to `to`.
pub fn check(from: JobStatus, to: JobStatus, actor: Actor) -> Result<(), IllegalTransition> {
    use JobStatus::*;

    let allowed = match (from, to) {
        (Queued | Retryable, Running) => actor == Actor::Orchestrator,
        (Running, Completed | Failed) => actor == Actor::Orchestrator,
        // Capture failure, infra failure, or soft recovery
        (Running, Retryable) => matches!(actor, Actor::Orchestrator | Actor::Recovery),
        (Completed, Indexing) => matches!(actor, Actor::Indexer | Actor::Operator),
        (Indexing, Indexed | IndexFailed) => matches!(actor, Actor::Indexer | Actor::Operator),
        (IndexFailed, Indexing) => actor == Actor::Operator,
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(IllegalTransition { from, to, actor })
    }
}
