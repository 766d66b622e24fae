//! Keel apply: server-side dry-run diffs, staged apply, prune and readiness waits.
//!
//! Every cluster call made here is bounded by the caller's deadline; expiry surfaces
//! as [`ReconcileError::DeadlineExceeded`] or [`ReconcileError::Timeout`], never as a
//! cluster error. Nothing is retried.

#![forbid(unsafe_code)]

pub mod diff;
pub mod prune;
pub mod staged;
pub mod textdiff;
pub mod wait;

use std::future::Future;

use keel_core::ReconcileError;
use tokio::time::Instant;

pub use diff::{diff_all, diff_object, DiffOutcome, DiffReport, DiffSummary};
pub use prune::delete_all;
pub use staged::apply_all_staged;
pub use wait::{wait_ready, wait_terminated, WaitOptions};

/// Run `fut` unless `deadline` passes first; `op` names the step in the error.
pub async fn within<T, F>(deadline: Instant, op: &str, fut: F) -> Result<T, ReconcileError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout_at(deadline, fut).await.map_err(|_| ReconcileError::DeadlineExceeded(op.to_string()))
}
