//! Readiness and termination waits.
//!
//! Each monitored object moves `Pending -> {Ready, Failed, TimedOut}`. Every
//! `interval` one round polls all still-pending objects, at most `concurrency`
//! observations in flight; all rounds share one deadline.

use std::time::{Duration, Instant as StdInstant};

use futures::stream::{self, StreamExt};
use keel_core::{ClusterError, ObjectId, ReconcileConfig, ReconcileError, Readiness};
use keel_kubehub::ClusterClient;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub interval: Duration,
    pub concurrency: usize,
}

impl WaitOptions {
    pub fn from_config(cfg: &ReconcileConfig) -> Self {
        Self { interval: cfg.poll_interval, concurrency: cfg.max_concurrency.max(1) }
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Ready,
    Absent,
}

async fn observe(client: &dyn ClusterClient, id: &ObjectId, target: Target) -> Result<Readiness, ClusterError> {
    match target {
        Target::Ready => client.poll_ready(id).await,
        Target::Absent => Ok(if client.poll_absent(id).await? { Readiness::Ready } else { Readiness::InProgress("terminating".into()) }),
    }
}

/// One bounded observation; `None` when the deadline hit first.
async fn observe_by(client: &dyn ClusterClient, id: &ObjectId, target: Target, deadline: Instant) -> Option<Result<Readiness, ClusterError>> {
    tokio::time::timeout_at(deadline, observe(client, id, target)).await.ok()
}

async fn wait_for(
    client: &dyn ClusterClient,
    ids: &[ObjectId],
    opts: &WaitOptions,
    deadline: Instant,
    target: Target,
) -> Result<(), ReconcileError> {
    if ids.is_empty() {
        return Ok(());
    }
    let t0 = StdInstant::now();
    let mut pending: Vec<&ObjectId> = ids.iter().collect();
    let mut failed: Vec<(ObjectId, String)> = Vec::new();

    loop {
        let mut round = stream::iter(pending.iter().copied().enumerate())
            .map(|(i, id)| async move { (i, observe_by(client, id, target, deadline).await) })
            .buffer_unordered(opts.concurrency.max(1));
        let mut settled = vec![false; pending.len()];
        while let Some((i, seen)) = round.next().await {
            let id = pending[i];
            match seen {
                None => {}
                Some(Err(source)) => {
                    counter!("wait_err", 1u64);
                    return Err(ReconcileError::Poll { id: id.clone(), source });
                }
                Some(Ok(Readiness::Ready)) => settled[i] = true,
                Some(Ok(Readiness::Failed(why))) => {
                    settled[i] = true;
                    failed.push((id.clone(), why));
                }
                Some(Ok(Readiness::InProgress(why))) => trace!(object = %id, reason = %why, "pending"),
            }
        }
        drop(round);
        pending = pending.into_iter().zip(settled).filter(|(_, done)| !done).map(|(id, _)| id).collect();

        if !failed.is_empty() {
            // Report in input order.
            failed.sort_by_key(|(id, _)| ids.iter().position(|x| x == id));
            counter!("wait_failed", failed.len() as u64);
            histogram!("wait_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            return Err(ReconcileError::NotReady { failed });
        }
        if pending.is_empty() {
            break;
        }
        if Instant::now() >= deadline || tokio::time::timeout_at(deadline, tokio::time::sleep(opts.interval)).await.is_err() {
            counter!("wait_timeout", 1u64);
            histogram!("wait_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            return Err(ReconcileError::Timeout { pending: pending.into_iter().cloned().collect() });
        }
    }
    histogram!("wait_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("wait_ok", 1u64);
    debug!(objects = ids.len(), ?target, "wait complete");
    Ok(())
}

/// Block until every object is ready. Objects that became ready are never reported.
pub async fn wait_ready(client: &dyn ClusterClient, ids: &[ObjectId], opts: &WaitOptions, deadline: Instant) -> Result<(), ReconcileError> {
    info!(objects = ids.len(), "waiting for readiness");
    wait_for(client, ids, opts, deadline, Target::Ready).await
}

/// Block until every object is gone from the cluster.
pub async fn wait_terminated(client: &dyn ClusterClient, ids: &[ObjectId], opts: &WaitOptions, deadline: Instant) -> Result<(), ReconcileError> {
    info!(objects = ids.len(), "waiting for termination");
    wait_for(client, ids, opts, deadline, Target::Absent).await
}
