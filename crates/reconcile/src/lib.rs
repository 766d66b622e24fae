//! Keel reconcile: drives one run from labelled desired objects to a converged cluster.
//!
//! A run is a fixed sequence of [`Step`]s: label, then either a dry-run diff or
//! apply, compute stale, persist inventory, prune, wait-ready and wait-terminated.
//! The first fatal step ends the run; the [`RunFailure`] carries what was done.

#![forbid(unsafe_code)]

pub mod source;

use std::fmt;
use std::time::{Duration, Instant as StdInstant};

use keel_apply::{apply_all_staged, delete_all, diff_all, wait_ready, wait_terminated, within, DiffReport, WaitOptions};
use keel_core::{Action, ChangeSet, DynamicObject, Instance, ObjectId, PruneOrdering, ReconcileConfig, ReconcileError};
use keel_inventory::{Inventory, InventoryStore};
use keel_kubehub::{ApplyOptions, ClusterClient};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

pub use source::{ManifestBuilder, ObjectBuilder};

/// Desired state for one instance.
#[derive(Debug, Clone)]
pub struct Request {
    pub instance: Instance,
    /// Where the objects came from, recorded in the inventory.
    pub source: String,
    pub version: String,
    pub objects: Vec<DynamicObject>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Apply,
    /// Server-side dry run only; `detailed` adds unified diffs.
    DryRun { detailed: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Label,
    Diff,
    Apply,
    ComputeStale,
    PersistInventory,
    Prune,
    WaitReady,
    WaitTerminated,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Label => "label",
            Step::Diff => "diff",
            Step::Apply => "apply",
            Step::ComputeStale => "compute-stale",
            Step::PersistInventory => "persist-inventory",
            Step::Prune => "prune",
            Step::WaitReady => "wait-ready",
            Step::WaitTerminated => "wait-terminated",
        };
        f.write_str(s)
    }
}

/// What a run did, step by step.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub applied: ChangeSet,
    /// Members of the previous inventory missing from this run.
    pub stale: Vec<ObjectId>,
    pub pruned: ChangeSet,
    pub diff: Option<DiffReport>,
    /// Steps that completed, in order.
    pub steps: Vec<Step>,
}

impl RunReport {
    /// Applied then pruned changes.
    pub fn changes(&self) -> ChangeSet {
        let mut all = self.applied.clone();
        all.append(self.pruned.clone());
        all
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{step}: {error}")]
pub struct RunFailure {
    pub step: Step,
    pub report: RunReport,
    pub error: ReconcileError,
}

impl RunFailure {
    fn new(step: Step, report: RunReport, error: ReconcileError) -> Self { Self { step, report, error } }
}

/// Effectively unbounded; timeouts past it are clamped.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now + Duration::from_secs(86_400))
}

pub struct Reconciler<'a> {
    client: &'a dyn ClusterClient,
    config: &'a ReconcileConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(client: &'a dyn ClusterClient, config: &'a ReconcileConfig) -> Self { Self { client, config } }

    pub async fn run(&self, req: Request, mode: Mode) -> Result<RunReport, RunFailure> {
        let t0 = StdInstant::now();
        let res = self.run_steps(req, mode).await;
        histogram!("reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(_) => {
                counter!("reconcile_ok", 1u64);
            }
            Err(f) => {
                counter!("reconcile_err", 1u64);
                warn!(step = %f.step, error = %f.error, "reconcile failed");
            }
        }
        res
    }

    async fn run_steps(&self, req: Request, mode: Mode) -> Result<RunReport, RunFailure> {
        let cfg = self.config;
        let deadline = deadline_after(cfg.timeout);
        let Request { instance, source, version, mut objects } = req;
        let mut report = RunReport::default();

        let ids = match objects.iter().map(ObjectId::from_object).collect::<Result<Vec<_>, _>>() {
            Ok(ids) => ids,
            Err(e) => return Err(RunFailure::new(Step::Label, report, e)),
        };
        cfg.owner.label(&mut objects, &instance);
        report.steps.push(Step::Label);
        info!(%instance, objects = objects.len(), "labelled objects");

        if let Mode::DryRun { detailed } = mode {
            let opts = ApplyOptions::from_config(cfg);
            match diff_all(self.client, &objects, &opts, detailed, deadline).await {
                Ok(diff) => report.diff = Some(diff),
                Err(e) => return Err(RunFailure::new(Step::Diff, report, e)),
            }
            report.steps.push(Step::Diff);
            return Ok(report);
        }

        let mut inventory = Inventory::new(&instance);
        inventory.set_source(source, version);
        inventory.add_ids(ids.iter());

        match apply_all_staged(self.client, objects, cfg, deadline).await {
            Ok(changes) => report.applied = changes,
            Err(p) => {
                report.applied = p.changes;
                return Err(RunFailure::new(Step::Apply, report, p.error));
            }
        }
        report.steps.push(Step::Apply);

        let store = InventoryStore::new(self.client, &cfg.owner);
        match within(deadline, "compute stale", store.compute_stale(&inventory)).await.and_then(|r| r) {
            Ok(stale) => report.stale = stale,
            Err(e) => return Err(RunFailure::new(Step::ComputeStale, report, e)),
        }
        report.steps.push(Step::ComputeStale);
        if !cfg.prune && !report.stale.is_empty() {
            // Keep tracking what we are not allowed to delete.
            info!(stale = report.stale.len(), "pruning disabled; stale objects stay in the inventory");
            inventory.add_ids(report.stale.iter());
        }

        match cfg.prune_ordering {
            PruneOrdering::PersistThenPrune => {
                report = self.persist(&store, &inventory, report, deadline).await?;
                report = self.prune(&instance, report, deadline).await?;
            }
            PruneOrdering::PruneThenPersist => {
                report = self.prune(&instance, report, deadline).await?;
                report = self.persist(&store, &inventory, report, deadline).await?;
            }
        }

        if cfg.wait {
            let wo = WaitOptions::from_config(cfg);
            if let Err(e) = wait_ready(self.client, &ids, &wo, deadline).await {
                return Err(RunFailure::new(Step::WaitReady, report, e));
            }
            report.steps.push(Step::WaitReady);

            let deleted: Vec<ObjectId> =
                report.pruned.iter().filter(|e| e.action == Action::Deleted).map(|e| e.id.clone()).collect();
            if let Err(e) = wait_terminated(self.client, &deleted, &wo, deadline).await {
                return Err(RunFailure::new(Step::WaitTerminated, report, e));
            }
            report.steps.push(Step::WaitTerminated);
            info!(%instance, "all resources are ready");
        }
        Ok(report)
    }

    async fn persist(
        &self,
        store: &InventoryStore<'_>,
        inventory: &Inventory,
        mut report: RunReport,
        deadline: Instant,
    ) -> Result<RunReport, RunFailure> {
        match within(deadline, "persist inventory", store.persist(inventory)).await.and_then(|r| r) {
            Ok(()) => {
                report.steps.push(Step::PersistInventory);
                Ok(report)
            }
            Err(e) => Err(RunFailure::new(Step::PersistInventory, report, e)),
        }
    }

    async fn prune(&self, instance: &Instance, mut report: RunReport, deadline: Instant) -> Result<RunReport, RunFailure> {
        if !self.config.prune || report.stale.is_empty() {
            return Ok(report);
        }
        info!(%instance, stale = report.stale.len(), "pruning stale objects");
        match delete_all(self.client, &report.stale, &self.config.owner, instance, deadline).await {
            Ok(changes) => {
                report.pruned = changes;
                report.steps.push(Step::Prune);
                Ok(report)
            }
            Err(p) => {
                report.pruned = p.changes;
                Err(RunFailure::new(Step::Prune, report, p.error))
            }
        }
    }
}
