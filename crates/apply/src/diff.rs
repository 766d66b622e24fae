//! Server-side dry-run diffs.

use std::time::Instant as StdInstant;

use keel_core::{sort_objects, Action, ChangeSet, DynamicObject, ObjectId, ReconcileError};
use keel_kubehub::{ApplyOptions, ClusterClient};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{textdiff, within};

const CONTEXT_LINES: usize = 3;
const MASK: &str = "****";

#[derive(Debug, Clone)]
pub struct DiffOutcome {
    pub action: Action,
    pub live: Option<DynamicObject>,
    pub merged: DynamicObject,
}

/// Field counts between live and merged, as reported alongside a `configured` object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl std::fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{} ~{} -{}", self.adds, self.updates, self.removes)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffReport {
    pub changes: ChangeSet,
    /// Summary lines, each followed by its unified diff when one was requested.
    pub lines: Vec<String>,
    pub summaries: Vec<(ObjectId, DiffSummary)>,
    /// Objects whose dry run failed, with the reason.
    pub skipped: Vec<(ObjectId, String)>,
}

impl DiffReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        for l in &self.lines {
            out.push_str(l);
            if !l.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

/// Dry-run `obj` and classify it against the live object. Persists nothing.
pub async fn diff_object(client: &dyn ClusterClient, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DiffOutcome, ReconcileError> {
    let id = ObjectId::from_object(obj)?;
    let live = client.get(&id).await.map_err(|source| ReconcileError::DryRun { id: id.clone(), source })?;
    let merged = client.dry_run_apply(obj, opts).await.map_err(|source| ReconcileError::DryRun { id: id.clone(), source })?;
    let action = match &live {
        None => Action::Created,
        Some(l) if strip_noisy(to_json(l)?) != strip_noisy(to_json(&merged)?) => Action::Configured,
        Some(_) => Action::Unchanged,
    };
    debug!(object = %id, %action, "dry run");
    Ok(DiffOutcome { action, live, merged })
}

/// Dry-run every object in install order. Per-object cluster failures are logged
/// and skipped; only deadline expiry aborts.
pub async fn diff_all(
    client: &dyn ClusterClient,
    objects: &[DynamicObject],
    opts: &ApplyOptions,
    detailed: bool,
    deadline: Instant,
) -> Result<DiffReport, ReconcileError> {
    let t0 = StdInstant::now();
    let mut sorted = objects.to_vec();
    sort_objects(&mut sorted);

    let mut report = DiffReport::default();
    for obj in &sorted {
        let id = ObjectId::from_object(obj)?;
        let outcome = match within(deadline, "diff", diff_object(client, obj, opts)).await? {
            Ok(o) => o,
            Err(e) => {
                warn!(object = %id, error = %e, "dry run failed; skipping");
                counter!("diff_skipped", 1u64);
                report.skipped.push((id, e.to_string()));
                continue;
            }
        };
        report.lines.push(format!("{} {} (server dry run)", outcome.action, id));
        if outcome.action == Action::Configured {
            if let Some(live) = &outcome.live {
                let (live_v, merged_v) = (strip_noisy(to_json(live)?), strip_noisy(to_json(&outcome.merged)?));
                report.summaries.push((id.clone(), diff_summary(&merged_v, &live_v)));
                if detailed {
                    let (live_v, merged_v) = if is_secret(&id) { mask_secret(live_v, merged_v) } else { (live_v, merged_v) };
                    let text = textdiff::unified(
                        &canonical_yaml(&live_v)?,
                        &canonical_yaml(&merged_v)?,
                        &format!("live {}", id),
                        &format!("merged {}", id),
                        CONTEXT_LINES,
                    );
                    if !text.is_empty() {
                        report.lines.push(text);
                    }
                }
            }
        }
        report.changes.add(id, outcome.action);
    }
    counter!("diff_objects", report.changes.len() as u64);
    histogram!("diff_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    Ok(report)
}

fn to_json(obj: &DynamicObject) -> Result<Json, ReconcileError> {
    serde_json::to_value(obj).map_err(|e| ReconcileError::Build(format!("encoding object: {}", e)))
}

fn canonical_yaml(v: &Json) -> Result<String, ReconcileError> {
    serde_yaml::to_string(v).map_err(|e| ReconcileError::Build(format!("rendering yaml: {}", e)))
}

fn is_secret(id: &ObjectId) -> bool { id.group.is_empty() && id.kind == "Secret" }

fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Replace Secret payload values; values that differ are marked on the merged side.
fn mask_secret(mut live: Json, mut merged: Json) -> (Json, Json) {
    for field in ["data", "stringData"] {
        let before = live.get(field).cloned();
        if let Some(map) = live.get_mut(field).and_then(|m| m.as_object_mut()) {
            for v in map.values_mut() {
                *v = Json::String(MASK.into());
            }
        }
        if let Some(map) = merged.get_mut(field).and_then(|m| m.as_object_mut()) {
            for (k, v) in map.iter_mut() {
                let same = before.as_ref().and_then(|b| b.get(k)) == Some(&*v);
                *v = Json::String(if same { MASK.into() } else { format!("{} (changed)", MASK) });
            }
        }
    }
    (live, merged)
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
