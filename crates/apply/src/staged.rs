//! Staged server-side apply.

use std::time::Instant as StdInstant;

use keel_core::{stage_objects, Action, ChangeSet, DynamicObject, ObjectId, Partial, ReconcileConfig, ReconcileError, Stage};
use keel_kubehub::{ApplyOptions, ClusterClient};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::diff::diff_object;
use crate::wait::{wait_ready, WaitOptions};
use crate::within;

/// Apply `objects` stage by stage: definitions, cluster-scoped, namespaced.
///
/// Unchanged objects are not written. The first failure stops the run and is
/// returned with every change recorded before it; nothing is rolled back.
pub async fn apply_all_staged(
    client: &dyn ClusterClient,
    objects: Vec<DynamicObject>,
    cfg: &ReconcileConfig,
    deadline: Instant,
) -> Result<ChangeSet, Partial> {
    let opts = ApplyOptions::from_config(cfg);
    let mut changes = ChangeSet::new();
    for (stage, batch) in stage_objects(objects) {
        info!(%stage, objects = batch.len(), "applying stage");
        let mut applied = Vec::with_capacity(batch.len());
        for obj in &batch {
            match within(deadline, "apply", apply_one(client, obj, &opts)).await.and_then(|r| r) {
                Ok((id, action)) => {
                    applied.push(id.clone());
                    changes.add(id, action);
                }
                Err(e) => return Err(Partial::new(changes, e)),
            }
        }
        // Custom resources cannot be admitted before their definitions are established.
        if stage == Stage::Definitions && cfg.wait {
            if let Err(e) = wait_ready(client, &applied, &WaitOptions::from_config(cfg), deadline).await {
                return Err(Partial::new(changes, e));
            }
        }
    }
    Ok(changes)
}

async fn apply_one(client: &dyn ClusterClient, obj: &DynamicObject, opts: &ApplyOptions) -> Result<(ObjectId, Action), ReconcileError> {
    let t0 = StdInstant::now();
    let id = ObjectId::from_object(obj)?;
    let outcome = diff_object(client, obj, opts).await.map_err(|e| match e {
        ReconcileError::DryRun { id, source } => ReconcileError::Apply { id, source },
        other => other,
    })?;
    if outcome.action == Action::Unchanged {
        debug!(object = %id, "unchanged; skipping write");
        return Ok((id, Action::Unchanged));
    }
    match client.apply(obj, opts).await {
        Ok(_) => {
            histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            counter!("apply_ok", 1u64);
            info!(object = %id, action = %outcome.action, "applied");
            Ok((id, outcome.action))
        }
        Err(source) => {
            counter!("apply_err", 1u64);
            Err(ReconcileError::Apply { id, source })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ClusterError, Readiness};
    use keel_kubehub::MemoryCluster;
    use std::time::Duration;

    fn obj(v: serde_json::Value) -> DynamicObject { serde_json::from_value(v).unwrap() }

    fn cm(name: &str, value: &str) -> DynamicObject {
        obj(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "web" },
            "data": { "k": value }
        }))
    }

    fn crd() -> DynamicObject {
        obj(serde_json::json!({
            "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition",
            "metadata": { "name": "widgets.example.com" },
            "spec": { "group": "example.com" },
            "status": { "conditions": [{ "type": "Established", "status": "True" }] }
        }))
    }

    fn cfg() -> ReconcileConfig { ReconcileConfig::default().with_poll_interval(Duration::from_millis(10)) }

    fn deadline() -> Instant { Instant::now() + Duration::from_secs(2) }

    #[tokio::test]
    async fn stages_apply_definitions_then_cluster_then_namespaced() {
        let c = MemoryCluster::new();
        let role = obj(serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": { "name": "reader" }
        }));
        let ns = obj(serde_json::json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "web" } }));
        let changes = apply_all_staged(&c, vec![cm("a", "1"), role, crd(), ns], &cfg(), deadline()).await.unwrap();
        let order: Vec<String> = changes.iter().map(|e| e.to_string()).collect();
        assert_eq!(
            order,
            vec![
                "Namespace/web created",
                "CustomResourceDefinition/widgets.example.com created",
                "ClusterRole/reader created",
                "ConfigMap/web/a created",
            ]
        );
    }

    #[tokio::test]
    async fn unchanged_objects_are_not_written() {
        let c = MemoryCluster::new();
        apply_all_staged(&c, vec![cm("a", "1"), cm("b", "1")], &cfg(), deadline()).await.unwrap();
        let writes_before = c.calls().iter().filter(|l| l.starts_with("apply ")).count();
        let again = apply_all_staged(&c, vec![cm("a", "1"), cm("b", "2")], &cfg(), deadline()).await.unwrap();
        assert_eq!(again.count(Action::Unchanged), 1);
        assert_eq!(again.count(Action::Configured), 1);
        let writes_after = c.calls().iter().filter(|l| l.starts_with("apply ")).count();
        assert_eq!(writes_after - writes_before, 1);
    }

    #[tokio::test]
    async fn fails_fast_with_partial_changes() {
        let c = MemoryCluster::new();
        c.fail_apply_on("b", ClusterError::Api { code: 422, message: "invalid".into() });
        let partial = apply_all_staged(&c, vec![cm("c", "1"), cm("b", "1"), cm("a", "1")], &cfg(), deadline()).await.unwrap_err();
        assert_eq!(partial.changes.len(), 1);
        assert_eq!(partial.changes.iter().next().unwrap().id.name, "a");
        assert!(matches!(&partial.error, ReconcileError::Apply { id, .. } if id.name == "b"));
        assert!(!c.contains(&ObjectId::from_object(&cm("c", "1")).unwrap()));
    }

    #[tokio::test]
    async fn dry_run_rejection_is_an_apply_error() {
        let c = MemoryCluster::new();
        c.fail_dry_run_on("a", ClusterError::Api { code: 400, message: "bad field".into() });
        let partial = apply_all_staged(&c, vec![cm("a", "1")], &cfg(), deadline()).await.unwrap_err();
        assert!(partial.changes.is_empty());
        assert_eq!(partial.error.to_string(), "ConfigMap/web/a apply failed: api error (400): bad field");
    }

    #[tokio::test]
    async fn definitions_must_be_ready_before_later_stages() {
        let c = MemoryCluster::new();
        let crd_id = ObjectId::from_object(&crd()).unwrap();
        c.set_readiness(&crd_id, Readiness::InProgress("not established".into()));
        let partial = apply_all_staged(&c, vec![crd(), cm("a", "1")], &cfg(), Instant::now() + Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(partial.error.is_timeout());
        assert_eq!(partial.changes.len(), 1);
        assert!(!c.calls().iter().any(|l| l == "apply ConfigMap/web/a"));
    }
}
