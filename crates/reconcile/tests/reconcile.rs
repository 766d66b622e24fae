use std::time::Duration;

use keel_core::prelude::*;
use keel_core::PruneOrdering;
use keel_inventory::InventoryStore;
use keel_kubehub::MemoryCluster;
use keel_reconcile::{Mode, Reconciler, Request, Step};

fn cm(name: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": "web" },
        "data": { "name": name }
    }))
    .unwrap()
}

fn id(name: &str) -> ObjectId { ObjectId::new("", "v1", "ConfigMap", Some("web"), name) }

fn instance() -> Instance { Instance::new("api", "web") }

fn request(names: &[&str]) -> Request {
    Request {
        instance: instance(),
        source: "./module".into(),
        version: "1.0.0".into(),
        objects: names.iter().map(|n| cm(n)).collect(),
    }
}

fn cfg() -> ReconcileConfig {
    ReconcileConfig::default().with_poll_interval(Duration::from_millis(10)).with_timeout(Duration::from_secs(2))
}

async fn stored_members(cluster: &MemoryCluster) -> Vec<String> {
    let store = InventoryStore::new(cluster, &Owner::default());
    match store.load(&instance()).await.unwrap() {
        Some(inv) => inv.ids().unwrap().iter().map(|i| i.name.clone()).collect(),
        None => Vec::new(),
    }
}

fn object_writes(cluster: &MemoryCluster) -> usize {
    cluster.calls().iter().filter(|c| c.starts_with("apply ") && !c.ends_with("keel.api")).count()
}

#[tokio::test]
async fn second_run_is_a_noop() {
    let cluster = MemoryCluster::new();
    let cfg = cfg();
    let r = Reconciler::new(&cluster, &cfg);

    let first = r.run(request(&["a", "b"]), Mode::Apply).await.unwrap();
    assert_eq!(first.applied.count(Action::Created), 2);
    let writes = object_writes(&cluster);
    let snapshot = (cluster.object(&id("a")), cluster.object(&id("b")));

    let second = r.run(request(&["b", "a"]), Mode::Apply).await.unwrap();
    assert!(second.applied.is_noop());
    assert!(second.stale.is_empty() && second.pruned.is_empty());
    assert_eq!(object_writes(&cluster), writes);
    assert_eq!((cluster.object(&id("a")), cluster.object(&id("b"))), snapshot);
}

#[tokio::test]
async fn removed_objects_are_pruned() {
    let cluster = MemoryCluster::new();
    let cfg = cfg();
    let r = Reconciler::new(&cluster, &cfg);
    r.run(request(&["a", "b", "c"]), Mode::Apply).await.unwrap();

    let report = r.run(request(&["a", "c", "d"]), Mode::Apply).await.unwrap();
    assert_eq!(report.stale, vec![id("b")]);
    let pruned: Vec<String> = report.pruned.iter().map(|e| e.to_string()).collect();
    assert_eq!(pruned, vec!["ConfigMap/web/b deleted"]);
    assert!(!cluster.contains(&id("b")));
    assert!(cluster.contains(&id("d")));
    assert_eq!(stored_members(&cluster).await, vec!["a", "c", "d"]);
    assert_eq!(
        report.steps,
        vec![Step::Label, Step::Apply, Step::ComputeStale, Step::PersistInventory, Step::Prune, Step::WaitReady, Step::WaitTerminated]
    );
}

#[tokio::test]
async fn failed_persist_keeps_old_inventory_and_rerun_recovers() {
    let cluster = MemoryCluster::new();
    let cfg = cfg();
    let r = Reconciler::new(&cluster, &cfg);
    r.run(request(&["a", "b"]), Mode::Apply).await.unwrap();

    cluster.fail_apply_on("keel.api", ClusterError::Transport("connection reset".into()));
    let failure = r.run(request(&["a"]), Mode::Apply).await.unwrap_err();
    assert_eq!(failure.step, Step::PersistInventory);
    assert!(matches!(failure.error, ReconcileError::InventoryWrite(_)));
    assert_eq!(failure.report.stale, vec![id("b")]);
    assert!(failure.report.pruned.is_empty());
    assert!(cluster.contains(&id("b")), "nothing is pruned before the inventory is written");
    assert_eq!(stored_members(&cluster).await, vec!["a", "b"]);

    cluster.clear_failures();
    let report = r.run(request(&["a"]), Mode::Apply).await.unwrap();
    assert_eq!(report.stale, vec![id("b")]);
    assert!(!cluster.contains(&id("b")));
    assert_eq!(stored_members(&cluster).await, vec!["a"]);
}

#[tokio::test]
async fn apply_fails_fast_and_leaves_inventory_alone() {
    let cluster = MemoryCluster::new();
    cluster.fail_apply_on("b", ClusterError::Api { code: 422, message: "invalid".into() });
    let cfg = cfg();
    let failure = Reconciler::new(&cluster, &cfg).run(request(&["b", "a"]), Mode::Apply).await.unwrap_err();
    assert_eq!(failure.step, Step::Apply);
    assert_eq!(failure.report.applied.len(), 1);
    assert_eq!(failure.report.applied.iter().next().unwrap().id, id("a"));
    assert_eq!(failure.error.object(), Some(&id("b")));
    assert!(stored_members(&cluster).await.is_empty());
}

#[tokio::test]
async fn dry_run_is_ordered_and_writes_nothing() {
    let cluster = MemoryCluster::new();
    let cfg = cfg();
    let r = Reconciler::new(&cluster, &cfg);
    let one = r.run(request(&["c", "a", "b"]), Mode::DryRun { detailed: true }).await.unwrap();
    let two = r.run(request(&["b", "c", "a"]), Mode::DryRun { detailed: true }).await.unwrap();
    let (one, two) = (one.diff.unwrap(), two.diff.unwrap());
    assert_eq!(one.lines, two.lines);
    assert_eq!(one.lines[0], "created ConfigMap/web/a (server dry run)");
    assert!(cluster.is_empty());
    assert_eq!(object_writes(&cluster), 0);
}

#[tokio::test]
async fn timeout_names_only_the_pending_object() {
    let cluster = MemoryCluster::new();
    cluster.set_readiness(&id("b"), Readiness::InProgress("rolling out".into()));
    let cfg = cfg().with_timeout(Duration::from_millis(200));
    let failure = Reconciler::new(&cluster, &cfg).run(request(&["a", "b", "c"]), Mode::Apply).await.unwrap_err();
    assert_eq!(failure.step, Step::WaitReady);
    assert!(failure.error.is_timeout());
    assert!(matches!(&failure.error, ReconcileError::Timeout { pending } if pending == &vec![id("b")]));
    assert_eq!(failure.report.applied.len(), 3);
}

#[tokio::test]
async fn prune_failure_depends_on_ordering() {
    for (ordering, tracked) in [(PruneOrdering::PersistThenPrune, vec!["a"]), (PruneOrdering::PruneThenPersist, vec!["a", "b"])] {
        let cluster = MemoryCluster::new();
        let cfg = cfg().with_prune_ordering(ordering);
        let r = Reconciler::new(&cluster, &cfg);
        r.run(request(&["a", "b"]), Mode::Apply).await.unwrap();

        cluster.fail_delete_on("b", ClusterError::Api { code: 403, message: "forbidden".into() });
        let failure = r.run(request(&["a"]), Mode::Apply).await.unwrap_err();
        assert_eq!(failure.step, Step::Prune, "{:?}", ordering);
        assert!(cluster.contains(&id("b")));
        assert_eq!(stored_members(&cluster).await, tracked, "{:?}", ordering);
    }
}

#[tokio::test]
async fn termination_wait_covers_finalized_objects() {
    let cluster = MemoryCluster::new();
    let cfg = cfg().with_timeout(Duration::from_millis(200));
    let r = Reconciler::new(&cluster, &cfg);
    r.run(request(&["a", "b"]), Mode::Apply).await.unwrap();

    cluster.hold_deletion(&id("b"));
    let failure = r.run(request(&["a"]), Mode::Apply).await.unwrap_err();
    assert_eq!(failure.step, Step::WaitTerminated);
    assert!(matches!(&failure.error, ReconcileError::Timeout { pending } if pending == &vec![id("b")]));

    cluster.release_deletion(&id("b"));
    let report = r.run(request(&["a"]), Mode::Apply).await.unwrap();
    assert!(report.stale.is_empty());
    assert!(!cluster.contains(&id("b")));
}

#[tokio::test]
async fn foreign_objects_are_not_pruned() {
    let cluster = MemoryCluster::new();
    let cfg = cfg();
    let r = Reconciler::new(&cluster, &cfg);
    r.run(request(&["a", "b"]), Mode::Apply).await.unwrap();

    // Another instance takes over b.
    let mut b = cm("b");
    Owner::default().stamp(&mut b, &Instance::new("other", "web"));
    cluster.insert(b).unwrap();

    let report = r.run(request(&["a"]), Mode::Apply).await.unwrap();
    assert_eq!(report.pruned.count(Action::Skipped), 1);
    assert!(cluster.contains(&id("b")));
}

#[tokio::test]
async fn disabled_prune_keeps_stale_objects_tracked() {
    let cluster = MemoryCluster::new();
    let cfg = ReconcileConfig { prune: false, ..cfg() };
    let r = Reconciler::new(&cluster, &cfg);
    r.run(request(&["a", "b"]), Mode::Apply).await.unwrap();

    let report = r.run(request(&["a"]), Mode::Apply).await.unwrap();
    assert_eq!(report.stale, vec![id("b")]);
    assert!(report.pruned.is_empty());
    assert!(cluster.contains(&id("b")));
    assert_eq!(stored_members(&cluster).await, vec!["a", "b"]);
}

#[tokio::test]
async fn invalid_objects_fail_before_any_cluster_call() {
    let cluster = MemoryCluster::new();
    let mut req = request(&["a"]);
    req.objects.push(serde_json::from_value(serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": {} })).unwrap());
    let cfg = cfg();
    let failure = Reconciler::new(&cluster, &cfg).run(req, Mode::Apply).await.unwrap_err();
    assert_eq!(failure.step, Step::Label);
    assert!(matches!(failure.error, ReconcileError::Build(_)));
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn objects_carry_owner_labels() {
    let cluster = MemoryCluster::new();
    let cfg = cfg();
    Reconciler::new(&cluster, &cfg).run(request(&["a"]), Mode::Apply).await.unwrap();
    let live = cluster.object(&id("a")).unwrap();
    assert!(Owner::default().owns(&live, &instance()));
    let annotations = live.metadata.annotations.unwrap();
    assert_eq!(annotations.get("keel.dev/field-manager").map(String::as_str), Some("keel"));
}

#[tokio::test]
async fn unbounded_timeout_runs_normally() {
    let cluster = MemoryCluster::new();
    let cfg = cfg().with_timeout(Duration::MAX);
    let report = Reconciler::new(&cluster, &cfg).run(request(&["a"]), Mode::Apply).await.unwrap();
    assert_eq!(report.applied.count(Action::Created), 1);
}
