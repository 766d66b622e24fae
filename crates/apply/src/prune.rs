//! Deletion of stale objects.

use keel_core::{Action, ChangeSet, Instance, ObjectId, Owner, Partial, ReconcileError};
use keel_kubehub::ClusterClient;
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::within;

/// Delete `stale` in the given order with background propagation.
///
/// Objects already gone are omitted. Objects no longer labelled for `instance`, or
/// annotated `<group>/prune: disabled`, are recorded as skipped and left in place.
pub async fn delete_all(
    client: &dyn ClusterClient,
    stale: &[ObjectId],
    owner: &Owner,
    instance: &Instance,
    deadline: Instant,
) -> Result<ChangeSet, Partial> {
    let mut changes = ChangeSet::new();
    for id in stale {
        match within(deadline, "prune", delete_one(client, id, owner, instance)).await.and_then(|r| r) {
            Ok(Some(action)) => changes.add(id.clone(), action),
            Ok(None) => debug!(object = %id, "already gone"),
            Err(e) => {
                counter!("prune_err", 1u64);
                return Err(Partial::new(changes, e));
            }
        }
    }
    Ok(changes)
}

async fn delete_one(client: &dyn ClusterClient, id: &ObjectId, owner: &Owner, instance: &Instance) -> Result<Option<Action>, ReconcileError> {
    let err = |source| ReconcileError::Prune { id: id.clone(), source };
    let Some(live) = client.get(id).await.map_err(err)? else { return Ok(None) };
    if !owner.owns(&live, instance) {
        warn!(object = %id, %instance, "owner labels changed; not deleting");
        counter!("prune_skipped", 1u64);
        return Ok(Some(Action::Skipped));
    }
    if owner.prune_disabled(&live) {
        info!(object = %id, "prune disabled by annotation");
        counter!("prune_skipped", 1u64);
        return Ok(Some(Action::Skipped));
    }
    if !client.delete(id).await.map_err(err)? {
        return Ok(None);
    }
    counter!("prune_ok", 1u64);
    info!(object = %id, "deleted");
    Ok(Some(Action::Deleted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ClusterError, DynamicObject};
    use keel_kubehub::{ApplyOptions, MemoryCluster};
    use std::time::Duration;

    fn instance() -> Instance { Instance::new("api", "web") }

    fn owned(name: &str) -> DynamicObject {
        let mut o: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "web" }
        }))
        .unwrap();
        Owner::default().stamp(&mut o, &instance());
        o
    }

    async fn seed(c: &MemoryCluster, objs: Vec<DynamicObject>) -> Vec<ObjectId> {
        let ao = ApplyOptions { field_manager: "keel".into(), force: true };
        let mut ids = Vec::new();
        for o in objs {
            c.apply(&o, &ao).await.unwrap();
            ids.push(ObjectId::from_object(&o).unwrap());
        }
        ids
    }

    fn deadline() -> Instant { Instant::now() + Duration::from_secs(1) }

    #[tokio::test]
    async fn deletes_owned_and_skips_foreign_or_protected() {
        let c = MemoryCluster::new();
        let mut foreign = owned("b");
        Owner::default().stamp(&mut foreign, &Instance::new("other", "web"));
        let mut protected = owned("c");
        protected.metadata.annotations.get_or_insert_with(Default::default).insert("keel.dev/prune".into(), "Disabled".into());
        let ids = seed(&c, vec![owned("a"), foreign, protected]).await;
        let gone = ObjectId::new("", "v1", "ConfigMap", Some("web"), "gone");

        let mut stale = ids.clone();
        stale.push(gone);
        let changes = delete_all(&c, &stale, &Owner::default(), &instance(), deadline()).await.unwrap();
        let got: Vec<String> = changes.iter().map(|e| e.to_string()).collect();
        assert_eq!(got, vec!["ConfigMap/web/a deleted", "ConfigMap/web/b skipped", "ConfigMap/web/c skipped"]);
        assert!(!c.contains(&ids[0]));
        assert!(c.contains(&ids[1]) && c.contains(&ids[2]));
    }

    #[tokio::test]
    async fn fails_fast_with_partial_changes() {
        let c = MemoryCluster::new();
        let ids = seed(&c, vec![owned("a"), owned("b"), owned("c")]).await;
        c.fail_delete_on("b", ClusterError::Api { code: 403, message: "forbidden".into() });
        let partial = delete_all(&c, &ids, &Owner::default(), &instance(), deadline()).await.unwrap_err();
        assert_eq!(partial.changes.len(), 1);
        assert!(matches!(&partial.error, ReconcileError::Prune { id, .. } if id == &ids[1]));
        assert!(c.contains(&ids[2]));
    }
}
