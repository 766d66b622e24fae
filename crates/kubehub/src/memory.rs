//! In-memory cluster for tests and offline runs.
//!
//! Server-side apply is emulated as a recursive merge of the applied object over
//! the live one. Failures can be injected per object name, readiness can be
//! pinned per object, and deletions can be held as if blocked by a finalizer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use keel_core::{readiness, ClusterError, DynamicObject, ObjectId, Readiness};
use serde_json::Value as Json;

use crate::{ApplyOptions, ClusterClient};

#[derive(Default)]
struct State {
    objects: BTreeMap<String, DynamicObject>,
    next_rv: u64,
    fail_apply: HashMap<String, ClusterError>,
    fail_dry_run: HashMap<String, ClusterError>,
    fail_delete: HashMap<String, ClusterError>,
    fail_get: HashMap<String, ClusterError>,
    readiness: HashMap<String, Readiness>,
    held: HashSet<String>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    /// Seed a live object as if another process had created it.
    pub fn insert(&self, obj: DynamicObject) -> Result<(), ClusterError> {
        let id = ObjectId::from_object(&obj).map_err(|e| ClusterError::Decode(e.to_string()))?;
        self.state.lock().unwrap().objects.insert(id.inventory_key(), obj);
        Ok(())
    }

    pub fn object(&self, id: &ObjectId) -> Option<DynamicObject> {
        self.state.lock().unwrap().objects.get(&id.inventory_key()).cloned()
    }

    pub fn contains(&self, id: &ObjectId) -> bool { self.object(id).is_some() }

    pub fn len(&self) -> usize { self.state.lock().unwrap().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn fail_apply_on(&self, name: &str, err: ClusterError) {
        self.state.lock().unwrap().fail_apply.insert(name.to_string(), err);
    }

    pub fn fail_dry_run_on(&self, name: &str, err: ClusterError) {
        self.state.lock().unwrap().fail_dry_run.insert(name.to_string(), err);
    }

    pub fn fail_delete_on(&self, name: &str, err: ClusterError) {
        self.state.lock().unwrap().fail_delete.insert(name.to_string(), err);
    }

    pub fn fail_get_on(&self, name: &str, err: ClusterError) {
        self.state.lock().unwrap().fail_get.insert(name.to_string(), err);
    }

    pub fn clear_failures(&self) {
        let mut st = self.state.lock().unwrap();
        st.fail_apply.clear();
        st.fail_dry_run.clear();
        st.fail_delete.clear();
        st.fail_get.clear();
    }

    /// Pin the readiness reported for an object, overriding its predicate.
    pub fn set_readiness(&self, id: &ObjectId, r: Readiness) {
        self.state.lock().unwrap().readiness.insert(id.inventory_key(), r);
    }

    /// Deletes of this object only mark it terminating until released.
    pub fn hold_deletion(&self, id: &ObjectId) {
        self.state.lock().unwrap().held.insert(id.inventory_key());
    }

    /// Drop the hold and finish a pending delete, if any.
    pub fn release_deletion(&self, id: &ObjectId) {
        let key = id.inventory_key();
        let mut st = self.state.lock().unwrap();
        st.held.remove(&key);
        let terminating = st.objects.get(&key).map(|o| o.metadata.deletion_timestamp.is_some()).unwrap_or(false);
        if terminating {
            st.objects.remove(&key);
        }
    }

    /// Operations in call order, e.g. `apply ConfigMap/web/cfg`.
    pub fn calls(&self) -> Vec<String> { self.state.lock().unwrap().calls.clone() }

    fn server_apply(&self, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject, ClusterError> {
        let id = ObjectId::from_object(obj).map_err(|e| ClusterError::Decode(e.to_string()))?;
        let key = id.inventory_key();
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("{} {}", if dry_run { "dry-run" } else { "apply" }, id));
        let injected = if dry_run { st.fail_dry_run.get(&id.name) } else { st.fail_apply.get(&id.name) };
        if let Some(e) = injected {
            return Err(e.clone());
        }

        let desired = to_json(obj)?;
        let live = st.objects.get(&key).map(to_json).transpose()?;
        let merged_json = match &live {
            Some(l) => merge(l, &desired),
            None => desired,
        };
        let mut merged: DynamicObject = from_json(merged_json.clone())?;
        if dry_run {
            return Ok(merged);
        }
        if live.as_ref() != Some(&merged_json) {
            st.next_rv += 1;
            merged.metadata.resource_version = Some(st.next_rv.to_string());
            if merged.data.get("spec") != live.as_ref().and_then(|l| l.get("spec")) {
                merged.metadata.generation = Some(merged.metadata.generation.unwrap_or(0) + 1);
            }
            if merged.metadata.uid.is_none() {
                merged.metadata.uid = Some(format!("uid-{}", st.next_rv));
            }
        }
        st.objects.insert(key, merged.clone());
        Ok(merged)
    }
}

fn to_json(obj: &DynamicObject) -> Result<Json, ClusterError> {
    serde_json::to_value(obj).map_err(|e| ClusterError::Decode(e.to_string()))
}

fn from_json(v: Json) -> Result<DynamicObject, ClusterError> {
    serde_json::from_value(v).map_err(|e| ClusterError::Decode(e.to_string()))
}

/// Maps merge key by key; anything else in `over` replaces `base`.
fn merge(base: &Json, over: &Json) -> Json {
    match (base, over) {
        (Json::Object(b), Json::Object(o)) => {
            let mut out = b.clone();
            for (k, ov) in o {
                let next = match b.get(k) {
                    Some(bv) => merge(bv, ov),
                    None => ov.clone(),
                };
                out.insert(k.clone(), next);
            }
            Json::Object(out)
        }
        (_, o) => o.clone(),
    }
}

#[async_trait::async_trait]
impl ClusterClient for MemoryCluster {
    async fn dry_run_apply(&self, obj: &DynamicObject, _opts: &ApplyOptions) -> Result<DynamicObject, ClusterError> {
        self.server_apply(obj, true)
    }

    async fn apply(&self, obj: &DynamicObject, _opts: &ApplyOptions) -> Result<DynamicObject, ClusterError> {
        self.server_apply(obj, false)
    }

    async fn get(&self, id: &ObjectId) -> Result<Option<DynamicObject>, ClusterError> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("get {}", id));
        if let Some(e) = st.fail_get.get(&id.name) {
            return Err(e.clone());
        }
        Ok(st.objects.get(&id.inventory_key()).cloned())
    }

    async fn delete(&self, id: &ObjectId) -> Result<bool, ClusterError> {
        let key = id.inventory_key();
        let mut st = self.state.lock().unwrap();
        st.calls.push(format!("delete {}", id));
        if let Some(e) = st.fail_delete.get(&id.name) {
            return Err(e.clone());
        }
        if st.held.contains(&key) {
            let Some(obj) = st.objects.get(&key).cloned() else { return Ok(false) };
            let mut v = to_json(&obj)?;
            v["metadata"]["deletionTimestamp"] = Json::String("1970-01-01T00:00:00Z".into());
            st.objects.insert(key, from_json(v)?);
            return Ok(true);
        }
        Ok(st.objects.remove(&key).is_some())
    }

    async fn poll_ready(&self, id: &ObjectId) -> Result<Readiness, ClusterError> {
        let st = self.state.lock().unwrap();
        let key = id.inventory_key();
        let Some(obj) = st.objects.get(&key) else { return Ok(Readiness::InProgress("not found".into())) };
        Ok(st.readiness.get(&key).cloned().unwrap_or_else(|| readiness::evaluate(obj)))
    }
}
