//! Keel inventory: the set of objects an instance owns, and where it is stored.
//!
//! An inventory lives in the cluster as a ConfigMap named `<fieldManager>.<instance>`
//! in the instance namespace, so it survives restarts and other processes can read it.
//! It always describes the last desired set that applied successfully.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use keel_core::object::{kind_rank, sort_ids};
use keel_core::{DynamicObject, Instance, ObjectId, Owner, ReconcileError};
use keel_kubehub::{ApplyOptions, ClusterClient};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One owned object: version-agnostic key plus the version it was applied with.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub id: String,
    pub v: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub name: String,
    pub namespace: String,
    pub source: String,
    pub version: String,
    pub entries: Vec<InventoryEntry>,
}

impl Inventory {
    pub fn new(instance: &Instance) -> Self {
        Self {
            name: instance.name.clone(),
            namespace: instance.namespace.clone(),
            source: String::new(),
            version: String::new(),
            entries: Vec::new(),
        }
    }

    pub fn instance(&self) -> Instance { Instance::new(self.name.clone(), self.namespace.clone()) }

    pub fn set_source(&mut self, source: impl Into<String>, version: impl Into<String>) {
        self.source = source.into();
        self.version = version.into();
    }

    pub fn add_ids<'a>(&mut self, ids: impl IntoIterator<Item = &'a ObjectId>) {
        let mut by_key: BTreeMap<String, String> = self.entries.drain(..).map(|e| (e.id, e.v)).collect();
        for id in ids {
            by_key.insert(id.inventory_key(), id.version.clone());
        }
        self.entries = by_key.into_iter().map(|(id, v)| InventoryEntry { id, v }).collect();
    }

    /// Record every object as a member. Entries stay sorted and unique by key.
    pub fn add_objects(&mut self, objects: &[DynamicObject]) -> Result<(), ReconcileError> {
        let ids = objects.iter().map(ObjectId::from_object).collect::<Result<Vec<_>, _>>()?;
        self.add_ids(ids.iter());
        Ok(())
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn keys(&self) -> BTreeSet<&str> { self.entries.iter().map(|e| e.id.as_str()).collect() }

    pub fn ids(&self) -> Result<Vec<ObjectId>, ReconcileError> {
        self.entries.iter().map(|e| ObjectId::from_inventory_key(&e.id, &e.v)).collect()
    }

    /// Members of `self` absent from `newer`, namespaced objects before their namespaces.
    pub fn stale_against(&self, newer: &Inventory) -> Result<Vec<ObjectId>, ReconcileError> {
        let keep = newer.keys();
        let mut stale = self
            .entries
            .iter()
            .filter(|e| !keep.contains(e.id.as_str()))
            .map(|e| ObjectId::from_inventory_key(&e.id, &e.v))
            .collect::<Result<Vec<_>, _>>()?;
        sort_ids(&mut stale);
        stale.reverse();
        Ok(stale)
    }
}

/// Reads and writes inventories through a [`ClusterClient`].
pub struct InventoryStore<'a> {
    client: &'a dyn ClusterClient,
    owner: Owner,
    opts: ApplyOptions,
}

impl<'a> InventoryStore<'a> {
    pub fn new(client: &'a dyn ClusterClient, owner: &Owner) -> Self {
        Self {
            client,
            owner: owner.clone(),
            opts: ApplyOptions { field_manager: owner.field.clone(), force: true },
        }
    }

    /// Identity of the ConfigMap holding `instance`'s inventory.
    pub fn object_id(&self, instance: &Instance) -> ObjectId {
        ObjectId::new("", "v1", "ConfigMap", Some(&instance.namespace), format!("{}.{}", self.owner.field, instance.name))
    }

    pub async fn load(&self, instance: &Instance) -> Result<Option<Inventory>, ReconcileError> {
        let id = self.object_id(instance);
        let obj = self.client.get(&id).await.map_err(|e| ReconcileError::InventoryRead(format!("{}: {}", id, e)))?;
        match obj {
            Some(o) => decode(instance, &o).map(Some),
            None => Ok(None),
        }
    }

    /// Stored members missing from `new`. No stored inventory means nothing is stale.
    pub async fn compute_stale(&self, new: &Inventory) -> Result<Vec<ObjectId>, ReconcileError> {
        let Some(old) = self.load(&new.instance()).await? else {
            debug!(instance = %new.instance(), "no stored inventory");
            return Ok(Vec::new());
        };
        let stale = old.stale_against(new)?;
        debug!(instance = %new.instance(), stale = stale.len(), "computed stale objects");
        Ok(stale)
    }

    /// Overwrite the stored inventory with `new`.
    pub async fn persist(&self, new: &Inventory) -> Result<(), ReconcileError> {
        let obj = self.encode(new)?;
        match self.client.apply(&obj, &self.opts).await {
            Ok(_) => {
                counter!("inventory_persist_ok", 1u64);
                Ok(())
            }
            Err(e) => {
                counter!("inventory_persist_err", 1u64);
                Err(ReconcileError::InventoryWrite(format!("{}: {}", self.object_id(&new.instance()), e)))
            }
        }
    }

    fn encode(&self, inv: &Inventory) -> Result<DynamicObject, ReconcileError> {
        let instance = inv.instance();
        let id = self.object_id(&instance);
        let entries = serde_json::to_string(&inv.entries).map_err(|e| ReconcileError::InventoryWrite(e.to_string()))?;
        let mut obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": id.name, "namespace": instance.namespace },
            "data": { "source": inv.source, "version": inv.version, "inventory": entries }
        }))
        .map_err(|e| ReconcileError::InventoryWrite(e.to_string()))?;
        self.owner.stamp(&mut obj, &instance);
        Ok(obj)
    }
}

fn decode(instance: &Instance, obj: &DynamicObject) -> Result<Inventory, ReconcileError> {
    let field = |k: &str| obj.data.get("data").and_then(|d| d.get(k)).and_then(|v| v.as_str()).unwrap_or("").to_string();
    let raw = field("inventory");
    let mut entries: Vec<InventoryEntry> = if raw.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&raw).map_err(|e| ReconcileError::InventoryRead(format!("decoding inventory entries: {}", e)))?
    };
    entries.sort();
    entries.dedup_by(|a, b| a.id == b.id);
    Ok(Inventory {
        name: instance.name.clone(),
        namespace: instance.namespace.clone(),
        source: field("source"),
        version: field("version"),
        entries,
    })
}

/// Install-order rank of an entry, for callers rendering inventories.
pub fn entry_rank(entry: &InventoryEntry) -> usize {
    entry.id.rsplit('_').next().map(kind_rank).unwrap_or(usize::MAX)
}
