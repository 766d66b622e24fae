//! Object identity, install ordering and apply stages.

use std::fmt;

use serde::{Deserialize, Serialize};

pub use kube::core::DynamicObject;

use crate::error::ReconcileError;

/// Logical instance owning a set of objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub namespace: String,
}

impl Instance {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into() }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Cluster-unique object identity.
///
/// Version is carried so a stale object can still be addressed, but inventory
/// matching goes through [`ObjectId::inventory_key`], which ignores it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectId {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            namespace: namespace.filter(|s| !s.is_empty()).map(|s| s.to_string()),
            name: name.into(),
        }
    }

    pub fn from_object(obj: &DynamicObject) -> Result<Self, ReconcileError> {
        let types = obj.types.as_ref().ok_or_else(|| ReconcileError::Build("object missing apiVersion/kind".into()))?;
        if types.api_version.is_empty() {
            return Err(ReconcileError::Build("object missing apiVersion".into()));
        }
        if types.kind.is_empty() {
            return Err(ReconcileError::Build(format!("object with apiVersion {} missing kind", types.api_version)));
        }
        let name = obj
            .metadata
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ReconcileError::Build(format!("{} object missing metadata.name", types.kind)))?;
        let (group, version) = split_api_version(&types.api_version);
        Ok(Self::new(group, version, types.kind.clone(), obj.metadata.namespace.as_deref(), name))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Version-agnostic key, `namespace_name_group_kind`.
    pub fn inventory_key(&self) -> String {
        format!("{}_{}_{}_{}", self.namespace.as_deref().unwrap_or(""), self.name, self.group, self.kind)
    }

    pub fn from_inventory_key(key: &str, version: &str) -> Result<Self, ReconcileError> {
        let parts: Vec<&str> = key.split('_').collect();
        match parts.as_slice() {
            [ns, name, group, kind] if !name.is_empty() && !kind.is_empty() => {
                Ok(Self::new(*group, version, *kind, Some(*ns), *name))
            }
            _ => Err(ReconcileError::Build(format!("invalid inventory entry id: {}", key))),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

const INSTALL_ORDER: &[&str] = &[
    "Namespace",
    "NetworkPolicy",
    "ResourceQuota",
    "LimitRange",
    "PodSecurityPolicy",
    "PodDisruptionBudget",
    "ServiceAccount",
    "Secret",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "HorizontalPodAutoscaler",
    "StatefulSet",
    "Job",
    "CronJob",
    "IngressClass",
    "Ingress",
    "APIService",
];

const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
    "IngressClass",
    "RuntimeClass",
    "APIService",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
    "PodSecurityPolicy",
    "CSIDriver",
    "VolumeSnapshotClass",
    "Node",
];

/// Install rank of a kind; unknown kinds (custom resources) go last.
pub fn kind_rank(kind: &str) -> usize {
    INSTALL_ORDER.iter().position(|k| *k == kind).unwrap_or(INSTALL_ORDER.len())
}

/// Built-in kinds known to be cluster-scoped.
pub fn is_cluster_scoped_kind(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

fn kind_of(obj: &DynamicObject) -> &str {
    obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("")
}

fn sort_key(obj: &DynamicObject) -> (usize, &str, &str, &str) {
    let kind = kind_of(obj);
    (
        kind_rank(kind),
        kind,
        obj.metadata.namespace.as_deref().unwrap_or(""),
        obj.metadata.name.as_deref().unwrap_or(""),
    )
}

/// Deterministic install order: kind rank, kind, namespace, name.
pub fn sort_objects(objects: &mut [DynamicObject]) {
    objects.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
}

/// Same ordering over identities.
pub fn sort_ids(ids: &mut [ObjectId]) {
    ids.sort_by(|a, b| {
        (kind_rank(&a.kind), &a.kind, a.namespace.as_deref().unwrap_or(""), &a.name).cmp(&(
            kind_rank(&b.kind),
            &b.kind,
            b.namespace.as_deref().unwrap_or(""),
            &b.name,
        ))
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// CRDs and namespaces: everything else may depend on them.
    Definitions,
    ClusterScoped,
    Namespaced,
}

impl Stage {
    pub fn of(obj: &DynamicObject) -> Self {
        match kind_of(obj) {
            "CustomResourceDefinition" | "Namespace" => Stage::Definitions,
            _ if obj.metadata.namespace.as_deref().map(|s| s.is_empty()).unwrap_or(true) => Stage::ClusterScoped,
            _ => Stage::Namespaced,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Definitions => "definitions",
            Stage::ClusterScoped => "cluster",
            Stage::Namespaced => "namespaced",
        };
        f.write_str(s)
    }
}

/// Split objects into non-empty stages in apply order, each sorted.
pub fn stage_objects(objects: Vec<DynamicObject>) -> Vec<(Stage, Vec<DynamicObject>)> {
    let mut stages: Vec<(Stage, Vec<DynamicObject>)> = vec![
        (Stage::Definitions, Vec::new()),
        (Stage::ClusterScoped, Vec::new()),
        (Stage::Namespaced, Vec::new()),
    ];
    for obj in objects {
        let idx = match Stage::of(&obj) {
            Stage::Definitions => 0,
            Stage::ClusterScoped => 1,
            Stage::Namespaced => 2,
        };
        stages[idx].1.push(obj);
    }
    stages.retain(|(_, v)| !v.is_empty());
    for (_, v) in stages.iter_mut() {
        sort_objects(v);
    }
    stages
}
