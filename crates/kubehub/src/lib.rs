//! Keel kubehub: the cluster capability the reconcile core depends on.
//!
//! [`ClusterClient`] is the only way the core touches a cluster. [`KubeCluster`]
//! implements it with kube-rs dynamic objects; [`memory::MemoryCluster`] is an
//! in-process stand-in with failure injection for tests.

#![forbid(unsafe_code)]

pub mod memory;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use keel_core::{readiness, ClusterError, DynamicObject, ObjectId, Readiness};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::GroupVersionKind,
    discovery::{ApiResource, Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use tokio::sync::RwLock;
use tracing::debug;

pub use memory::MemoryCluster;

/// Server-side apply parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    pub field_manager: String,
    pub force: bool,
}

impl ApplyOptions {
    pub fn from_config(cfg: &keel_core::ReconcileConfig) -> Self {
        Self { field_manager: cfg.owner.field.clone(), force: cfg.force_conflicts }
    }
}

#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Server-side apply without persisting; returns the object the server would store.
    async fn dry_run_apply(&self, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DynamicObject, ClusterError>;

    async fn apply(&self, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DynamicObject, ClusterError>;

    /// `None` when the object (or its resource type) does not exist.
    async fn get(&self, id: &ObjectId) -> Result<Option<DynamicObject>, ClusterError>;

    /// Background-propagation delete. `false` when the object was already gone.
    async fn delete(&self, id: &ObjectId) -> Result<bool, ClusterError>;

    /// One readiness observation.
    async fn poll_ready(&self, id: &ObjectId) -> Result<Readiness, ClusterError> {
        Ok(match self.get(id).await? {
            Some(obj) => readiness::evaluate(&obj),
            None => Readiness::InProgress("not found".into()),
        })
    }

    /// One absence observation.
    async fn poll_absent(&self, id: &ObjectId) -> Result<bool, ClusterError> {
        Ok(self.get(id).await?.is_none())
    }
}

/// kube-rs backed client with a lazily populated discovery cache.
pub struct KubeCluster {
    client: Client,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, discovery: RwLock::new(None) }
    }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client from kubeconfig")?;
        Ok(Self::new(client))
    }

    async fn discovery(&self, refresh: bool) -> Result<Arc<Discovery>, ClusterError> {
        if !refresh {
            if let Some(d) = self.discovery.read().await.as_ref() {
                return Ok(Arc::clone(d));
            }
        }
        let started = Instant::now();
        let d = Arc::new(Discovery::new(self.client.clone()).run().await.map_err(map_kube_err)?);
        histogram!("kube_discovery_ms", started.elapsed().as_secs_f64() * 1000.0);
        *self.discovery.write().await = Some(Arc::clone(&d));
        Ok(d)
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), ClusterError> {
        let found = |d: &Discovery| d.resolve_gvk(gvk).map(|(ar, caps)| (ar, matches!(caps.scope, Scope::Namespaced)));
        if let Some(hit) = found(self.discovery(false).await?.as_ref()) {
            return Ok(hit);
        }
        // Kinds defined by CRDs applied earlier in this run are not in the cache yet.
        debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "discovery miss; refreshing");
        found(self.discovery(true).await?.as_ref())
            .ok_or_else(|| ClusterError::UnknownKind(format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)))
    }

    async fn api(&self, id: &ObjectId) -> Result<Api<DynamicObject>, ClusterError> {
        let gvk = GroupVersionKind::gvk(&id.group, &id.version, &id.kind);
        let (ar, namespaced) = self.resolve(&gvk).await?;
        if namespaced {
            match id.namespace.as_deref() {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
                None => Err(ClusterError::NamespaceRequired(id.kind.clone())),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }

    async fn patch(&self, obj: &DynamicObject, opts: &ApplyOptions, dry_run: bool) -> Result<DynamicObject, ClusterError> {
        let id = ObjectId::from_object(obj).map_err(|e| ClusterError::Decode(e.to_string()))?;
        let api = self.api(&id).await?;
        let mut pp = PatchParams::apply(&opts.field_manager);
        if opts.force {
            pp = pp.force();
        }
        if dry_run {
            pp = pp.dry_run();
        }
        let started = Instant::now();
        let res = api.patch(&id.name, &pp, &Patch::Apply(obj)).await.map_err(map_kube_err);
        histogram!("kube_patch_ms", started.elapsed().as_secs_f64() * 1000.0);
        if res.is_err() {
            counter!("kube_patch_err", 1u64);
        }
        res
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeCluster {
    async fn dry_run_apply(&self, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DynamicObject, ClusterError> {
        self.patch(obj, opts, true).await
    }

    async fn apply(&self, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DynamicObject, ClusterError> {
        self.patch(obj, opts, false).await
    }

    async fn get(&self, id: &ObjectId) -> Result<Option<DynamicObject>, ClusterError> {
        let api = match self.api(id).await {
            Ok(api) => api,
            // A type that is no longer served has no objects.
            Err(ClusterError::UnknownKind(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        api.get_opt(&id.name).await.map_err(map_kube_err)
    }

    async fn delete(&self, id: &ObjectId) -> Result<bool, ClusterError> {
        let api = match self.api(id).await {
            Ok(api) => api,
            Err(ClusterError::UnknownKind(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        match api.delete(&id.name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(map_kube_err(e)),
        }
    }
}

fn map_kube_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ae) => ClusterError::Api { code: ae.code, message: ae.message },
        kube::Error::SerdeError(e) => ClusterError::Decode(e.to_string()),
        other => ClusterError::Transport(other.to_string()),
    }
}
