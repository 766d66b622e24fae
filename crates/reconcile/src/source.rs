//! Desired objects from local YAML manifests.

use std::path::{Path, PathBuf};

use keel_core::object::is_cluster_scoped_kind;
use keel_core::{DynamicObject, ObjectId, ReconcileError};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

/// Produces the desired object set for a run.
pub trait ObjectBuilder {
    fn build(&self) -> Result<Vec<DynamicObject>, ReconcileError>;
}

fn max_yaml_bytes() -> u64 {
    std::env::var("KEEL_MAX_YAML_BYTES").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(4_000_000)
}

/// Reads a YAML file, or every `*.yaml`/`*.yml` file in a directory, and merges
/// values overlays into the documents they name.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    module: String,
    namespace: String,
    values: Vec<PathBuf>,
}

impl ManifestBuilder {
    pub fn new(module: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { module: module.into(), namespace: namespace.into(), values: Vec::new() }
    }

    pub fn with_values<P: Into<PathBuf>>(mut self, files: impl IntoIterator<Item = P>) -> Self {
        self.values.extend(files.into_iter().map(Into::into));
        self
    }

    fn module_files(&self) -> Result<Vec<PathBuf>, ReconcileError> {
        if self.module.starts_with("oci://") {
            return Err(ReconcileError::Build(format!("remote modules are not supported: {}", self.module)));
        }
        let root = Path::new(&self.module);
        if !root.is_dir() {
            return Ok(vec![root.to_path_buf()]);
        }
        let entries = std::fs::read_dir(root).map_err(|e| ReconcileError::Build(format!("reading {}: {}", root.display(), e)))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && matches!(p.extension().and_then(|x| x.to_str()), Some("yaml") | Some("yml")))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(ReconcileError::Build(format!("no yaml manifests in {}", root.display())));
        }
        Ok(files)
    }
}

impl ObjectBuilder for ManifestBuilder {
    fn build(&self) -> Result<Vec<DynamicObject>, ReconcileError> {
        let mut docs = Vec::new();
        for f in self.module_files()? {
            docs.extend(read_documents(&f)?);
        }
        for f in &self.values {
            for overlay in read_documents(f)? {
                apply_overlay(&mut docs, overlay, f)?;
            }
        }
        let mut objects = Vec::with_capacity(docs.len());
        for mut doc in docs {
            default_namespace(&mut doc, &self.namespace);
            let obj: DynamicObject =
                serde_json::from_value(doc).map_err(|e| ReconcileError::Build(format!("decoding object: {}", e)))?;
            ObjectId::from_object(&obj)?;
            objects.push(obj);
        }
        debug!(module = %self.module, objects = objects.len(), "built manifests");
        Ok(objects)
    }
}

fn read_documents(path: &Path) -> Result<Vec<Json>, ReconcileError> {
    let size = std::fs::metadata(path).map_err(|e| ReconcileError::Build(format!("reading {}: {}", path.display(), e)))?.len();
    if size > max_yaml_bytes() {
        return Err(ReconcileError::Build(format!("{} too large (>{} bytes)", path.display(), max_yaml_bytes())));
    }
    let text = std::fs::read_to_string(path).map_err(|e| ReconcileError::Build(format!("reading {}: {}", path.display(), e)))?;
    parse_documents(&text).map_err(|e| ReconcileError::Build(format!("{}: {}", path.display(), e)))
}

/// Split a multi-document YAML stream into objects, expanding `kind: List`.
pub fn parse_documents(text: &str) -> Result<Vec<Json>, String> {
    let mut out = Vec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        let v = serde_yaml::Value::deserialize(de).map_err(|e| format!("parsing yaml: {}", e))?;
        if v.is_null() {
            continue;
        }
        let json = serde_json::to_value(v).map_err(|e| format!("converting yaml: {}", e))?;
        if json.get("kind").and_then(|k| k.as_str()) == Some("List") {
            if let Some(items) = json.get("items").and_then(|i| i.as_array()) {
                out.extend(items.iter().cloned());
            }
            continue;
        }
        if !json.is_object() {
            return Err("document is not a mapping".to_string());
        }
        out.push(json);
    }
    Ok(out)
}

fn target_of(doc: &Json) -> (Option<&str>, Option<&str>) {
    (doc.get("kind").and_then(|k| k.as_str()), doc.pointer("/metadata/name").and_then(|n| n.as_str()))
}

fn apply_overlay(docs: &mut [Json], overlay: Json, origin: &Path) -> Result<(), ReconcileError> {
    let (kind, name) = target_of(&overlay);
    let (Some(kind), Some(name)) = (kind, name) else {
        return Err(ReconcileError::Build(format!("{}: overlay needs kind and metadata.name", origin.display())));
    };
    let Some(target) = docs.iter_mut().find(|d| target_of(d) == (Some(kind), Some(name))) else {
        return Err(ReconcileError::Build(format!("{}: no object {}/{} to merge into", origin.display(), kind, name)));
    };
    deep_merge(target, &overlay);
    Ok(())
}

/// Maps merge key by key; anything else in `over` replaces `base`.
fn deep_merge(base: &mut Json, over: &Json) {
    match (base, over) {
        (Json::Object(b), Json::Object(o)) => {
            for (k, ov) in o {
                match b.get_mut(k) {
                    Some(bv) => deep_merge(bv, ov),
                    None => {
                        b.insert(k.clone(), ov.clone());
                    }
                }
            }
        }
        (b, o) => *b = o.clone(),
    }
}

fn default_namespace(doc: &mut Json, namespace: &str) {
    let kind = doc.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    if is_cluster_scoped_kind(kind) || namespace.is_empty() {
        return;
    }
    let Some(meta) = doc.get_mut("metadata").and_then(|m| m.as_object_mut()) else { return };
    let missing = meta.get("namespace").and_then(|n| n.as_str()).map(|s| s.is_empty()).unwrap_or(true);
    if missing {
        meta.insert("namespace".into(), Json::String(namespace.to_string()));
    }
}
