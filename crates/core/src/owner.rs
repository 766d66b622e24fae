//! Ownership metadata stamped on every managed object.

use serde::{Deserialize, Serialize};

use crate::object::{DynamicObject, Instance};

/// Field manager identity plus the label group used to mark owned objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    /// Server-side apply field manager.
    pub field: String,
    /// Label/annotation prefix, e.g. `keel.dev`.
    pub group: String,
}

impl Default for Owner {
    fn default() -> Self {
        Self { field: "keel".to_string(), group: "keel.dev".to_string() }
    }
}

impl Owner {
    pub fn new(field: impl Into<String>, group: impl Into<String>) -> Self {
        Self { field: field.into(), group: group.into() }
    }

    pub fn name_label(&self) -> String { format!("{}/name", self.group) }
    pub fn namespace_label(&self) -> String { format!("{}/namespace", self.group) }
    pub fn manager_annotation(&self) -> String { format!("{}/field-manager", self.group) }
    pub fn prune_annotation(&self) -> String { format!("{}/prune", self.group) }

    /// Stamp owner labels and the field-manager annotation. Idempotent.
    pub fn stamp(&self, obj: &mut DynamicObject, instance: &Instance) {
        let labels = obj.metadata.labels.get_or_insert_with(Default::default);
        labels.insert(self.name_label(), instance.name.clone());
        labels.insert(self.namespace_label(), instance.namespace.clone());
        let annotations = obj.metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(self.manager_annotation(), self.field.clone());
    }

    pub fn label(&self, objects: &mut [DynamicObject], instance: &Instance) {
        for obj in objects.iter_mut() {
            self.stamp(obj, instance);
        }
    }

    /// Whether the object's labels name `instance` as its owner.
    pub fn owns(&self, obj: &DynamicObject, instance: &Instance) -> bool {
        let Some(labels) = obj.metadata.labels.as_ref() else { return false };
        labels.get(&self.name_label()) == Some(&instance.name)
            && labels.get(&self.namespace_label()) == Some(&instance.namespace)
    }

    /// Object opted out of pruning via `<group>/prune: disabled`.
    pub fn prune_disabled(&self, obj: &DynamicObject) -> bool {
        obj.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&self.prune_annotation()))
            .map(|v| v.eq_ignore_ascii_case("disabled"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "web", "labels": { "app": "api" } },
            "data": { "k": "v" }
        }))
        .unwrap()
    }

    #[test]
    fn label_is_idempotent_and_keeps_user_labels() {
        let owner = Owner::default();
        let inst = Instance::new("api", "web");
        let mut once = vec![cm("a"), cm("b")];
        owner.label(&mut once, &inst);
        let mut twice = once.clone();
        owner.label(&mut twice, &inst);
        assert_eq!(serde_json::to_value(&once).unwrap(), serde_json::to_value(&twice).unwrap());

        let labels = once[0].metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("keel.dev/name").map(String::as_str), Some("api"));
        assert_eq!(labels.get("keel.dev/namespace").map(String::as_str), Some("web"));
        assert_eq!(labels.get("app").map(String::as_str), Some("api"));
        let annotations = once[0].metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations.get("keel.dev/field-manager").map(String::as_str), Some("keel"));
    }

    #[test]
    fn owns_requires_both_labels() {
        let owner = Owner::default();
        let inst = Instance::new("api", "web");
        let mut o = cm("a");
        assert!(!owner.owns(&o, &inst));
        owner.stamp(&mut o, &inst);
        assert!(owner.owns(&o, &inst));
        assert!(!owner.owns(&o, &Instance::new("api", "other")));
    }

    #[test]
    fn prune_annotation_opt_out() {
        let owner = Owner::default();
        let mut o = cm("a");
        assert!(!owner.prune_disabled(&o));
        o.metadata.annotations = Some([("keel.dev/prune".to_string(), "Disabled".to_string())].into_iter().collect());
        assert!(owner.prune_disabled(&o));
    }
}
