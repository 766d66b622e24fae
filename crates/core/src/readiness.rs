//! Readiness predicates evaluated against live objects.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::object::DynamicObject;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Readiness {
    Ready,
    InProgress(String),
    Failed(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool { matches!(self, Readiness::Ready) }

    fn pending(reason: impl Into<String>) -> Self { Readiness::InProgress(reason.into()) }
}

fn int(v: &Json, key: &str) -> Option<i64> { v.get(key).and_then(|x| x.as_i64()) }

fn condition<'a>(status: &'a Json, ty: &str) -> Option<&'a Json> {
    status.get("conditions")?.as_array()?.iter().find(|c| c.get("type").and_then(|t| t.as_str()) == Some(ty))
}

fn condition_is(status: &Json, ty: &str, want: &str) -> bool {
    condition(status, ty).and_then(|c| c.get("status")).and_then(|s| s.as_str()) == Some(want)
}

fn condition_message(status: &Json, ty: &str) -> String {
    condition(status, ty)
        .and_then(|c| c.get("message").or_else(|| c.get("reason")))
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string()
}

/// Observed generation must have caught up with metadata.generation.
fn generation_observed(obj: &DynamicObject, status: &Json) -> bool {
    match (obj.metadata.generation, int(status, "observedGeneration")) {
        (Some(gen), Some(seen)) => seen >= gen,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

/// Evaluate the type-specific readiness predicate for `obj`.
pub fn evaluate(obj: &DynamicObject) -> Readiness {
    if obj.metadata.deletion_timestamp.is_some() {
        return Readiness::pending("terminating");
    }
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
    let spec = obj.data.get("spec").unwrap_or(&Json::Null);
    let status = obj.data.get("status");

    match kind {
        "Deployment" => {
            let Some(st) = status else { return Readiness::pending("no status yet") };
            if condition_is(st, "Progressing", "False") {
                return Readiness::Failed(condition_message(st, "Progressing"));
            }
            if !generation_observed(obj, st) {
                return Readiness::pending("rollout not observed");
            }
            let want = int(spec, "replicas").unwrap_or(1);
            let updated = int(st, "updatedReplicas").unwrap_or(0);
            let available = int(st, "availableReplicas").unwrap_or(0);
            let total = int(st, "replicas").unwrap_or(0);
            if updated < want {
                Readiness::pending(format!("{} of {} replicas updated", updated, want))
            } else if total > updated {
                Readiness::pending(format!("{} old replicas pending termination", total - updated))
            } else if available < want {
                Readiness::pending(format!("{} of {} replicas available", available, want))
            } else {
                Readiness::Ready
            }
        }
        "StatefulSet" => {
            let Some(st) = status else { return Readiness::pending("no status yet") };
            if !generation_observed(obj, st) {
                return Readiness::pending("rollout not observed");
            }
            let want = int(spec, "replicas").unwrap_or(1);
            let ready = int(st, "readyReplicas").unwrap_or(0);
            let updated = int(st, "updatedReplicas").unwrap_or(0);
            if ready < want {
                Readiness::pending(format!("{} of {} replicas ready", ready, want))
            } else if updated < want {
                Readiness::pending(format!("{} of {} replicas updated", updated, want))
            } else {
                Readiness::Ready
            }
        }
        "DaemonSet" => {
            let Some(st) = status else { return Readiness::pending("no status yet") };
            if !generation_observed(obj, st) {
                return Readiness::pending("rollout not observed");
            }
            let desired = int(st, "desiredNumberScheduled").unwrap_or(0);
            let ready = int(st, "numberReady").unwrap_or(0);
            let updated = int(st, "updatedNumberScheduled").unwrap_or(0);
            if updated < desired || ready < desired {
                Readiness::pending(format!("{} of {} pods ready", ready, desired))
            } else {
                Readiness::Ready
            }
        }
        "ReplicaSet" | "ReplicationController" => {
            let Some(st) = status else { return Readiness::pending("no status yet") };
            let want = int(spec, "replicas").unwrap_or(1);
            let ready = int(st, "readyReplicas").unwrap_or(0);
            if ready < want { Readiness::pending(format!("{} of {} replicas ready", ready, want)) } else { Readiness::Ready }
        }
        "Job" => {
            let Some(st) = status else { return Readiness::pending("not started") };
            if condition_is(st, "Failed", "True") {
                Readiness::Failed(condition_message(st, "Failed"))
            } else if condition_is(st, "Complete", "True") {
                Readiness::Ready
            } else {
                Readiness::pending("job running")
            }
        }
        "Pod" => {
            let Some(st) = status else { return Readiness::pending("not scheduled") };
            match st.get("phase").and_then(|p| p.as_str()) {
                Some("Succeeded") => Readiness::Ready,
                Some("Failed") => Readiness::Failed(st.get("reason").and_then(|r| r.as_str()).unwrap_or("pod failed").to_string()),
                _ if condition_is(st, "Ready", "True") => Readiness::Ready,
                Some(phase) => Readiness::pending(format!("phase {}", phase)),
                None => Readiness::pending("no phase"),
            }
        }
        "PersistentVolumeClaim" => match status.and_then(|s| s.get("phase")).and_then(|p| p.as_str()) {
            Some("Bound") => Readiness::Ready,
            Some("Lost") => Readiness::Failed("claim lost".into()),
            other => Readiness::pending(format!("phase {}", other.unwrap_or("unknown"))),
        },
        "Service" => {
            if spec.get("type").and_then(|t| t.as_str()) != Some("LoadBalancer") {
                return Readiness::Ready;
            }
            let assigned = status
                .and_then(|s| s.pointer("/loadBalancer/ingress"))
                .and_then(|i| i.as_array())
                .map(|a| !a.is_empty())
                .unwrap_or(false);
            if assigned { Readiness::Ready } else { Readiness::pending("load balancer not assigned") }
        }
        "CustomResourceDefinition" => {
            let Some(st) = status else { return Readiness::pending("not established") };
            if condition_is(st, "Established", "True") {
                Readiness::Ready
            } else {
                Readiness::pending("not established")
            }
        }
        "Namespace" => match status.and_then(|s| s.get("phase")).and_then(|p| p.as_str()) {
            None | Some("Active") => Readiness::Ready,
            Some(phase) => Readiness::pending(format!("phase {}", phase)),
        },
        _ => generic(obj, status),
    }
}

fn generic(obj: &DynamicObject, status: Option<&Json>) -> Readiness {
    let Some(st) = status else { return Readiness::Ready };
    if !st.is_object() {
        return Readiness::Ready;
    }
    if obj.metadata.generation.is_some() && st.get("observedGeneration").is_some() && !generation_observed(obj, st) {
        return Readiness::pending("generation not observed");
    }
    if condition_is(st, "Stalled", "True") {
        return Readiness::Failed(condition_message(st, "Stalled"));
    }
    match condition(st, "Ready").and_then(|c| c.get("status")).and_then(|s| s.as_str()) {
        Some("True") | None => Readiness::Ready,
        Some(_) => Readiness::pending(condition_message(st, "Ready")),
    }
}
