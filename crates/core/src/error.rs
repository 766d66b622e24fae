//! Error taxonomy for a reconcile run.

use crate::change::ChangeSet;
use crate::object::ObjectId;

/// Failure reported by a cluster client call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },
    #[error("resource type not served: {0}")]
    UnknownKind(String),
    #[error("namespace required for namespaced kind {0}")]
    NamespaceRequired(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::Api { code: 404, .. })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    /// Malformed desired objects; raised before any cluster mutation.
    #[error("invalid object: {0}")]
    Build(String),
    #[error("{id} dry-run failed: {source}")]
    DryRun { id: ObjectId, source: ClusterError },
    #[error("{id} apply failed: {source}")]
    Apply { id: ObjectId, source: ClusterError },
    #[error("inventory query failed: {0}")]
    InventoryRead(String),
    #[error("inventory apply failed: {0}")]
    InventoryWrite(String),
    #[error("{id} prune failed: {source}")]
    Prune { id: ObjectId, source: ClusterError },
    #[error("timeout waiting for: [{}]", join_ids(.pending))]
    Timeout { pending: Vec<ObjectId> },
    #[error("deadline exceeded during {0}")]
    DeadlineExceeded(String),
    #[error("{}", join_failed(.failed))]
    NotReady { failed: Vec<(ObjectId, String)> },
    #[error("{id} poll failed: {source}")]
    Poll { id: ObjectId, source: ClusterError },
}

impl ReconcileError {
    /// Deadline expiry, as opposed to a failed mutation or readiness failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReconcileError::Timeout { .. } | ReconcileError::DeadlineExceeded(_))
    }

    /// Object named by the error, if any.
    pub fn object(&self) -> Option<&ObjectId> {
        match self {
            ReconcileError::DryRun { id, .. }
            | ReconcileError::Apply { id, .. }
            | ReconcileError::Prune { id, .. }
            | ReconcileError::Poll { id, .. } => Some(id),
            _ => None,
        }
    }
}

fn join_ids(ids: &[ObjectId]) -> String {
    ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

fn join_failed(failed: &[(ObjectId, String)]) -> String {
    let parts: Vec<String> = failed.iter().map(|(id, why)| format!("{} failed: {}", id, why)).collect();
    parts.join("; ")
}

/// An error paired with the change set accumulated before it happened.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct Partial {
    pub changes: ChangeSet,
    pub error: ReconcileError,
}

impl Partial {
    pub fn new(changes: ChangeSet, error: ReconcileError) -> Self { Self { changes, error } }
}
