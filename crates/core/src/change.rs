//! Change sets: the per-object record of what an operation did.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::object::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Configured,
    Unchanged,
    Deleted,
    /// Prune declined to delete (owned elsewhere or pruning disabled).
    Skipped,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Created => "created",
            Action::Configured => "configured",
            Action::Unchanged => "unchanged",
            Action::Deleted => "deleted",
            Action::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub id: ObjectId,
    pub action: Action,
}

impl fmt::Display for ChangeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.action)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub entries: Vec<ChangeEntry>,
}

impl ChangeSet {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, id: ObjectId, action: Action) {
        self.entries.push(ChangeEntry { id, action });
    }

    pub fn append(&mut self, other: ChangeSet) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn iter(&self) -> std::slice::Iter<'_, ChangeEntry> { self.entries.iter() }

    pub fn count(&self, action: Action) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// True when nothing was created, configured or deleted.
    pub fn is_noop(&self) -> bool {
        self.entries.iter().all(|e| matches!(e.action, Action::Unchanged | Action::Skipped))
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a ChangeEntry;
    type IntoIter = std::slice::Iter<'a, ChangeEntry>;
    fn into_iter(self) -> Self::IntoIter { self.entries.iter() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_renders_identity_then_action() {
        let id = ObjectId::new("apps", "v1", "Deployment", Some("web"), "api");
        let e = ChangeEntry { id, action: Action::Configured };
        assert_eq!(e.to_string(), "Deployment/web/api configured");
    }

    #[test]
    fn noop_only_for_unchanged_or_skipped() {
        let mut cs = ChangeSet::new();
        assert!(cs.is_noop());
        cs.add(ObjectId::new("", "v1", "ConfigMap", Some("a"), "x"), Action::Unchanged);
        cs.add(ObjectId::new("", "v1", "ConfigMap", Some("a"), "y"), Action::Skipped);
        assert!(cs.is_noop());
        cs.add(ObjectId::new("", "v1", "ConfigMap", Some("a"), "z"), Action::Created);
        assert!(!cs.is_noop());
        assert_eq!(cs.count(Action::Created), 1);
        assert_eq!(cs.len(), 3);
    }

    #[test]
    fn action_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Action::Deleted).unwrap(), "\"deleted\"");
    }
}
