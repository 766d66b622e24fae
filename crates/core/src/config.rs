//! Immutable run configuration.
//!
//! Defaults come from `KEEL_*` environment variables; callers (the CLI) override
//! individual fields and then hand the value to the driver, which never mutates it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::owner::Owner;

/// Order of inventory persistence relative to pruning.
///
/// `PersistThenPrune` records the new member set before deleting stale objects: a
/// failed prune is not retried by the next run, but nothing deleted is ever still
/// listed. `PruneThenPersist` keeps stale objects tracked until they are gone; a
/// crash between delete and persist leaves already-deleted members listed, which
/// the next run recomputes as stale and deletes as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PruneOrdering {
    #[default]
    PersistThenPrune,
    PruneThenPersist,
}

impl std::str::FromStr for PruneOrdering {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persist-first" | "persist-then-prune" => Ok(PruneOrdering::PersistThenPrune),
            "prune-first" | "prune-then-persist" => Ok(PruneOrdering::PruneThenPersist),
            other => Err(format!("unknown prune order: {} (expect persist-first or prune-first)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub owner: Owner,
    /// Deadline for the whole run.
    pub timeout: Duration,
    /// Readiness poll period.
    pub poll_interval: Duration,
    /// Max objects polled concurrently while waiting.
    pub max_concurrency: usize,
    /// Take field ownership on conflicts.
    pub force_conflicts: bool,
    /// Block until applied objects are ready and pruned ones are gone.
    pub wait: bool,
    /// Delete stale objects.
    pub prune: bool,
    pub prune_ordering: PruneOrdering,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            owner: Owner::default(),
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            max_concurrency: 8,
            force_conflicts: true,
            wait: true,
            prune: true,
            prune_ordering: PruneOrdering::default(),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl ReconcileConfig {
    /// Defaults overlaid with `KEEL_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let owner = Owner {
            field: std::env::var("KEEL_FIELD_MANAGER").unwrap_or(d.owner.field),
            group: std::env::var("KEEL_OWNER_GROUP").unwrap_or(d.owner.group),
        };
        Self {
            owner,
            timeout: env_u64("KEEL_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.timeout),
            poll_interval: env_u64("KEEL_POLL_MS").map(Duration::from_millis).unwrap_or(d.poll_interval),
            max_concurrency: env_u64("KEEL_WAIT_CONC").map(|n| (n as usize).max(1)).unwrap_or(d.max_concurrency),
            force_conflicts: env_bool("KEEL_FORCE_CONFLICTS").unwrap_or(d.force_conflicts),
            wait: d.wait,
            prune: env_bool("KEEL_DISABLE_PRUNE").map(|off| !off).unwrap_or(d.prune),
            prune_ordering: std::env::var("KEEL_PRUNE_ORDER").ok().and_then(|s| s.parse().ok()).unwrap_or(d.prune_ordering),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self { self.timeout = timeout; self }
    pub fn with_poll_interval(mut self, interval: Duration) -> Self { self.poll_interval = interval; self }
    pub fn with_wait(mut self, wait: bool) -> Self { self.wait = wait; self }
    pub fn with_prune_ordering(mut self, ordering: PruneOrdering) -> Self { self.prune_ordering = ordering; self }
    pub fn with_owner(mut self, owner: Owner) -> Self { self.owner = owner; self }
    pub fn with_max_concurrency(mut self, n: usize) -> Self { self.max_concurrency = n.max(1); self }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_ordering_parses_both_spellings() {
        assert_eq!("prune-first".parse::<PruneOrdering>().unwrap(), PruneOrdering::PruneThenPersist);
        assert_eq!("persist-then-prune".parse::<PruneOrdering>().unwrap(), PruneOrdering::PersistThenPrune);
        assert!("sideways".parse::<PruneOrdering>().is_err());
    }

    #[test]
    fn builders_clamp_concurrency() {
        let c = ReconcileConfig::default().with_max_concurrency(0).with_wait(false);
        assert_eq!(c.max_concurrency, 1);
        assert!(!c.wait);
        assert!(c.force_conflicts);
        assert_eq!(c.prune_ordering, PruneOrdering::PersistThenPrune);
    }
}
