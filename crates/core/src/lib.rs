//! Keel core types: object identity, ownership labels, change sets, readiness predicates.
//!
//! Nothing in this crate talks to a cluster. Everything here is pure and cheap to test.

#![forbid(unsafe_code)]

pub mod change;
pub mod config;
pub mod error;
pub mod object;
pub mod owner;
pub mod readiness;

pub use change::{Action, ChangeEntry, ChangeSet};
pub use config::{PruneOrdering, ReconcileConfig};
pub use error::{ClusterError, Partial, ReconcileError};
pub use object::{sort_objects, stage_objects, DynamicObject, Instance, ObjectId, Stage};
pub use owner::Owner;
pub use readiness::Readiness;

pub mod prelude {
    pub use super::{
        Action, ChangeEntry, ChangeSet, ClusterError, DynamicObject, Instance, ObjectId, Owner, Partial,
        Readiness, ReconcileConfig, ReconcileError,
    };
}
