// SPDX-License-Identifier: MIT OR Apache-2.0

//! Role and permission propagation for hierarchical chat threads.
//!
//! Threads form a tree along two edges: the *parent* edge, along which compiled permissions
//! are inherited, and the *containing* edge, whose positive-role membership gates eligibility.
//! Every user's standing in a thread is a compiled permission blob plus a role assignment, and
//! changing either in one thread can affect the whole subtree below it.
//!
//! This crate implements the write path of that system. [`MembershipGraph`] computes a
//! [`Changeset`] for a role change or a permission recalculation, cascading through
//! descendants in depth order, and then commits it: membership rows, pairwise relationship
//! rows, push rescissions and per-user notification events.
//!
//! The engine is generic over its collaborators. Permission semantics live behind
//! [`PermissionPolicy`], persistence behind [`MembershipStore`] and delivery behind
//! [`NotificationSink`] and [`PushRescinder`]; the engine itself only orders, compares and
//! batches.

pub mod changeset;
pub mod depth_queue;
pub mod engine;
pub mod ids;
pub mod model;
pub mod relationship;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;

pub use changeset::{Changeset, Intent, MembershipDelete, MembershipRow, MembershipSave};
pub use engine::{
    ChangeRoleOptions, CommitOptions, CommitResult, EngineConfig, EngineError, GraphError,
    MembershipGraph,
};
pub use ids::{RoleId, ThreadId, UserId};
pub use model::{MembershipRecord, RoleAssignment, RoleTarget, ThreadRecord, ThreadType};
pub use relationship::RelationshipChangeset;
pub use traits::{
    MembershipStore, NotificationSink, PermissionPolicy, PushRescinder, ThreadEvent,
    ThreadEventKind,
};
