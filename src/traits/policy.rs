// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::Debug;

use crate::ids::{RoleId, ThreadId};
use crate::model::{RoleAssignment, ThreadType};

/// Pure permission-compilation contract.
///
/// The engine never interprets individual grants; it only compiles blobs through this policy,
/// compares them for equality and passes them along. All methods must be total, deterministic
/// and free of I/O.
pub trait PermissionPolicy<T, R>
where
    T: ThreadId,
    R: RoleId,
{
    /// The compiled, per-user, per-thread set of effective grants.
    type Blob: Clone + Debug + PartialEq;

    /// The raw grant bundle attached to a role definition.
    type RolePermissions: Clone + Debug;

    /// Compile a user's effective permissions in one thread.
    ///
    /// `role_permissions` is `None` when the user holds no positive role (or is gated out by
    /// the containing thread); `permissions_from_parent` is `None` when nothing is inherited.
    /// A `None` return means the user has no access at all and should be treated as a ghost.
    fn compile(
        &self,
        role_permissions: Option<&Self::RolePermissions>,
        permissions_from_parent: Option<&Self::Blob>,
        thread_id: T,
        thread_type: ThreadType,
    ) -> Option<Self::Blob>;

    /// Project the subset of `permissions` that propagates to child threads. `None` when
    /// nothing propagates.
    fn project_for_children(&self, permissions: &Self::Blob) -> Option<Self::Blob>;

    /// Map a compiled blob back to the role that can actually be held with it.
    ///
    /// May downgrade the requested target, e.g. when the baseline visibility grant is absent
    /// from the blob.
    fn effective_role(
        &self,
        target: RoleAssignment<R>,
        permissions: Option<&Self::Blob>,
    ) -> RoleAssignment<R>;
}
