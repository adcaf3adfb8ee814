// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core records describing threads, roles and memberships.

use std::fmt::Display;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::ids::{RoleId, ThreadId, UserId};

/// Opaque thread-type tag.
///
/// The engine never interprets thread types itself; they are passed through to the permission
/// policy, which may use them to filter grants (announcement threads, top-level threads, etc.).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ThreadType(pub u8);

/// A user's role within one thread.
///
/// Replaces the string sentinels `"0"` and `"-1"` used by membership rows in earlier systems
/// with a tagged variant. Only `Active` counts as membership; `Removed` keeps a compiled
/// permission row without membership (a user who can know of the thread through inheritance but
/// is not a member); `Never` is a ghost row kept for history and relationship purposes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RoleAssignment<R> {
    Active(R),
    Removed,
    Never,
}

impl<R> RoleAssignment<R> {
    /// Return `true` if this assignment makes the user a member of the thread.
    pub fn is_member(&self) -> bool {
        matches!(self, RoleAssignment::Active(_))
    }

    /// Return `true` if this is a ghost assignment.
    pub fn is_never(&self) -> bool {
        matches!(self, RoleAssignment::Never)
    }
}

impl<R> Display for RoleAssignment<R>
where
    R: Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleAssignment::Active(role) => write!(f, "{}", role),
            RoleAssignment::Removed => write!(f, "0"),
            RoleAssignment::Never => write!(f, "-1"),
        }
    }
}

/// The role requested by a `change_role` call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoleTarget<R> {
    /// Assign a concrete role.
    Role(R),
    /// Assign the thread's default role.
    Default,
    /// Remove the user from the thread.
    Remove,
    /// Turn the user into a ghost (former member).
    Ghost,
}

impl<R> RoleTarget<R> {
    /// Return `true` if this target removes membership rather than granting it.
    pub fn is_removal(&self) -> bool {
        matches!(self, RoleTarget::Remove | RoleTarget::Ghost)
    }
}

/// A thread row as resolved from storage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ThreadRecord<T, R> {
    pub id: T,
    pub thread_type: ThreadType,
    /// Direct parent in the visual hierarchy. Permission inheritance flows along this edge.
    pub parent_id: Option<T>,
    /// Ancestor whose positive-role membership gates eligibility in this thread. May differ
    /// from the direct parent.
    pub containing_id: Option<T>,
    /// Strictly greater than the depth of both the parent and the containing thread.
    pub depth: u32,
    pub default_role: R,
}

impl<T, R> ThreadRecord<T, R>
where
    T: ThreadId,
    R: RoleId,
{
    /// Return `true` if `candidate` is this thread's parent or containing thread.
    pub fn has_ancestor_edge(&self, candidate: T) -> bool {
        self.parent_id == Some(candidate) || self.containing_id == Some(candidate)
    }
}

/// A membership row as read from storage.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MembershipRecord<U, T, R, B> {
    pub user_id: U,
    pub thread_id: T,
    pub role: RoleAssignment<R>,
    pub permissions: Option<B>,
    pub permissions_for_children: Option<B>,
}

impl<U, T, R, B> MembershipRecord<U, T, R, B>
where
    U: UserId,
{
    pub fn is_member(&self) -> bool {
        self.role.is_member()
    }
}
