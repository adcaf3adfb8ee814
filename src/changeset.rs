// SPDX-License-Identifier: MIT OR Apache-2.0

//! The result type of the engine: row-level membership mutations plus required relationship
//! rows, computed for one operation and consumed by the committer.

use crate::ids::{RoleId, ThreadId, UserId};
use crate::model::RoleAssignment;
use crate::relationship::RelationshipChangeset;

/// Why a membership row changed. Picked up by the committer to choose the notification type and
/// to decide whether subscription state should be reset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Intent {
    Join,
    Leave,
    None,
}

/// An insert-or-update of one membership row.
#[derive(Clone, Debug, PartialEq)]
pub struct MembershipSave<U, T, R, B> {
    pub intent: Intent,
    pub user_id: U,
    pub thread_id: T,
    pub role: RoleAssignment<R>,
    pub permissions: B,
    pub permissions_for_children: Option<B>,
    /// The user became a member through this row and needs the full thread detail in their
    /// join notification.
    pub needs_full_thread_details: bool,
    pub old_role: RoleAssignment<R>,
    /// Mark the thread unread for this user on insert.
    pub unread: bool,
}

/// A soft delete of one membership row: the role becomes [`RoleAssignment::Never`] and
/// permissions are cleared. Rows are never physically deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct MembershipDelete<U, T, R> {
    pub intent: Intent,
    pub user_id: U,
    pub thread_id: T,
    pub old_role: RoleAssignment<R>,
}

/// A single row-level membership mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum MembershipRow<U, T, R, B> {
    Save(MembershipSave<U, T, R, B>),
    Delete(MembershipDelete<U, T, R>),
}

impl<U, T, R, B> MembershipRow<U, T, R, B>
where
    U: UserId,
    T: ThreadId,
    R: RoleId,
{
    pub fn user_id(&self) -> U {
        match self {
            MembershipRow::Save(row) => row.user_id,
            MembershipRow::Delete(row) => row.user_id,
        }
    }

    pub fn thread_id(&self) -> T {
        match self {
            MembershipRow::Save(row) => row.thread_id,
            MembershipRow::Delete(row) => row.thread_id,
        }
    }

    pub fn intent(&self) -> Intent {
        match self {
            MembershipRow::Save(row) => row.intent,
            MembershipRow::Delete(row) => row.intent,
        }
    }

    pub fn old_role(&self) -> RoleAssignment<R> {
        match self {
            MembershipRow::Save(row) => row.old_role,
            MembershipRow::Delete(row) => row.old_role,
        }
    }
}

/// The computed set of membership mutations plus required relationship rows for one operation.
#[derive(Clone, Debug)]
pub struct Changeset<U, T, R, B>
where
    U: UserId,
{
    pub membership_rows: Vec<MembershipRow<U, T, R, B>>,
    pub relationship_changeset: RelationshipChangeset<U>,
}

impl<U, T, R, B> Changeset<U, T, R, B>
where
    U: UserId,
{
    pub fn new() -> Self {
        Self {
            membership_rows: Vec::new(),
            relationship_changeset: RelationshipChangeset::new(),
        }
    }

    /// Returns `true` when the operation found nothing to update.
    pub fn is_empty(&self) -> bool {
        self.membership_rows.is_empty() && self.relationship_changeset.is_empty()
    }

    /// Merge another changeset into this one. Rows keep their relative order; relationship
    /// statuses merge with `Existing` dominant.
    pub fn extend(&mut self, other: Self) {
        self.membership_rows.extend(other.membership_rows);
        self.relationship_changeset
            .add_all(other.relationship_changeset);
    }
}

impl<U, T, R, B> Default for Changeset<U, T, R, B>
where
    U: UserId,
{
    fn default() -> Self {
        Self::new()
    }
}
