// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cascading recomputation of descendant threads.
//!
//! When a user's `permissions_for_children` projection or containing-thread membership changes
//! in one thread, every thread reachable through a parent or containing edge may need its row
//! for that user recompiled. Changed ancestors are queued on a [`DepthQueue`] and drained one
//! depth layer at a time; each layer's descendant context is fetched in bounded batches.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::changeset::Changeset;
use crate::depth_queue::{DepthItem, DepthQueue};
use crate::ids::{RoleId, ThreadId, UserId};
use crate::model::{RoleAssignment, ThreadRecord};
use crate::traits::{
    MembershipStore, NotificationSink, PermissionPolicy, PushRescinder, ThreadContext,
};

use super::{EngineError, GraphError, Intent, MembershipGraph, compile_membership};

/// How many ancestor thread ids are resolved per descendant-context round-trip.
const DESCENDANT_FETCH_BATCH: usize = 10;

/// The per-user payload of a changed ancestor: whichever of the two inherited inputs actually
/// changed for the edge type connecting ancestor and descendant.
#[derive(Clone, Debug)]
pub(crate) struct AncestorChanges<B> {
    /// Whether the user's role in the ancestor is now positive. Gates descendants linked via
    /// the containing edge.
    pub user_is_member: bool,
    /// The new projection inherited by descendants linked via the parent edge.
    pub permissions_for_children: Option<B>,
}

/// A thread whose outcome for this operation is settled and whose descendants may need
/// recomputation.
#[derive(Clone, Debug)]
pub(crate) struct ChangedAncestor<U, T, B> {
    pub thread_id: T,
    pub depth: u32,
    pub changes_by_user: HashMap<U, AncestorChanges<B>>,
}

/// Per-user recompilation state inside a [`DescendantInfo`].
///
/// `cur_*` fields come from the stored membership row (all set together, or none when the user
/// has no row in this thread yet); `next_*` fields are overrides injected by changed
/// ancestors, where `Some(None)` means "the inherited value became absent".
#[derive(Clone, Debug)]
pub(crate) struct DescendantUser<R, B, RB> {
    pub cur_role: Option<RoleAssignment<R>>,
    pub cur_role_permissions: Option<RB>,
    pub cur_permissions: Option<B>,
    pub cur_permissions_for_children: Option<B>,
    pub cur_permissions_from_parent: Option<B>,
    pub cur_member_of_containing: bool,
    pub next_permissions_from_parent: Option<Option<B>>,
    pub next_member_of_containing: Option<bool>,
    /// Set when the parent projection changed or containing-thread membership was lost; only
    /// flagged users are recompiled.
    pub potentially_needs_update: bool,
}

impl<R, B, RB> Default for DescendantUser<R, B, RB> {
    fn default() -> Self {
        Self {
            cur_role: None,
            cur_role_permissions: None,
            cur_permissions: None,
            cur_permissions_for_children: None,
            cur_permissions_from_parent: None,
            cur_member_of_containing: false,
            next_permissions_from_parent: None,
            next_member_of_containing: None,
            potentially_needs_update: false,
        }
    }
}

impl<R, B, RB> DescendantUser<R, B, RB> {
    /// Overlay `other` onto `self`, later fields winning where present.
    fn merge(&mut self, other: Self) {
        if other.cur_role.is_some() {
            self.cur_role = other.cur_role;
            self.cur_role_permissions = other.cur_role_permissions;
            self.cur_permissions = other.cur_permissions;
            self.cur_permissions_for_children = other.cur_permissions_for_children;
            self.cur_permissions_from_parent = other.cur_permissions_from_parent;
            self.cur_member_of_containing = other.cur_member_of_containing;
        }
        if other.next_permissions_from_parent.is_some() {
            self.next_permissions_from_parent = other.next_permissions_from_parent;
        }
        if other.next_member_of_containing.is_some() {
            self.next_member_of_containing = other.next_member_of_containing;
        }
        self.potentially_needs_update |= other.potentially_needs_update;
    }
}

/// A pending descendant thread queued for recomputation.
#[derive(Clone, Debug)]
pub(crate) struct DescendantInfo<U, T, R, B, RB> {
    pub thread: ThreadRecord<T, R>,
    pub users: HashMap<U, DescendantUser<R, B, RB>>,
}

#[derive(Debug, Error, PartialEq)]
pub enum DescendantMergeError<T>
where
    T: ThreadId,
{
    /// Two fetch rounds disagreed on immutable thread fields, which means storage returned
    /// inconsistent rows mid-operation.
    #[error("inconsistent descendant records for thread {0}")]
    Inconsistent(T),
}

impl<U, T, R, B, RB> DepthItem for DescendantInfo<U, T, R, B, RB>
where
    U: UserId,
    T: ThreadId,
    R: RoleId,
    B: Clone + std::fmt::Debug,
    RB: Clone + std::fmt::Debug,
{
    type Key = T;
    type Error = DescendantMergeError<T>;

    fn depth(&self) -> u32 {
        self.thread.depth
    }

    fn key(&self) -> T {
        self.thread.id
    }

    fn merge(mut self, other: Self) -> Result<Self, DescendantMergeError<T>> {
        if self.thread != other.thread {
            return Err(DescendantMergeError::Inconsistent(self.thread.id));
        }
        for (user_id, user) in other.users {
            self.users.entry(user_id).or_default().merge(user);
        }
        Ok(self)
    }
}

/// Turn fetched thread contexts into queueable descendant infos, then overlay the ancestor
/// changes onto every descendant reachable via a matching parent or containing edge.
fn apply_ancestor_changes<U, T, R, B, RB>(
    contexts: Vec<ThreadContext<U, T, R, B, RB>>,
    ancestors: &[ChangedAncestor<U, T, B>],
) -> Vec<DescendantInfo<U, T, R, B, RB>>
where
    U: UserId,
    T: ThreadId,
    R: RoleId,
    B: Clone + std::fmt::Debug,
    RB: Clone + std::fmt::Debug,
{
    let mut infos: HashMap<T, DescendantInfo<U, T, R, B, RB>> = HashMap::new();
    for context in contexts {
        let users = context
            .members
            .into_iter()
            .map(|member| {
                let user = DescendantUser {
                    cur_role: Some(member.role),
                    cur_role_permissions: member.role_permissions,
                    cur_permissions: member.permissions,
                    cur_permissions_for_children: member.permissions_for_children,
                    cur_permissions_from_parent: member.permissions_from_parent,
                    cur_member_of_containing: member.member_of_containing,
                    ..Default::default()
                };
                (member.user_id, user)
            })
            .collect();
        infos.insert(
            context.thread.id,
            DescendantInfo {
                thread: context.thread,
                users,
            },
        );
    }

    for ancestor in ancestors {
        for (user_id, changes) in &ancestor.changes_by_user {
            for info in infos.values_mut() {
                let via_parent = info.thread.parent_id == Some(ancestor.thread_id);
                let via_containing = info.thread.containing_id == Some(ancestor.thread_id);
                if !via_parent && !via_containing {
                    continue;
                }
                let user = info.users.entry(*user_id).or_default();
                if via_parent {
                    user.next_permissions_from_parent =
                        Some(changes.permissions_for_children.clone());
                    user.potentially_needs_update = true;
                }
                if via_containing {
                    user.next_member_of_containing = Some(changes.user_is_member);
                    // Gaining containing-thread membership grants nothing by itself; losing
                    // it revokes.
                    if !changes.user_is_member {
                        user.potentially_needs_update = true;
                    }
                }
            }
        }
    }

    infos.into_values().collect()
}

impl<U, T, R, P, S, N, X> MembershipGraph<U, T, R, P, S, N, X>
where
    U: UserId,
    T: ThreadId,
    R: RoleId,
    P: PermissionPolicy<T, R>,
    S: MembershipStore<U, T, R, Blob = P::Blob, RolePermissions = P::RolePermissions>,
    N: NotificationSink<U, T>,
    X: PushRescinder<U, T>,
{
    /// Drive the depth-ordered propagation loop to a fixpoint, starting from one settled
    /// ancestor.
    pub(crate) async fn update_descendant_permissions(
        &self,
        initial: ChangedAncestor<U, T, P::Blob>,
    ) -> Result<Changeset<U, T, R, P::Blob>, GraphError<U, T, R, S, N, X>> {
        let mut changeset = Changeset::new();

        let mut queue = DepthQueue::new();
        let initial_descendants = self.fetch_descendants_for_update(&[initial]).await?;
        queue.add_infos(initial_descendants)?;

        while let Some(descendants) = queue.next_depth() {
            debug!(threads = descendants.len(), "processing descendant layer");
            let mut descendants_as_ancestors = Vec::new();
            for descendant in descendants {
                if let Some(ancestor) = self.recompute_descendant(descendant, &mut changeset) {
                    descendants_as_ancestors.push(ancestor);
                }
            }

            let next_descendants = self
                .fetch_descendants_for_update(&descendants_as_ancestors)
                .await?;
            queue.add_infos(next_descendants)?;
        }

        Ok(changeset)
    }

    /// Recompile every flagged user of one descendant thread, pushing resulting rows into
    /// `changeset`. Returns the thread as a changed ancestor when any user's outputs cascade
    /// further.
    pub(super) fn recompute_descendant(
        &self,
        descendant: DescendantInfo<U, T, R, P::Blob, P::RolePermissions>,
        changeset: &mut Changeset<U, T, R, P::Blob>,
    ) -> Option<ChangedAncestor<U, T, P::Blob>> {
        let thread = descendant.thread;

        let existing_member_ids: Vec<U> = descendant
            .users
            .iter()
            .filter(|(_, user)| user.cur_role.is_some())
            .map(|(user_id, _)| *user_id)
            .collect();
        if self.tracks_relationships(thread.id) {
            changeset
                .relationship_changeset
                .set_all_relationships_exist(&existing_member_ids);
        }

        let mut users_for_next_layer = HashMap::new();
        for (user_id, user) in descendant.users {
            if !user.potentially_needs_update {
                continue;
            }

            let existing_membership = user.cur_role.is_some();
            let cur_role = user.cur_role.unwrap_or(RoleAssignment::Never);

            let permissions_from_parent = match user.next_permissions_from_parent {
                Some(next) => next,
                None => user.cur_permissions_from_parent,
            };
            let member_of_containing = if thread.containing_id.is_none() {
                true
            } else {
                user.next_member_of_containing
                    .unwrap_or(user.cur_member_of_containing)
            };

            let compiled = compile_membership(
                &self.policy,
                member_of_containing,
                cur_role,
                user.cur_role_permissions.as_ref(),
                permissions_from_parent.as_ref(),
                thread.id,
                thread.thread_type,
            );

            if compiled.permissions == user.cur_permissions && cur_role == compiled.new_role {
                // Unchanged row; neither this thread nor its subtree needs anything for this
                // user.
                continue;
            }

            let user_lost_membership = cur_role.is_member() && !compiled.new_role.is_member();

            if compiled.permissions.is_some() && !existing_membership {
                if self.tracks_relationships(thread.id) {
                    changeset
                        .relationship_changeset
                        .set_relationships_needed(user_id, &existing_member_ids);
                }
            }

            if user_lost_membership
                || compiled.permissions_for_children != user.cur_permissions_for_children
            {
                users_for_next_layer.insert(
                    user_id,
                    AncestorChanges {
                        user_is_member: compiled.new_role.is_member(),
                        permissions_for_children: compiled.permissions_for_children.clone(),
                    },
                );
            }

            changeset.membership_rows.push(compiled.into_row(
                Intent::None,
                user_id,
                thread.id,
                cur_role,
                false,
                false,
            ));
        }

        if users_for_next_layer.is_empty() {
            None
        } else {
            Some(ChangedAncestor {
                thread_id: thread.id,
                depth: thread.depth,
                changes_by_user: users_for_next_layer,
            })
        }
    }

    /// Fetch the recompilation context of every thread hanging off the given ancestors, in
    /// bounded batches, and overlay the ancestor changes.
    async fn fetch_descendants_for_update(
        &self,
        ancestors: &[ChangedAncestor<U, T, P::Blob>],
    ) -> Result<
        Vec<DescendantInfo<U, T, R, P::Blob, P::RolePermissions>>,
        GraphError<U, T, R, S, N, X>,
    > {
        if ancestors.is_empty() {
            return Ok(Vec::new());
        }

        let thread_ids: Vec<T> = ancestors.iter().map(|ancestor| ancestor.thread_id).collect();
        let mut contexts = Vec::new();
        for batch in thread_ids.chunks(DESCENDANT_FETCH_BATCH) {
            let mut fetched = self
                .store
                .descendant_contexts(batch)
                .await
                .map_err(EngineError::Store)?;
            contexts.append(&mut fetched);
        }

        Ok(apply_ancestor_changes(contexts, ancestors))
    }
}
