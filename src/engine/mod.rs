// SPDX-License-Identifier: MIT OR Apache-2.0

//! The membership graph engine.
//!
//! One call into [`MembershipGraph::change_role`] or
//! [`MembershipGraph::recalculate_thread_permissions`] is one logical operation: the engine
//! reads the membership and ancestor context of the target thread, recompiles the affected
//! users through the permission policy, detects which descendants are affected and drives the
//! depth-ordered cascade to completion. The result is a [`Changeset`] which is applied with
//! [`MembershipGraph::commit`].
//!
//! The scheduler and relationship accumulator are owned state private to one operation,
//! threaded through the call stack and dropped when the operation returns; no locking is
//! involved.

use std::collections::HashMap;
use std::marker::PhantomData;

use thiserror::Error;
use tracing::warn;

use crate::changeset::{Changeset, Intent, MembershipDelete, MembershipRow, MembershipSave};
use crate::depth_queue::DepthQueueError;
use crate::ids::{RoleId, ThreadId, UserId};
use crate::model::{RoleAssignment, RoleTarget, ThreadRecord, ThreadType};
use crate::traits::{MembershipStore, NotificationSink, PermissionPolicy, PushRescinder};

mod commit;
mod descendants;

pub use commit::{CommitOptions, CommitResult};
pub use descendants::DescendantMergeError;
pub(crate) use descendants::{AncestorChanges, ChangedAncestor, DescendantInfo, DescendantUser};

/// Engine-level configuration. Batch sizes are deliberately not configurable.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig<T> {
    /// A thread whose co-membership implies no relationship rows. Deployments with a
    /// universal root thread exempt it here, since pairwise rows across its membership would
    /// be quadratic noise.
    pub relationship_exempt: Option<T>,
}

impl<T> Default for EngineConfig<T> {
    fn default() -> Self {
        Self {
            relationship_exempt: None,
        }
    }
}

/// Options for [`MembershipGraph::change_role`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ChangeRoleOptions {
    /// Mark the thread unread for users who become members through this operation.
    pub set_new_members_to_unread: bool,
}

#[derive(Debug, Error)]
pub enum EngineError<U, T, R, SE, NE, XE>
where
    U: UserId,
    T: ThreadId,
    R: RoleId,
    SE: std::error::Error,
    NE: std::error::Error,
    XE: std::error::Error,
{
    /// A thread row disappeared between resolving its metadata and using it.
    #[error("thread {0} not found")]
    ThreadNotFound(T),

    #[error("role {role} not found in thread {thread}")]
    RoleNotFound { thread: T, role: R },

    /// A role change that structurally cannot match its join/leave intent: a join compiled to
    /// a non-positive role, or a leave to a positive one. Nothing is written.
    #[error(
        "role change with intent {intent:?} for user {user} in thread {thread} resulted in role {resulting}"
    )]
    IntentMismatch {
        intent: Intent,
        user: U,
        thread: T,
        resulting: RoleAssignment<R>,
    },

    /// Two rows with contradictory non-`None` intents were produced for the same user and
    /// thread within one changeset.
    #[error("conflicting intents for user {user} in thread {thread}")]
    ConflictingIntents { user: U, thread: T },

    #[error(transparent)]
    Scheduler(#[from] DepthQueueError<DescendantMergeError<T>>),

    #[error("store error: {0}")]
    Store(SE),

    #[error("notification sink error: {0}")]
    Notify(NE),

    #[error("push rescission error: {0}")]
    Rescind(XE),
}

/// Error alias binding [`EngineError`] to the collaborator types of a concrete engine.
pub type GraphError<U, T, R, S, N, X> = EngineError<
    U,
    T,
    R,
    <S as MembershipStore<U, T, R>>::Error,
    <N as NotificationSink<U, T>>::Error,
    <X as PushRescinder<U, T>>::Error,
>;

/// Orchestrates membership and permission recomputation over the thread tree.
#[derive(Debug)]
pub struct MembershipGraph<U, T, R, P, S, N, X> {
    store: S,
    policy: P,
    notifications: N,
    push: X,
    relationship_exempt: Option<T>,
    _phantom: PhantomData<(U, R)>,
}

/// The output of one shared compilation step: the new blob, its child projection and the role
/// that can actually be held with it.
pub(crate) struct CompiledMembership<R, B> {
    pub permissions: Option<B>,
    pub permissions_for_children: Option<B>,
    pub new_role: RoleAssignment<R>,
}

impl<R, B> CompiledMembership<R, B> {
    /// Turn the compiled result into a row-level mutation: a save when any permissions
    /// remain, otherwise a soft delete.
    pub(crate) fn into_row<U, T>(
        self,
        intent: Intent,
        user_id: U,
        thread_id: T,
        old_role: RoleAssignment<R>,
        needs_full_thread_details: bool,
        unread: bool,
    ) -> MembershipRow<U, T, R, B> {
        match self.permissions {
            Some(permissions) => MembershipRow::Save(MembershipSave {
                intent,
                user_id,
                thread_id,
                role: self.new_role,
                permissions,
                permissions_for_children: self.permissions_for_children,
                needs_full_thread_details,
                old_role,
                unread,
            }),
            None => MembershipRow::Delete(MembershipDelete {
                intent,
                user_id,
                thread_id,
                old_role,
            }),
        }
    }
}

/// The single compilation path shared by `change_role`, thread recalculation and the
/// descendant cascade.
///
/// Containing-thread gating happens here: a user who is not a member of the containing thread
/// loses their role grants and is targeted at the ghost role before compilation.
pub(crate) fn compile_membership<T, R, P>(
    policy: &P,
    member_of_containing: bool,
    target_role: RoleAssignment<R>,
    role_permissions: Option<&P::RolePermissions>,
    permissions_from_parent: Option<&P::Blob>,
    thread_id: T,
    thread_type: ThreadType,
) -> CompiledMembership<R, P::Blob>
where
    T: ThreadId,
    R: RoleId,
    P: PermissionPolicy<T, R>,
{
    let (role_permissions, target_role) = if member_of_containing {
        (role_permissions, target_role)
    } else {
        (None, RoleAssignment::Never)
    };

    let permissions = policy.compile(
        role_permissions,
        permissions_from_parent,
        thread_id,
        thread_type,
    );
    let permissions_for_children = permissions
        .as_ref()
        .and_then(|blob| policy.project_for_children(blob));
    let new_role = policy.effective_role(target_role, permissions.as_ref());

    CompiledMembership {
        permissions,
        permissions_for_children,
        new_role,
    }
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
    pub fn new(store: S, policy: P, notifications: N, push: X, config: EngineConfig<T>) -> Self {
        Self {
            store,
            policy,
            notifications,
            push,
            relationship_exempt: config.relationship_exempt,
            _phantom: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn notifications(&self) -> &N {
        &self.notifications
    }

    pub fn push(&self) -> &X {
        &self.push
    }

    /// Whether co-membership in `thread_id` implies relationship rows.
    pub(crate) fn tracks_relationships(&self, thread_id: T) -> bool {
        self.relationship_exempt != Some(thread_id)
    }

    /// Apply a role change to an explicit set of users in one thread.
    ///
    /// Computes the full changeset including every cascading descendant update; nothing is
    /// written until the changeset is passed to [`commit`](Self::commit). An empty user set
    /// returns an empty changeset.
    pub async fn change_role(
        &self,
        thread_id: T,
        user_ids: &[U],
        target: RoleTarget<R>,
        options: ChangeRoleOptions,
    ) -> Result<Changeset<U, T, R, P::Blob>, GraphError<U, T, R, S, N, X>> {
        let intent = if target.is_removal() {
            Intent::Leave
        } else {
            Intent::Join
        };
        let set_new_members_to_unread =
            options.set_new_members_to_unread && intent == Intent::Join;

        if user_ids.is_empty() {
            return Ok(Changeset::new());
        }

        let (thread, intended_role, intended_role_permissions) =
            self.resolve_role_thread(thread_id, target).await?;

        let memberships = self
            .store
            .memberships(thread_id)
            .await
            .map_err(EngineError::Store)?;

        // Ancestor context is only fetched for the users actually in the request; membership
        // in the containing thread only needs to be checked when users are joining.
        let mut permissions_from_parent: HashMap<U, Option<P::Blob>> = HashMap::new();
        if let Some(parent_id) = thread.parent_id {
            let parent_rows = self
                .store
                .memberships_of(parent_id, user_ids)
                .await
                .map_err(EngineError::Store)?;
            for row in parent_rows {
                permissions_from_parent.insert(row.user_id, row.permissions_for_children);
            }
        }
        let mut member_of_containing: HashMap<U, bool> = HashMap::new();
        if intent == Intent::Join {
            if let Some(containing_id) = thread.containing_id {
                let containing_rows = self
                    .store
                    .memberships_of(containing_id, user_ids)
                    .await
                    .map_err(EngineError::Store)?;
                for row in containing_rows {
                    member_of_containing.insert(row.user_id, row.role.is_member());
                }
            }
        }

        let existing: HashMap<U, _> = memberships
            .into_iter()
            .map(|row| (row.user_id, row))
            .collect();
        let existing_member_ids: Vec<U> = existing.keys().copied().collect();

        let mut changeset = Changeset::new();
        if self.tracks_relationships(thread_id) {
            changeset
                .relationship_changeset
                .set_all_relationships_exist(&existing_member_ids);
        }

        let mut to_update_descendants: HashMap<U, AncestorChanges<P::Blob>> = HashMap::new();
        for &user_id in user_ids {
            let existing_membership = existing.get(&user_id);
            let old_role = existing_membership
                .map(|row| row.role)
                .unwrap_or(RoleAssignment::Never);

            if existing_membership.is_some() && old_role == intended_role {
                // The row already holds the intended role; nothing to update.
                continue;
            }
            if old_role.is_member() && matches!(target, RoleTarget::Default) {
                // Adding somebody who already holds a positive role is a no-op.
                continue;
            }

            let gated_in = if thread.containing_id.is_none() {
                true
            } else {
                member_of_containing.get(&user_id).copied().unwrap_or(false)
            };
            let from_parent = permissions_from_parent
                .get(&user_id)
                .cloned()
                .unwrap_or(None);

            let compiled = compile_membership(
                &self.policy,
                gated_in,
                intended_role,
                intended_role_permissions.as_ref(),
                from_parent.as_ref(),
                thread_id,
                thread.thread_type,
            );
            let new_role = compiled.new_role;

            let user_became_member = !old_role.is_member() && new_role.is_member();
            let user_lost_membership = old_role.is_member() && !new_role.is_member();

            if (intent == Intent::Join && !new_role.is_member())
                || (intent == Intent::Leave && new_role.is_member())
            {
                return Err(EngineError::IntentMismatch {
                    intent,
                    user: user_id,
                    thread: thread_id,
                    resulting: new_role,
                });
            } else if intended_role != new_role {
                warn!(
                    user = %user_id,
                    thread = %thread_id,
                    requested = %intended_role,
                    resulting = %new_role,
                    "role change resulted in a different role than requested, probably \
                     because the baseline visibility grant was unexpectedly present or missing"
                );
            }

            let old_permissions = existing_membership.and_then(|row| row.permissions.as_ref());
            let old_permissions_for_children =
                existing_membership.and_then(|row| row.permissions_for_children.as_ref());
            if existing_membership.is_some()
                && compiled.permissions.as_ref() == old_permissions
                && old_role == new_role
            {
                // This thread and its whole subtree need no updates for this user: the
                // membership row is unchanged by this operation.
                continue;
            }

            if compiled.permissions.is_some()
                && existing_membership.is_none()
                && self.tracks_relationships(thread_id)
            {
                // A row is being created for a user who had none; they need relationship
                // rows with every existing member. Rows amongst the new members themselves
                // are handled at commit time.
                changeset
                    .relationship_changeset
                    .set_relationships_needed(user_id, &existing_member_ids);
            }

            if user_lost_membership
                || compiled.permissions_for_children.as_ref() != old_permissions_for_children
            {
                to_update_descendants.insert(
                    user_id,
                    AncestorChanges {
                        user_is_member: new_role.is_member(),
                        permissions_for_children: compiled.permissions_for_children.clone(),
                    },
                );
            }

            changeset.membership_rows.push(compiled.into_row(
                intent,
                user_id,
                thread_id,
                old_role,
                user_became_member,
                user_became_member && set_new_members_to_unread,
            ));
        }

        if !to_update_descendants.is_empty() {
            let descendant_changeset = self
                .update_descendant_permissions(ChangedAncestor {
                    thread_id,
                    depth: thread.depth,
                    changes_by_user: to_update_descendants,
                })
                .await?;
            changeset.extend(descendant_changeset);
        }

        Ok(changeset)
    }

    /// Recompute every current membership row of one thread from scratch.
    ///
    /// Used when a role's permission bits themselves changed: each member is recompiled with
    /// their existing role assignment, through the same compilation path as
    /// [`change_role`](Self::change_role). Members of the parent thread without a row here
    /// are considered too, since they may deserve an inherited-permissions row.
    pub async fn recalculate_thread_permissions(
        &self,
        thread_id: T,
    ) -> Result<Changeset<U, T, R, P::Blob>, GraphError<U, T, R, S, N, X>> {
        let context = self
            .store
            .thread_context(thread_id)
            .await
            .map_err(EngineError::Store)?
            .ok_or(EngineError::ThreadNotFound(thread_id))?;
        let thread = context.thread;

        let mut users: HashMap<U, DescendantUser<R, P::Blob, P::RolePermissions>> = context
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
                    potentially_needs_update: true,
                    ..Default::default()
                };
                (member.user_id, user)
            })
            .collect();

        let mut changeset = Changeset::new();
        if let Some(parent_id) = thread.parent_id {
            let parent_rows = self
                .store
                .memberships(parent_id)
                .await
                .map_err(EngineError::Store)?;
            if self.tracks_relationships(parent_id) {
                // Co-members of the parent were cross-linked when its rows were written;
                // marking them here keeps the commit from re-upserting those pairs.
                let parent_member_ids: Vec<U> =
                    parent_rows.iter().map(|row| row.user_id).collect();
                changeset
                    .relationship_changeset
                    .set_all_relationships_exist(&parent_member_ids);
            }
            for row in parent_rows {
                let user = users.entry(row.user_id).or_default();
                user.cur_permissions_from_parent = row.permissions_for_children;
                user.potentially_needs_update = true;
            }
        }

        let cascade = self.recompute_descendant(DescendantInfo { thread, users }, &mut changeset);
        if let Some(ancestor) = cascade {
            changeset.extend(self.update_descendant_permissions(ancestor).await?);
        }

        Ok(changeset)
    }

    /// Recompute and commit every thread in the system, one thread at a time.
    ///
    /// Threads are handled strictly sequentially so a parent's committed changeset is visible
    /// before any child's recalculation starts; interleaving them could let a stale child
    /// calculation overwrite a fresher one.
    pub async fn recalculate_all_threads(
        &mut self,
        viewer: U,
    ) -> Result<(), GraphError<U, T, R, S, N, X>> {
        let thread_ids = self.store.thread_ids().await.map_err(EngineError::Store)?;
        for thread_id in thread_ids {
            let changeset = self.recalculate_thread_permissions(thread_id).await?;
            self.commit(viewer, changeset, Default::default()).await?;
        }
        Ok(())
    }

    /// Resolve the thread record, the intended role assignment and that role's raw grants for
    /// a `change_role` call.
    async fn resolve_role_thread(
        &self,
        thread_id: T,
        target: RoleTarget<R>,
    ) -> Result<
        (
            ThreadRecord<T, R>,
            RoleAssignment<R>,
            Option<P::RolePermissions>,
        ),
        GraphError<U, T, R, S, N, X>,
    > {
        let thread = self
            .store
            .thread(thread_id)
            .await
            .map_err(EngineError::Store)?
            .ok_or(EngineError::ThreadNotFound(thread_id))?;

        let (intended_role, role_permissions) = match target {
            RoleTarget::Remove => (RoleAssignment::Removed, None),
            RoleTarget::Ghost => (RoleAssignment::Never, None),
            RoleTarget::Role(_) | RoleTarget::Default => {
                let role = match target {
                    RoleTarget::Role(role) => role,
                    _ => thread.default_role,
                };
                let permissions = self
                    .store
                    .role_permissions(thread_id, role)
                    .await
                    .map_err(EngineError::Store)?
                    .ok_or(EngineError::RoleNotFound {
                        thread: thread_id,
                        role,
                    })?;
                (RoleAssignment::Active(role), Some(permissions))
            }
        };

        Ok((thread, intended_role, role_permissions))
    }
}
