// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;
use std::fmt::Debug;

use crate::changeset::MembershipSave;
use crate::ids::{RoleId, ThreadId, UserId};
use crate::model::{MembershipRecord, RoleAssignment, ThreadRecord};

/// One membership row joined with the permission context needed to recompile it: the raw
/// grants of the user's current role, the projection inherited from the parent thread and
/// their membership status in the containing thread.
#[derive(Clone, Debug)]
pub struct MemberContext<U, R, B, RB> {
    pub user_id: U,
    pub role: RoleAssignment<R>,
    /// Raw grants of `role`; `None` when the role is not positive.
    pub role_permissions: Option<RB>,
    pub permissions: Option<B>,
    pub permissions_for_children: Option<B>,
    /// `permissions_for_children` of the same user's membership in the parent thread.
    pub permissions_from_parent: Option<B>,
    /// Whether the user holds a positive role in the containing thread. `false` when the
    /// thread has no containing link; the engine treats that case as ungated.
    pub member_of_containing: bool,
}

/// A thread together with the recompilation context of every one of its membership rows.
#[derive(Clone, Debug)]
pub struct ThreadContext<U, T, R, B, RB> {
    pub thread: ThreadRecord<T, R>,
    pub members: Vec<MemberContext<U, R, B, RB>>,
}

/// Interface for the relational thread/role/membership store.
///
/// Two variants of the trait are provided: one which is thread-safe (implementing `Sync`) and
/// one which is purely intended for single-threaded execution contexts.
///
/// All reads are batched point or range lookups; the engine never asks for unbounded scans
/// beyond [`thread_ids`](LocalMembershipStore::thread_ids). Writers must be atomic per batch
/// but no cross-table transactional atomicity is assumed.
#[trait_variant::make(MembershipStore: Send)]
pub trait LocalMembershipStore<U, T, R>
where
    U: UserId,
    T: ThreadId,
    R: RoleId,
{
    type Blob: Clone + Debug + PartialEq;
    type RolePermissions: Clone + Debug;
    type Error: Error;

    /// Point read of one thread row.
    async fn thread(&self, id: T) -> Result<Option<ThreadRecord<T, R>>, Self::Error>;

    /// Raw grants of one role owned by `thread_id`.
    async fn role_permissions(
        &self,
        thread_id: T,
        role: R,
    ) -> Result<Option<Self::RolePermissions>, Self::Error>;

    /// Every thread id in the system. Only used by the full recalculation sweep.
    async fn thread_ids(&self) -> Result<Vec<T>, Self::Error>;

    /// All membership rows of one thread, ghost rows included.
    async fn memberships(
        &self,
        thread_id: T,
    ) -> Result<Vec<MembershipRecord<U, T, R, Self::Blob>>, Self::Error>;

    /// Membership rows of one thread restricted to the given users. Implementations should
    /// use a keyed lookup, not a scan; the user set is the subset actually touched by the
    /// operation.
    async fn memberships_of(
        &self,
        thread_id: T,
        user_ids: &[U],
    ) -> Result<Vec<MembershipRecord<U, T, R, Self::Blob>>, Self::Error>;

    /// The full recompilation context of one thread: every membership row joined with its
    /// role grants, parent projection and containing-thread membership.
    async fn thread_context(
        &self,
        thread_id: T,
    ) -> Result<Option<ThreadContext<U, T, R, Self::Blob, Self::RolePermissions>>, Self::Error>;

    /// Contexts of every thread whose parent or containing thread is in `ancestors`.
    ///
    /// The engine calls this with bounded batches of ancestor ids.
    async fn descendant_contexts(
        &self,
        ancestors: &[T],
    ) -> Result<Vec<ThreadContext<U, T, R, Self::Blob, Self::RolePermissions>>, Self::Error>;

    /// Batched insert-or-update of membership rows.
    ///
    /// Subscription state must only be reset when the row's membership crosses the
    /// zero/positive role boundary (a join or leave); a pure permission recompute must leave
    /// it untouched. The `unread` flag applies on insert only.
    async fn save_memberships(
        &mut self,
        rows: &[MembershipSave<U, T, R, Self::Blob>],
        time: u64,
    ) -> Result<(), Self::Error>;

    /// Batched soft delete: the role becomes a ghost and permissions are cleared. Rows are
    /// never physically removed.
    async fn ghost_memberships(&mut self, rows: &[(U, T)], time: u64) -> Result<(), Self::Error>;

    /// Batched upsert of undirected relationship rows. Pairs are normalised (smaller id
    /// first) and may already exist.
    async fn upsert_relationships(&mut self, rows: &[(U, U)]) -> Result<(), Self::Error>;
}
