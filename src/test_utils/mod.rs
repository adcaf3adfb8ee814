// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory collaborators for tests: a map-backed store, a word-set permission policy and
//! collecting notification sinks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::convert::Infallible;

use crate::changeset::{Intent, MembershipSave};
use crate::ids::{RoleId, ThreadId, UserId};
use crate::model::{MembershipRecord, RoleAssignment, ThreadRecord, ThreadType};
use crate::traits::{
    MemberContext, MembershipStore, NotificationSink, PermissionPolicy, PushRescinder,
    ThreadContext, ThreadEvent,
};

impl UserId for u64 {}
impl UserId for &'static str {}
impl ThreadId for &'static str {}
impl RoleId for &'static str {}

/// Route engine tracing output to stderr when `RUST_LOG` is set.
#[cfg(feature = "test_utils")]
pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Compiled permissions and raw role grants are both plain word sets in tests.
pub type Perms = BTreeMap<String, bool>;

/// Build a word-set blob with every named grant enabled.
pub fn perms(grants: &[&str]) -> Perms {
    grants.iter().map(|grant| (grant.to_string(), true)).collect()
}

/// A word-set policy mirroring the grant-propagation rules of a real permission compiler,
/// small enough to reason about in assertions.
///
/// Compilation unions the inherited blob with the role grants. The result is kept only when it
/// contains the baseline `know_of` grant. Projection keeps `descendant_`-prefixed grants
/// (which keep propagating) and strips the prefix into the child's effective copy;
/// `child_`-prefixed grants reach direct children only.
#[derive(Clone, Copy, Debug, Default)]
pub struct TestPolicy;

impl<T, R> PermissionPolicy<T, R> for TestPolicy
where
    T: ThreadId,
    R: RoleId,
{
    type Blob = Perms;
    type RolePermissions = Perms;

    fn compile(
        &self,
        role_permissions: Option<&Perms>,
        permissions_from_parent: Option<&Perms>,
        _thread_id: T,
        _thread_type: ThreadType,
    ) -> Option<Perms> {
        let mut combined = permissions_from_parent.cloned().unwrap_or_default();
        if let Some(role_permissions) = role_permissions {
            combined.extend(role_permissions.clone());
        }
        if combined.get("know_of").copied().unwrap_or(false) {
            Some(combined)
        } else {
            None
        }
    }

    fn project_for_children(&self, permissions: &Perms) -> Option<Perms> {
        let mut projected = Perms::new();
        for (grant, value) in permissions {
            if !value {
                continue;
            }
            if let Some(stripped) = grant.strip_prefix("descendant_") {
                projected.insert(grant.clone(), true);
                projected.insert(stripped.to_string(), true);
            } else if let Some(stripped) = grant.strip_prefix("child_") {
                projected.insert(stripped.to_string(), true);
            }
        }
        if projected.is_empty() {
            None
        } else {
            Some(projected)
        }
    }

    fn effective_role(
        &self,
        target: RoleAssignment<R>,
        permissions: Option<&Perms>,
    ) -> RoleAssignment<R> {
        let visible = permissions
            .map(|blob| blob.get("know_of").copied().unwrap_or(false))
            .unwrap_or(false);
        if !visible {
            RoleAssignment::Never
        } else if let RoleAssignment::Active(role) = target {
            RoleAssignment::Active(role)
        } else {
            RoleAssignment::Removed
        }
    }
}

/// Per-user notification preferences attached to a membership row.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Subscription {
    pub home: bool,
    pub push_notifs: bool,
}

impl Subscription {
    fn joined() -> Self {
        Self {
            home: true,
            push_notifs: true,
        }
    }

    fn removed() -> Self {
        Self {
            home: false,
            push_notifs: false,
        }
    }
}

/// The full stored state of one membership row, including the fields the engine never reads
/// but the store must maintain.
#[derive(Clone, Debug)]
pub struct StoredMembership<R> {
    pub role: RoleAssignment<R>,
    pub permissions: Option<Perms>,
    pub permissions_for_children: Option<Perms>,
    pub subscription: Subscription,
    pub unread: bool,
    pub last_updated: u64,
}

/// Map-backed [`MembershipStore`] used across the test-suite.
#[derive(Debug, Default)]
pub struct MemoryStore<U, T, R>
where
    U: UserId,
    T: ThreadId,
    R: RoleId,
{
    threads: HashMap<T, ThreadRecord<T, R>>,
    thread_order: Vec<T>,
    roles: HashMap<(T, R), Perms>,
    memberships: HashMap<(U, T), StoredMembership<R>>,
    relationships: HashSet<(U, U)>,
}

impl<U, T, R> MemoryStore<U, T, R>
where
    U: UserId,
    T: ThreadId,
    R: RoleId,
{
    pub fn new() -> Self {
        Self {
            threads: HashMap::new(),
            thread_order: Vec::new(),
            roles: HashMap::new(),
            memberships: HashMap::new(),
            relationships: HashSet::new(),
        }
    }

    pub fn insert_thread(&mut self, thread: ThreadRecord<T, R>) {
        if !self.threads.contains_key(&thread.id) {
            self.thread_order.push(thread.id);
        }
        self.threads.insert(thread.id, thread);
    }

    pub fn insert_role(&mut self, thread_id: T, role: R, grants: Perms) {
        self.roles.insert((thread_id, role), grants);
    }

    /// Seed a membership row directly, bypassing the engine. `permissions_for_children` is
    /// derived with [`TestPolicy`].
    pub fn insert_membership(
        &mut self,
        user_id: U,
        thread_id: T,
        role: RoleAssignment<R>,
        permissions: Option<Perms>,
    ) {
        let permissions_for_children = permissions.as_ref().and_then(|blob| {
            PermissionPolicy::<T, R>::project_for_children(&TestPolicy, blob)
        });
        self.memberships.insert(
            (user_id, thread_id),
            StoredMembership {
                role,
                permissions,
                permissions_for_children,
                subscription: if role.is_member() {
                    Subscription::joined()
                } else {
                    Subscription::removed()
                },
                unread: false,
                last_updated: 0,
            },
        );
    }

    pub fn membership(&self, user_id: U, thread_id: T) -> Option<&StoredMembership<R>> {
        self.memberships.get(&(user_id, thread_id))
    }

    pub fn relationship_exists(&self, a: U, b: U) -> bool {
        self.relationships.contains(&(a, b)) || self.relationships.contains(&(b, a))
    }

    fn rows_of(&self, thread_id: T) -> Vec<MembershipRecord<U, T, R, Perms>> {
        let mut rows: Vec<_> = self
            .memberships
            .iter()
            .filter(|((_, t), _)| *t == thread_id)
            .map(|((user_id, _), stored)| MembershipRecord {
                user_id: *user_id,
                thread_id,
                role: stored.role,
                permissions: stored.permissions.clone(),
                permissions_for_children: stored.permissions_for_children.clone(),
            })
            .collect();
        rows.sort_by_key(|row| row.user_id);
        rows
    }

    fn context_of(&self, thread: &ThreadRecord<T, R>) -> ThreadContext<U, T, R, Perms, Perms> {
        let members = self
            .rows_of(thread.id)
            .into_iter()
            .map(|row| {
                let role_permissions = match row.role {
                    RoleAssignment::Active(role) => self.roles.get(&(thread.id, role)).cloned(),
                    _ => None,
                };
                let permissions_from_parent = thread.parent_id.and_then(|parent_id| {
                    self.memberships
                        .get(&(row.user_id, parent_id))
                        .and_then(|parent| parent.permissions_for_children.clone())
                });
                let member_of_containing = thread
                    .containing_id
                    .and_then(|containing_id| {
                        self.memberships.get(&(row.user_id, containing_id))
                    })
                    .map(|containing| containing.role.is_member())
                    .unwrap_or(false);
                MemberContext {
                    user_id: row.user_id,
                    role: row.role,
                    role_permissions,
                    permissions: row.permissions,
                    permissions_for_children: row.permissions_for_children,
                    permissions_from_parent,
                    member_of_containing,
                }
            })
            .collect();
        ThreadContext {
            thread: *thread,
            members,
        }
    }
}

impl<U, T, R> MembershipStore<U, T, R> for MemoryStore<U, T, R>
where
    U: UserId + Send + Sync,
    T: ThreadId + Send + Sync,
    R: RoleId + Send + Sync,
{
    type Blob = Perms;
    type RolePermissions = Perms;
    type Error = Infallible;

    async fn thread(&self, id: T) -> Result<Option<ThreadRecord<T, R>>, Infallible> {
        Ok(self.threads.get(&id).copied())
    }

    async fn role_permissions(&self, thread_id: T, role: R) -> Result<Option<Perms>, Infallible> {
        Ok(self.roles.get(&(thread_id, role)).cloned())
    }

    async fn thread_ids(&self) -> Result<Vec<T>, Infallible> {
        Ok(self.thread_order.clone())
    }

    async fn memberships(
        &self,
        thread_id: T,
    ) -> Result<Vec<MembershipRecord<U, T, R, Perms>>, Infallible> {
        Ok(self.rows_of(thread_id))
    }

    async fn memberships_of(
        &self,
        thread_id: T,
        user_ids: &[U],
    ) -> Result<Vec<MembershipRecord<U, T, R, Perms>>, Infallible> {
        Ok(self
            .rows_of(thread_id)
            .into_iter()
            .filter(|row| user_ids.contains(&row.user_id))
            .collect())
    }

    async fn thread_context(
        &self,
        thread_id: T,
    ) -> Result<Option<ThreadContext<U, T, R, Perms, Perms>>, Infallible> {
        Ok(self
            .threads
            .get(&thread_id)
            .map(|thread| self.context_of(thread)))
    }

    async fn descendant_contexts(
        &self,
        ancestors: &[T],
    ) -> Result<Vec<ThreadContext<U, T, R, Perms, Perms>>, Infallible> {
        Ok(self
            .thread_order
            .iter()
            .filter_map(|thread_id| self.threads.get(thread_id))
            .filter(|thread| {
                ancestors
                    .iter()
                    .any(|ancestor| thread.has_ancestor_edge(*ancestor))
            })
            .map(|thread| self.context_of(thread))
            .collect())
    }

    async fn save_memberships(
        &mut self,
        rows: &[MembershipSave<U, T, R, Perms>],
        time: u64,
    ) -> Result<(), Infallible> {
        for row in rows {
            match self.memberships.get_mut(&(row.user_id, row.thread_id)) {
                Some(stored) => {
                    // Subscription state survives pure permission recomputes; it only resets
                    // when membership itself starts or ends.
                    if stored.role.is_member() != row.role.is_member() {
                        stored.subscription = if row.role.is_member() {
                            Subscription::joined()
                        } else {
                            Subscription::removed()
                        };
                    }
                    stored.role = row.role;
                    stored.permissions = Some(row.permissions.clone());
                    stored.permissions_for_children = row.permissions_for_children.clone();
                    stored.last_updated = time;
                }
                None => {
                    let subscription = if row.intent == Intent::Join && row.role.is_member() {
                        Subscription::joined()
                    } else {
                        Subscription::removed()
                    };
                    self.memberships.insert(
                        (row.user_id, row.thread_id),
                        StoredMembership {
                            role: row.role,
                            permissions: Some(row.permissions.clone()),
                            permissions_for_children: row.permissions_for_children.clone(),
                            subscription,
                            unread: row.unread,
                            last_updated: time,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn ghost_memberships(&mut self, rows: &[(U, T)], time: u64) -> Result<(), Infallible> {
        for (user_id, thread_id) in rows {
            let ghost = StoredMembership {
                role: RoleAssignment::Never,
                permissions: None,
                permissions_for_children: None,
                subscription: Subscription::removed(),
                unread: false,
                last_updated: time,
            };
            self.memberships.insert((*user_id, *thread_id), ghost);
        }
        Ok(())
    }

    async fn upsert_relationships(&mut self, rows: &[(U, U)]) -> Result<(), Infallible> {
        for pair in rows {
            self.relationships.insert(*pair);
        }
        Ok(())
    }
}

/// Notification sink collecting every delivered event.
#[derive(Debug, Default)]
pub struct TestSink<U, T> {
    pub delivered: Vec<ThreadEvent<U, T>>,
}

impl<U, T> NotificationSink<U, T> for TestSink<U, T>
where
    U: UserId + Send + Sync,
    T: ThreadId + Send + Sync,
{
    type Error = Infallible;

    async fn deliver(&mut self, events: &[ThreadEvent<U, T>]) -> Result<(), Infallible> {
        self.delivered.extend_from_slice(events);
        Ok(())
    }
}

/// Push rescinder collecting every rescinded pair, with the batch boundaries preserved.
#[derive(Debug, Default)]
pub struct TestRescinder<U, T> {
    pub batches: Vec<Vec<(U, T)>>,
}

impl<U, T> PushRescinder<U, T> for TestRescinder<U, T>
where
    U: UserId + Send + Sync,
    T: ThreadId + Send + Sync,
{
    type Error = Infallible;

    async fn rescind(&mut self, pairs: &[(U, T)]) -> Result<(), Infallible> {
        self.batches.push(pairs.to_vec());
        Ok(())
    }
}
