// SPDX-License-Identifier: MIT OR Apache-2.0

//! Applying a computed [`Changeset`] to the store and the notification sinks.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::changeset::{Changeset, Intent, MembershipRow};
use crate::ids::{RoleId, ThreadId, UserId};
use crate::model::RoleAssignment;
use crate::traits::{
    MembershipStore, NotificationSink, PermissionPolicy, PushRescinder, ThreadEvent,
    ThreadEventKind,
};

use super::{EngineError, GraphError, MembershipGraph};

/// Membership rows written per store round-trip.
const MEMBERSHIP_WRITE_BATCH: usize = 50;
/// User/thread pairs rescinded per push round-trip.
const RESCIND_BATCH: usize = 3;

/// Options for [`MembershipGraph::commit`].
#[derive(Clone, Debug)]
pub struct CommitOptions<T> {
    /// Threads whose metadata changed in the same operation even if no membership row did.
    /// Their members receive an update notification too.
    pub changed_thread_ids: Vec<T>,
}

impl<T> Default for CommitOptions<T> {
    fn default() -> Self {
        Self {
            changed_thread_ids: Vec::new(),
        }
    }
}

/// What a commit produced for the calling user.
#[derive(Clone, Debug)]
pub struct CommitResult<U, T> {
    /// The events addressed to the viewer, so a caller can answer the originating request
    /// without waiting for sink delivery.
    pub viewer_events: Vec<ThreadEvent<U, T>>,
    /// Every thread an event was emitted for.
    pub changed_thread_ids: Vec<T>,
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
    /// Apply a changeset: write membership rows and relationship rows, rescind push
    /// notifications for users who lost access, and deliver one event per affected user and
    /// thread.
    ///
    /// Multiple changesets may be merged with [`Changeset::extend`] and committed together;
    /// duplicate rows for one user and thread are collapsed with the intent-carrying row
    /// winning. Two rows with contradictory intents fail the whole commit before anything is
    /// written.
    pub async fn commit(
        &mut self,
        viewer: U,
        changeset: Changeset<U, T, R, P::Blob>,
        options: CommitOptions<T>,
    ) -> Result<CommitResult<U, T>, GraphError<U, T, R, S, N, X>> {
        let Changeset {
            membership_rows,
            mut relationship_changeset,
        } = changeset;

        // Collapse duplicate rows per user and thread. A row carrying a join/leave intent
        // always beats an intentless recompute row; two contradictory intents are a bug in
        // the caller's batching.
        let mut rows: HashMap<(U, T), MembershipRow<U, T, R, P::Blob>> = HashMap::new();
        for row in membership_rows {
            let key = (row.user_id(), row.thread_id());
            match rows.get(&key) {
                Some(existing) => {
                    if existing.intent() != Intent::None && row.intent() != Intent::None {
                        return Err(EngineError::ConflictingIntents {
                            user: key.0,
                            thread: key.1,
                        });
                    }
                    if existing.intent() == Intent::None {
                        rows.insert(key, row);
                    }
                }
                None => {
                    rows.insert(key, row);
                }
            }
        }

        let mut changed_thread_ids: Vec<T> = Vec::new();
        let mut seen_threads: HashSet<T> = HashSet::new();
        for thread_id in options
            .changed_thread_ids
            .iter()
            .copied()
            .chain(rows.keys().map(|(_, thread_id)| *thread_id))
        {
            if seen_threads.insert(thread_id) {
                changed_thread_ids.push(thread_id);
            }
        }

        let mut saves = Vec::new();
        let mut deletes = Vec::new();
        let mut to_rescind = Vec::new();
        let mut users_by_thread: HashMap<T, Vec<U>> = HashMap::new();
        for ((user_id, thread_id), row) in &rows {
            users_by_thread
                .entry(*thread_id)
                .or_default()
                .push(*user_id);
            match row {
                MembershipRow::Save(save) => {
                    if !save.role.is_member() {
                        to_rescind.push((*user_id, *thread_id));
                    }
                    saves.push(save.clone());
                }
                MembershipRow::Delete(_) => {
                    to_rescind.push((*user_id, *thread_id));
                    deletes.push((*user_id, *thread_id));
                }
            }
        }

        // Users written into the same thread in one commit may never have seen each other in
        // an existing-member set; cross-link every touched row, ghost rows included, since
        // relationship rows outlive membership.
        for (thread_id, user_ids) in &users_by_thread {
            if self.tracks_relationships(*thread_id) {
                relationship_changeset.set_all_relationships_needed(user_ids);
            }
        }
        let relationship_rows = relationship_changeset.into_rows();

        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();

        if !relationship_rows.is_empty() {
            self.store
                .upsert_relationships(&relationship_rows)
                .await
                .map_err(EngineError::Store)?;
        }
        for batch in saves.chunks(MEMBERSHIP_WRITE_BATCH) {
            self.store
                .save_memberships(batch, time)
                .await
                .map_err(EngineError::Store)?;
        }
        for batch in deletes.chunks(MEMBERSHIP_WRITE_BATCH) {
            self.store
                .ghost_memberships(batch, time)
                .await
                .map_err(EngineError::Store)?;
        }
        for batch in to_rescind.chunks(RESCIND_BATCH) {
            self.push
                .rescind(batch)
                .await
                .map_err(EngineError::Rescind)?;
        }

        let mut events = Vec::new();
        for thread_id in &changed_thread_ids {
            // Members untouched by any explicit row still see the thread change.
            let members = self
                .store
                .memberships(*thread_id)
                .await
                .map_err(EngineError::Store)?;
            for member in members {
                if !member.role.is_never() && !rows.contains_key(&(member.user_id, *thread_id)) {
                    events.push(ThreadEvent {
                        user_id: member.user_id,
                        thread_id: *thread_id,
                        kind: ThreadEventKind::Updated,
                        time,
                    });
                }
            }
        }
        for ((user_id, thread_id), row) in &rows {
            let kind = match row {
                MembershipRow::Save(save) if save.role.is_member() => {
                    if save.needs_full_thread_details {
                        ThreadEventKind::Joined
                    } else {
                        ThreadEventKind::Updated
                    }
                }
                // An observer row keeps the thread visible, so a demotion to it (or a fresh
                // observer row) is an update, not a removal.
                MembershipRow::Save(save) if save.role == RoleAssignment::Removed => {
                    ThreadEventKind::Updated
                }
                _ => {
                    // A user who never had access has nothing to be removed from.
                    if row.old_role().is_never() {
                        continue;
                    }
                    ThreadEventKind::Removed
                }
            };
            events.push(ThreadEvent {
                user_id: *user_id,
                thread_id: *thread_id,
                kind,
                time,
            });
        }

        if !events.is_empty() {
            self.notifications
                .deliver(&events)
                .await
                .map_err(EngineError::Notify)?;
        }

        let viewer_events = events
            .into_iter()
            .filter(|event| event.user_id == viewer)
            .collect();

        Ok(CommitResult {
            viewer_events,
            changed_thread_ids,
        })
    }
}
