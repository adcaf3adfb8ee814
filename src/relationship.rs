// SPDX-License-Identifier: MIT OR Apache-2.0

//! Accumulator for the pairwise user relationship rows implied by co-membership.
//!
//! Whenever two users share a thread they must share a relationship row. Across one engine
//! operation many threads are touched, so the accumulator collects the full closure of pairs
//! and resolves each to one of two statuses: `Existing` (both users were already co-members
//! somewhere, so the row is assumed present) or `PotentiallyMissing` (a row may have to be
//! created). `Existing` always dominates.
//!
//! Finalization consumes the accumulator, so a half-drained instance can never be mutated
//! again.

use std::collections::HashMap;

use crate::ids::UserId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RelationshipStatus {
    Existing,
    PotentiallyMissing,
}

/// Collects and de-duplicates the relationship rows required by one operation.
#[derive(Clone, Debug, Default)]
pub struct RelationshipChangeset<U>
where
    U: UserId,
{
    statuses: HashMap<(U, U), RelationshipStatus>,
}

/// Normalised unordered pair key. Self-pairs carry no information and are dropped.
fn pair_key<U: UserId>(a: U, b: U) -> Option<(U, U)> {
    match a.cmp(&b) {
        std::cmp::Ordering::Less => Some((a, b)),
        std::cmp::Ordering::Greater => Some((b, a)),
        std::cmp::Ordering::Equal => None,
    }
}

impl<U> RelationshipChangeset<U>
where
    U: UserId,
{
    pub fn new() -> Self {
        Self {
            statuses: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    fn set(&mut self, a: U, b: U, status: RelationshipStatus) {
        let Some(key) = pair_key(a, b) else {
            return;
        };
        match self.statuses.get(&key) {
            // Existing wins over everything, including a later PotentiallyMissing.
            Some(RelationshipStatus::Existing) => (),
            _ => {
                self.statuses.insert(key, status);
            }
        }
    }

    /// Mark every pair within `user_ids` as already having a relationship row.
    ///
    /// Idempotent and symmetric. Called for the existing member set of a thread: co-members
    /// are guaranteed to have been cross-linked when they joined.
    pub fn set_all_relationships_exist(&mut self, user_ids: &[U]) {
        for (i, a) in user_ids.iter().enumerate() {
            for b in &user_ids[i + 1..] {
                self.set(*a, *b, RelationshipStatus::Existing);
            }
        }
    }

    /// Mark the pair of `user_id` with each of `other_ids` as potentially missing, unless
    /// already known to exist.
    pub fn set_relationships_needed(&mut self, user_id: U, other_ids: &[U]) {
        for other in other_ids {
            self.set(user_id, *other, RelationshipStatus::PotentiallyMissing);
        }
    }

    /// Mark every pair within `user_ids` as potentially missing, unless already known to
    /// exist. Used by the committer to cross-link all users saved into the same thread.
    pub fn set_all_relationships_needed(&mut self, user_ids: &[U]) {
        for (i, a) in user_ids.iter().enumerate() {
            for b in &user_ids[i + 1..] {
                self.set(*a, *b, RelationshipStatus::PotentiallyMissing);
            }
        }
    }

    /// Merge another accumulator into this one. `Existing` dominates; two
    /// `PotentiallyMissing` stay `PotentiallyMissing`.
    pub fn add_all(&mut self, other: Self) {
        for ((a, b), status) in other.statuses {
            self.set(a, b, status);
        }
    }

    /// Finalize the accumulator and surface the rows that need to be created.
    ///
    /// Consumes `self`: the accumulator cannot be mutated or drained twice.
    pub fn into_rows(self) -> Vec<(U, U)> {
        let mut rows: Vec<(U, U)> = self
            .statuses
            .into_iter()
            .filter_map(|(pair, status)| match status {
                RelationshipStatus::PotentiallyMissing => Some(pair),
                RelationshipStatus::Existing => None,
            })
            .collect();
        // Deterministic output order for batched writes and tests.
        rows.sort();
        rows
    }
}
