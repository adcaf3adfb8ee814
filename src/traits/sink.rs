// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use crate::ids::{ThreadId, UserId};

/// The kind of per-user event emitted when a commit touches a membership row.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadEventKind {
    /// The user became a member and needs the full thread detail.
    Joined,
    /// The user lost their row (or dropped to a ghost role).
    Removed,
    /// Something about the thread or the user's row changed.
    Updated,
}

/// A typed per-user notification produced by the committer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThreadEvent<U, T> {
    pub user_id: U,
    pub thread_id: T,
    pub kind: ThreadEventKind,
    pub time: u64,
}

/// Delivery sink for per-user notification events.
///
/// Ordering and delivery guarantees beyond "eventually delivered per user" are the sink's
/// concern.
#[trait_variant::make(NotificationSink: Send)]
pub trait LocalNotificationSink<U, T>
where
    U: UserId,
    T: ThreadId,
{
    type Error: Error;

    async fn deliver(&mut self, events: &[ThreadEvent<U, T>]) -> Result<(), Self::Error>;
}

/// Sink invalidating pending push notifications for users who lost access to a thread.
#[trait_variant::make(PushRescinder: Send)]
pub trait LocalPushRescinder<U, T>
where
    U: UserId,
    T: ThreadId,
{
    type Error: Error;

    async fn rescind(&mut self, pairs: &[(U, T)]) -> Result<(), Self::Error>;
}
