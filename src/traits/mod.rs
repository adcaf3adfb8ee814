// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contracts for the engine's external collaborators: the permission compiler, the relational
//! store and the notification sinks.

mod policy;
mod sink;
mod store;

pub use policy::PermissionPolicy;
pub use sink::{
    LocalNotificationSink, LocalPushRescinder, NotificationSink, PushRescinder, ThreadEvent,
    ThreadEventKind,
};
pub use store::{
    LocalMembershipStore, MemberContext, MembershipStore, ThreadContext,
};
