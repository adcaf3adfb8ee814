// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(dead_code)]

use stratum::test_utils::{MemoryStore, Perms, TestPolicy, TestRescinder, TestSink, perms};
use stratum::{EngineConfig, MembershipGraph, ThreadRecord, ThreadType};

pub type User = &'static str;
pub type Thread = &'static str;
pub type Role = &'static str;
pub type Store = MemoryStore<User, Thread, Role>;
pub type Graph = MembershipGraph<
    User,
    Thread,
    Role,
    TestPolicy,
    Store,
    TestSink<User, Thread>,
    TestRescinder<User, Thread>,
>;

pub fn graph(store: Store) -> Graph {
    graph_with(store, EngineConfig::default())
}

pub fn graph_with(store: Store, config: EngineConfig<Thread>) -> Graph {
    MembershipGraph::new(
        store,
        TestPolicy,
        TestSink::default(),
        TestRescinder::default(),
        config,
    )
}

pub fn thread(
    id: Thread,
    parent: Option<Thread>,
    containing: Option<Thread>,
    depth: u32,
) -> ThreadRecord<Thread, Role> {
    ThreadRecord {
        id,
        thread_type: ThreadType(0),
        parent_id: parent,
        containing_id: containing,
        depth,
        default_role: "member",
    }
}

/// Grants of the default member role. The `descendant_` grants keep propagating down the
/// tree, giving non-members of child threads observer access.
pub fn member_grants() -> Perms {
    perms(&[
        "know_of",
        "visible",
        "voiced",
        "descendant_know_of",
        "descendant_visible",
    ])
}

/// What a member's grants compile to one level down, for a user without a role there.
pub fn observer_grants() -> Perms {
    perms(&["know_of", "visible", "descendant_know_of", "descendant_visible"])
}
