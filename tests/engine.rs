// SPDX-License-Identifier: MIT OR Apache-2.0

mod common;

use common::{Graph, Store, graph, graph_with, member_grants, observer_grants, thread};
use stratum::test_utils::{Subscription, perms, setup_logging};
use stratum::{
    ChangeRoleOptions, EngineConfig, EngineError, Intent, MembershipRow, RoleAssignment,
    RoleTarget, ThreadEventKind,
};

async fn join(graph: &mut Graph, thread_id: &'static str, user_id: &'static str) {
    let changeset = graph
        .change_role(
            thread_id,
            &[user_id],
            RoleTarget::Default,
            ChangeRoleOptions::default(),
        )
        .await
        .unwrap();
    graph
        .commit(user_id, changeset, Default::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn joining_creates_a_membership_row() {
    let mut store = Store::new();
    store.insert_thread(thread("root", None, None, 0));
    store.insert_role("root", "member", member_grants());
    let mut graph = graph(store);

    let changeset = graph
        .change_role(
            "root",
            &["alice"],
            RoleTarget::Default,
            ChangeRoleOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(changeset.membership_rows.len(), 1);
    match &changeset.membership_rows[0] {
        MembershipRow::Save(save) => {
            assert_eq!(save.intent, Intent::Join);
            assert_eq!(save.role, RoleAssignment::Active("member"));
            assert_eq!(save.old_role, RoleAssignment::Never);
            assert!(save.needs_full_thread_details);
            assert_eq!(save.permissions, member_grants());
        }
        row => panic!("expected a save row, got {row:?}"),
    }

    let result = graph
        .commit("alice", changeset, Default::default())
        .await
        .unwrap();
    assert_eq!(result.viewer_events.len(), 1);
    assert_eq!(result.viewer_events[0].kind, ThreadEventKind::Joined);
    assert_eq!(result.changed_thread_ids, vec!["root"]);

    let stored = graph.store().membership("alice", "root").unwrap();
    assert_eq!(stored.role, RoleAssignment::Active("member"));
    assert_eq!(stored.permissions, Some(member_grants()));
    assert_eq!(
        stored.subscription,
        Subscription {
            home: true,
            push_notifs: true
        }
    );
}

#[tokio::test]
async fn second_member_gets_a_relationship_row() {
    let mut store = Store::new();
    store.insert_thread(thread("root", None, None, 0));
    store.insert_role("root", "member", member_grants());
    let mut graph = graph(store);

    join(&mut graph, "root", "alice").await;
    assert!(!graph.store().relationship_exists("alice", "bob"));

    join(&mut graph, "root", "bob").await;
    assert!(graph.store().relationship_exists("alice", "bob"));
}

#[tokio::test]
async fn exempt_thread_creates_no_relationship_rows() {
    let mut store = Store::new();
    store.insert_thread(thread("root", None, None, 0));
    store.insert_role("root", "member", member_grants());
    let mut graph = graph_with(
        store,
        EngineConfig {
            relationship_exempt: Some("root"),
        },
    );

    join(&mut graph, "root", "alice").await;
    join(&mut graph, "root", "bob").await;
    assert!(!graph.store().relationship_exists("alice", "bob"));
}

#[tokio::test]
async fn empty_user_set_is_a_noop() {
    let mut store = Store::new();
    store.insert_thread(thread("root", None, None, 0));
    store.insert_role("root", "member", member_grants());
    let graph = graph(store);

    let changeset = graph
        .change_role("root", &[], RoleTarget::Default, ChangeRoleOptions::default())
        .await
        .unwrap();
    assert!(changeset.is_empty());
}

#[tokio::test]
async fn repeated_role_changes_are_noops() {
    let mut store = Store::new();
    store.insert_thread(thread("root", None, None, 0));
    store.insert_role("root", "member", member_grants());
    let mut graph = graph(store);

    join(&mut graph, "root", "alice").await;

    // Adding an existing member without naming a role changes nothing.
    let changeset = graph
        .change_role(
            "root",
            &["alice"],
            RoleTarget::Default,
            ChangeRoleOptions::default(),
        )
        .await
        .unwrap();
    assert!(changeset.is_empty());

    // Neither does re-assigning the role they already hold.
    let changeset = graph
        .change_role(
            "root",
            &["alice"],
            RoleTarget::Role("member"),
            ChangeRoleOptions::default(),
        )
        .await
        .unwrap();
    assert!(changeset.is_empty());
}

#[tokio::test]
async fn new_members_can_be_marked_unread() {
    let mut store = Store::new();
    store.insert_thread(thread("root", None, None, 0));
    store.insert_role("root", "member", member_grants());
    let mut graph = graph(store);

    let changeset = graph
        .change_role(
            "root",
            &["alice"],
            RoleTarget::Default,
            ChangeRoleOptions {
                set_new_members_to_unread: true,
            },
        )
        .await
        .unwrap();
    graph
        .commit("alice", changeset, Default::default())
        .await
        .unwrap();

    assert!(graph.store().membership("alice", "root").unwrap().unread);
}

#[tokio::test]
async fn join_propagates_observer_rows_to_descendants() {
    let mut store = Store::new();
    store.insert_thread(thread("community", None, None, 0));
    store.insert_thread(thread("channel", Some("community"), Some("community"), 1));
    store.insert_role("community", "member", member_grants());
    store.insert_role("channel", "member", member_grants());
    let mut graph = graph(store);

    join(&mut graph, "community", "alice").await;
    join(&mut graph, "channel", "alice").await;

    let changeset = graph
        .change_role(
            "community",
            &["bob"],
            RoleTarget::Default,
            ChangeRoleOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(changeset.membership_rows.len(), 2);

    let channel_row = changeset
        .membership_rows
        .iter()
        .find(|row| row.thread_id() == "channel")
        .unwrap();
    match channel_row {
        MembershipRow::Save(save) => {
            assert_eq!(save.user_id, "bob");
            assert_eq!(save.intent, Intent::None);
            assert_eq!(save.role, RoleAssignment::Removed);
            assert_eq!(save.permissions, observer_grants());
            assert!(!save.needs_full_thread_details);
        }
        row => panic!("expected a save row, got {row:?}"),
    }

    let result = graph
        .commit("bob", changeset, Default::default())
        .await
        .unwrap();
    // Bob joined the community and can now see the channel through his observer row, so he
    // hears about both threads.
    assert_eq!(result.viewer_events.len(), 2);
    let joined = result
        .viewer_events
        .iter()
        .find(|event| event.thread_id == "community")
        .unwrap();
    assert_eq!(joined.kind, ThreadEventKind::Joined);
    let observer = result
        .viewer_events
        .iter()
        .find(|event| event.thread_id == "channel")
        .unwrap();
    assert_eq!(observer.kind, ThreadEventKind::Updated);

    let stored = graph.store().membership("bob", "channel").unwrap();
    assert_eq!(stored.role, RoleAssignment::Removed);
    assert!(graph.store().relationship_exists("alice", "bob"));
}

#[tokio::test]
async fn removal_cascades_down_the_tree() {
    setup_logging();
    let mut store = Store::new();
    store.insert_thread(thread("community", None, None, 0));
    store.insert_thread(thread("channel", Some("community"), Some("community"), 1));
    store.insert_role("community", "member", member_grants());
    store.insert_role("channel", "member", member_grants());
    let mut graph = graph(store);

    join(&mut graph, "community", "alice").await;
    join(&mut graph, "channel", "alice").await;
    join(&mut graph, "community", "bob").await;
    join(&mut graph, "channel", "bob").await;

    let changeset = graph
        .change_role(
            "community",
            &["bob"],
            RoleTarget::Remove,
            ChangeRoleOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(changeset.membership_rows.len(), 2);
    assert!(changeset
        .membership_rows
        .iter()
        .all(|row| matches!(row, MembershipRow::Delete(_)) && row.user_id() == "bob"));

    let result = graph
        .commit("alice", changeset, Default::default())
        .await
        .unwrap();
    // Alice sees both threads update; bob got two removal events.
    assert_eq!(result.viewer_events.len(), 2);
    assert!(result
        .viewer_events
        .iter()
        .all(|event| event.kind == ThreadEventKind::Updated));
    let removals: Vec<_> = graph
        .notifications()
        .delivered
        .iter()
        .filter(|event| event.user_id == "bob" && event.kind == ThreadEventKind::Removed)
        .collect();
    assert_eq!(removals.len(), 2);
    assert!(removals.iter().any(|event| event.thread_id == "community"));
    assert!(removals.iter().any(|event| event.thread_id == "channel"));

    for thread_id in ["community", "channel"] {
        let stored = graph.store().membership("bob", thread_id).unwrap();
        assert_eq!(stored.role, RoleAssignment::Never);
        assert_eq!(stored.permissions, None);
        assert_eq!(
            stored.subscription,
            Subscription {
                home: false,
                push_notifs: false
            }
        );
    }

    let rescinded: Vec<_> = graph.push().batches.concat();
    assert_eq!(rescinded.len(), 2);
    assert!(rescinded.contains(&("bob", "community")));
    assert!(rescinded.contains(&("bob", "channel")));
}

#[tokio::test]
async fn promotion_emits_a_single_save_row() {
    let mut store = Store::new();
    store.insert_thread(thread("root", None, None, 0));
    store.insert_role("root", "member", member_grants());
    let mut admin_grants = member_grants();
    admin_grants.extend(perms(&["manage"]));
    store.insert_role("root", "admin", admin_grants.clone());
    let mut graph = graph(store);

    join(&mut graph, "root", "alice").await;
    join(&mut graph, "root", "bob").await;

    let mut changeset = graph
        .change_role(
            "root",
            &["bob"],
            RoleTarget::Role("admin"),
            ChangeRoleOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(changeset.membership_rows.len(), 1);
    match &changeset.membership_rows[0] {
        MembershipRow::Save(save) => {
            assert_eq!(save.role, RoleAssignment::Active("admin"));
            assert_eq!(save.old_role, RoleAssignment::Active("member"));
            assert_eq!(save.permissions, admin_grants);
            // Bob was already a member, so no join notification and no new
            // relationship rows.
            assert!(!save.needs_full_thread_details);
        }
        row => panic!("expected a save row, got {row:?}"),
    }
    let relationship_rows = std::mem::take(&mut changeset.relationship_changeset).into_rows();
    assert!(relationship_rows.is_empty());
}

#[tokio::test]
async fn containing_edge_removal_ghosts_gated_descendants() {
    // t3 is gated by t1 through the containing edge while hanging off t2 as its parent.
    // None of the roles project grants to children, so removal from t1 must ghost the t3
    // row while leaving the t2 membership alone.
    let mut store = Store::new();
    store.insert_thread(thread("t1", None, None, 0));
    store.insert_thread(thread("t2", Some("t1"), None, 1));
    store.insert_thread(thread("t3", Some("t2"), Some("t1"), 2));
    let basic = perms(&["know_of", "visible", "voiced"]);
    for thread_id in ["t1", "t2", "t3"] {
        store.insert_role(thread_id, "member", basic.clone());
    }
    let mut graph = graph(store);

    join(&mut graph, "t1", "bob").await;
    join(&mut graph, "t2", "bob").await;
    join(&mut graph, "t3", "bob").await;

    let changeset = graph
        .change_role(
            "t1",
            &["bob"],
            RoleTarget::Remove,
            ChangeRoleOptions::default(),
        )
        .await
        .unwrap();
    let mut touched: Vec<_> = changeset
        .membership_rows
        .iter()
        .map(|row| row.thread_id())
        .collect();
    touched.sort();
    assert_eq!(touched, vec!["t1", "t3"]);

    graph
        .commit("bob", changeset, Default::default())
        .await
        .unwrap();
    assert_eq!(
        graph.store().membership("bob", "t2").unwrap().role,
        RoleAssignment::Active("member")
    );
    let ghost = graph.store().membership("bob", "t3").unwrap();
    assert_eq!(ghost.role, RoleAssignment::Never);
    assert_eq!(ghost.permissions, None);
}

#[tokio::test]
async fn containing_membership_gates_joins() {
    let mut store = Store::new();
    store.insert_thread(thread("community", None, None, 0));
    store.insert_thread(thread("channel", Some("community"), Some("community"), 1));
    store.insert_role("community", "member", member_grants());
    store.insert_role("channel", "member", member_grants());
    let graph = graph(store);

    let err = graph
        .change_role(
            "channel",
            &["mallory"],
            RoleTarget::Default,
            ChangeRoleOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::IntentMismatch {
            user: "mallory",
            thread: "channel",
            intent: Intent::Join,
            ..
        }
    ));
}

#[tokio::test]
async fn unknown_thread_and_role_are_errors() {
    let mut store = Store::new();
    store.insert_thread(thread("root", None, None, 0));
    let graph = graph(store);

    let err = graph
        .change_role(
            "missing",
            &["alice"],
            RoleTarget::Default,
            ChangeRoleOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ThreadNotFound("missing")));

    let err = graph
        .change_role(
            "root",
            &["alice"],
            RoleTarget::Role("admin"),
            ChangeRoleOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::RoleNotFound {
            thread: "root",
            role: "admin"
        }
    ));
}

#[tokio::test]
async fn recalculation_picks_up_role_grant_changes() {
    let mut store = Store::new();
    store.insert_thread(thread("root", None, None, 0));
    store.insert_role("root", "member", member_grants());
    let mut graph = graph(store);

    join(&mut graph, "root", "alice").await;

    let mut grants = member_grants();
    grants.extend(perms(&["manage"]));
    graph.store_mut().insert_role("root", "member", grants.clone());

    let changeset = graph.recalculate_thread_permissions("root").await.unwrap();
    assert_eq!(changeset.membership_rows.len(), 1);
    match &changeset.membership_rows[0] {
        MembershipRow::Save(save) => {
            assert_eq!(save.intent, Intent::None);
            assert_eq!(save.role, RoleAssignment::Active("member"));
            assert_eq!(save.permissions, grants);
        }
        row => panic!("expected a save row, got {row:?}"),
    }
    graph
        .commit("alice", changeset, Default::default())
        .await
        .unwrap();

    let stored = graph.store().membership("alice", "root").unwrap();
    assert_eq!(stored.permissions, Some(grants));
    // A pure recompute never touches subscription state.
    assert_eq!(
        stored.subscription,
        Subscription {
            home: true,
            push_notifs: true
        }
    );

    // A second pass finds nothing left to do.
    let changeset = graph.recalculate_thread_permissions("root").await.unwrap();
    assert!(changeset.is_empty());
}

#[tokio::test]
async fn recalculation_adds_observer_rows_for_parent_members() {
    let mut store = Store::new();
    store.insert_thread(thread("community", None, None, 0));
    store.insert_thread(thread("channel", Some("community"), Some("community"), 1));
    store.insert_role("community", "member", member_grants());
    store.insert_role("channel", "member", member_grants());
    store.insert_membership(
        "alice",
        "community",
        RoleAssignment::Active("member"),
        Some(member_grants()),
    );
    let graph = graph(store);

    let changeset = graph
        .recalculate_thread_permissions("channel")
        .await
        .unwrap();
    assert_eq!(changeset.membership_rows.len(), 1);
    match &changeset.membership_rows[0] {
        MembershipRow::Save(save) => {
            assert_eq!(save.user_id, "alice");
            assert_eq!(save.role, RoleAssignment::Removed);
            assert_eq!(save.permissions, observer_grants());
        }
        row => panic!("expected a save row, got {row:?}"),
    }
}

#[tokio::test]
async fn recalculation_skips_relationship_pairs_known_from_the_parent() {
    let mut store = Store::new();
    store.insert_thread(thread("community", None, None, 0));
    store.insert_thread(thread("channel", Some("community"), Some("community"), 1));
    store.insert_role("community", "member", member_grants());
    store.insert_role("channel", "member", member_grants());
    for user_id in ["alice", "bob"] {
        store.insert_membership(
            user_id,
            "community",
            RoleAssignment::Active("member"),
            Some(member_grants()),
        );
    }
    let mut graph = graph(store);

    let changeset = graph
        .recalculate_thread_permissions("channel")
        .await
        .unwrap();
    assert_eq!(changeset.membership_rows.len(), 2);
    graph
        .commit("alice", changeset, Default::default())
        .await
        .unwrap();

    // Both users were cross-linked when they became co-members of the parent; no redundant
    // relationship row is written for their new observer rows.
    assert!(!graph.store().relationship_exists("alice", "bob"));
}

#[tokio::test]
async fn observers_under_an_exempt_parent_still_get_linked() {
    let mut store = Store::new();
    store.insert_thread(thread("community", None, None, 0));
    store.insert_thread(thread("channel", Some("community"), Some("community"), 1));
    store.insert_role("community", "member", member_grants());
    store.insert_role("channel", "member", member_grants());
    for user_id in ["alice", "bob"] {
        store.insert_membership(
            user_id,
            "community",
            RoleAssignment::Active("member"),
            Some(member_grants()),
        );
    }
    let mut graph = graph_with(
        store,
        EngineConfig {
            relationship_exempt: Some("community"),
        },
    );

    let changeset = graph
        .recalculate_thread_permissions("channel")
        .await
        .unwrap();
    graph
        .commit("alice", changeset, Default::default())
        .await
        .unwrap();

    // Co-membership in the exempt community implies no rows, so the channel's two new
    // observer rows are the first place these users meet.
    assert!(graph.store().relationship_exists("alice", "bob"));
}

#[tokio::test]
async fn deep_cascade_touches_each_thread_once() {
    setup_logging();
    let mut store = Store::new();
    store.insert_thread(thread("community", None, None, 0));
    store.insert_thread(thread("channel", Some("community"), Some("community"), 1));
    store.insert_thread(thread("subchannel", Some("channel"), Some("community"), 2));
    store.insert_role("community", "member", member_grants());
    store.insert_role("channel", "member", member_grants());
    store.insert_role("subchannel", "member", member_grants());
    let mut graph = graph(store);

    join(&mut graph, "community", "alice").await;
    join(&mut graph, "channel", "alice").await;
    join(&mut graph, "subchannel", "alice").await;

    // The subchannel is reachable from the community both via the containing edge and via
    // the channel's parent edge; it must still come out as a single row.
    let changeset = graph
        .change_role(
            "community",
            &["bob"],
            RoleTarget::Default,
            ChangeRoleOptions::default(),
        )
        .await
        .unwrap();
    let mut touched: Vec<_> = changeset
        .membership_rows
        .iter()
        .map(|row| row.thread_id())
        .collect();
    touched.sort();
    assert_eq!(touched, vec!["channel", "community", "subchannel"]);

    graph
        .commit("bob", changeset, Default::default())
        .await
        .unwrap();
    assert_eq!(
        graph.store().membership("bob", "subchannel").unwrap().role,
        RoleAssignment::Removed
    );
}

#[tokio::test]
async fn recalculate_all_threads_sweeps_in_order() {
    let mut store = Store::new();
    store.insert_thread(thread("community", None, None, 0));
    store.insert_thread(thread("channel", Some("community"), Some("community"), 1));
    store.insert_role("community", "member", member_grants());
    store.insert_role("channel", "member", member_grants());
    store.insert_membership(
        "alice",
        "community",
        RoleAssignment::Active("member"),
        Some(member_grants()),
    );
    let mut graph = graph(store);

    graph.recalculate_all_threads("alice").await.unwrap();

    let stored = graph.store().membership("alice", "channel").unwrap();
    assert_eq!(stored.role, RoleAssignment::Removed);
    assert_eq!(stored.permissions, Some(observer_grants()));
}
