//! Event application semantics: applying a delivered event twice must leave
//! the store identical to applying it once, and an authoritative snapshot
//! supersedes whatever stale events landed before it.

use chrono::Utc;
use guildhall_sync::{
    Activity, Community, Dispatcher, Privacy, Project, ProjectStatus, PushEvent, Store,
};
use std::collections::HashSet;

fn project(id: &str, progress: u8) -> Project {
    Project {
        id: id.into(),
        owner_id: "u1".into(),
        title: format!("project {id}"),
        description: String::new(),
        domain: "mentoring".into(),
        tech_tags: vec!["rust".into()],
        status: ProjectStatus::Active,
        progress,
        due_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn community(id: &str, member_count: u64) -> Community {
    Community {
        id: id.into(),
        name: format!("community {id}"),
        description: String::new(),
        category: "engineering".into(),
        privacy: Privacy::Public,
        member_count,
        post_count: 0,
        rules: Vec::new(),
        tags: HashSet::new(),
        joined: false,
    }
}

fn activity(id: &str) -> Activity {
    Activity {
        id: id.into(),
        actor_id: "u2".into(),
        kind: "note".into(),
        body: serde_json::Value::Null,
        created_at: Utc::now(),
    }
}

#[test]
fn redelivered_activity_lands_once() {
    let mut store = Store::new(100);
    let mut dispatcher = Dispatcher::new(16);
    let event = PushEvent::ActivityCreated {
        event_id: "e1".into(),
        activity: activity("a1"),
    };
    dispatcher.apply(event.clone(), &mut store);
    let rev = store.revision();
    dispatcher.apply(event, &mut store);
    assert_eq!(store.revision(), rev);
    assert_eq!(store.activity_len(), 1);
}

#[test]
fn redelivered_project_update_lands_once() {
    let mut store = Store::new(100);
    let mut dispatcher = Dispatcher::new(16);
    let event = PushEvent::ProjectUpdated {
        event_id: "e1".into(),
        project: project("p1", 60),
    };
    dispatcher.apply(event.clone(), &mut store);
    let rev = store.revision();
    dispatcher.apply(event, &mut store);
    assert_eq!(store.revision(), rev);
    assert_eq!(store.projects().len(), 1);
    assert_eq!(store.project("p1").unwrap().progress, 60);
}

#[test]
fn duplicate_member_joined_event_counts_once() {
    let mut store = Store::new(100);
    let mut dispatcher = Dispatcher::new(16);
    store.replace_communities(vec![community("c1", 10)]);

    let event = PushEvent::CommunityMemberJoined {
        event_id: "e1".into(),
        community_id: "c1".into(),
    };
    dispatcher.apply(event.clone(), &mut store);
    dispatcher.apply(event, &mut store);
    assert_eq!(store.community("c1").unwrap().member_count, 11);

    // A distinct event for the same community still counts.
    dispatcher.apply(
        PushEvent::CommunityMemberJoined {
            event_id: "e2".into(),
            community_id: "c1".into(),
        },
        &mut store,
    );
    assert_eq!(store.community("c1").unwrap().member_count, 12);
}

#[test]
fn redelivered_own_join_counts_once() {
    let mut store = Store::new(100);
    let mut dispatcher = Dispatcher::new(16);
    store.replace_communities(vec![community("c1", 10)]);

    let event = PushEvent::CommunityJoined {
        event_id: "e1".into(),
        community_id: "c1".into(),
    };
    dispatcher.apply(event.clone(), &mut store);
    dispatcher.apply(event, &mut store);
    let c = store.community("c1").unwrap();
    assert!(c.joined);
    assert_eq!(c.member_count, 11);
}

#[test]
fn full_state_sync_supersedes_stale_events() {
    let mut store = Store::new(100);
    let mut dispatcher = Dispatcher::new(16);
    store.replace_communities(vec![community("c1", 10)]);

    // Stale traffic applied before the snapshot arrives.
    dispatcher.apply(
        PushEvent::ProjectUpdated {
            event_id: "e1".into(),
            project: project("p-old", 10),
        },
        &mut store,
    );
    dispatcher.apply(
        PushEvent::CommunityMemberJoined {
            event_id: "e2".into(),
            community_id: "c1".into(),
        },
        &mut store,
    );

    let fresh_projects = vec![project("p1", 80), project("p2", 5)];
    let fresh_communities = vec![community("c1", 42), community("c2", 7)];
    let fresh_activity = vec![activity("a1")];
    dispatcher.apply(
        PushEvent::FullStateSync {
            projects: fresh_projects.clone(),
            communities: fresh_communities.clone(),
            activity: fresh_activity.clone(),
        },
        &mut store,
    );

    assert_eq!(store.projects(), fresh_projects.as_slice());
    assert_eq!(store.communities(), fresh_communities.as_slice());
    let ids: Vec<&str> = store.activity().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["a1"]);
}

#[test]
fn unknown_event_kind_is_ignored() {
    let mut store = Store::new(100);
    let mut dispatcher = Dispatcher::new(16);
    let rev = store.revision();
    dispatcher.apply(PushEvent::Unknown, &mut store);
    assert_eq!(store.revision(), rev);
}

#[test]
fn follower_notification_lands_once_on_timeline() {
    let mut store = Store::new(100);
    let mut dispatcher = Dispatcher::new(16);
    let event = PushEvent::IdentityFollowed {
        event_id: "e1".into(),
        follower_id: "u9".into(),
    };
    dispatcher.apply(event.clone(), &mut store);
    dispatcher.apply(event, &mut store);
    assert_eq!(store.activity_len(), 1);
    let record = store.activity().next().unwrap();
    assert_eq!(record.actor_id, "u9");
    assert_eq!(record.kind, "identity_followed");
}
