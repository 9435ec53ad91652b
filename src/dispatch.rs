//! Maps inbound push events to store mutations.
//!
//! Events are applied in receipt order. Absolute events lean on the store's
//! idempotent-mutation contract; count-only delta events are deduplicated
//! here by event id, inside a bounded FIFO window, because re-applying a
//! delta is not idempotent. A full-state-sync payload replaces the carried
//! slices wholesale and thereby supersedes any stale events applied before
//! it arrived.

use crate::store::Store;
use crate::types::{Activity, PushEvent};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};

/// Bounded remember-window for delta event ids, oldest evicted first.
struct EventDedup {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl EventDedup {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns true if the id was not seen before (and records it).
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

pub struct Dispatcher {
    deltas_seen: EventDedup,
}

impl Dispatcher {
    pub fn new(dedup_window: usize) -> Self {
        Self {
            deltas_seen: EventDedup::new(dedup_window),
        }
    }

    pub fn apply(&mut self, event: PushEvent, store: &mut Store) {
        match event {
            PushEvent::ActivityCreated { activity, .. } => {
                store.record_activity(activity);
            }
            PushEvent::ProjectUpdated { project, .. } => {
                store.upsert_project(project);
            }
            PushEvent::CommunityJoined { community_id, .. } => {
                store.set_community_joined(&community_id, true);
            }
            PushEvent::CommunityMemberJoined { event_id, community_id } => {
                if self.deltas_seen.insert(&event_id) {
                    store.apply_member_delta(&community_id, 1);
                } else {
                    log::debug!("dropping redelivered member-joined event {event_id}");
                }
            }
            PushEvent::IdentityFollowed { event_id, follower_id } => {
                // Surfaces on the timeline; record_activity dedups by id so a
                // redelivered notification lands once.
                store.record_activity(Activity {
                    id: event_id,
                    actor_id: follower_id,
                    kind: "identity_followed".into(),
                    body: serde_json::Value::Null,
                    created_at: Utc::now(),
                });
            }
            PushEvent::FullStateSync {
                projects,
                communities,
                activity,
            } => {
                store.replace_projects(projects);
                store.replace_communities(communities);
                store.replace_activity(activity);
            }
            PushEvent::Error { message } => {
                log::error!("server error event: {message}");
            }
            PushEvent::Unknown => {
                log::warn!("ignoring push event of unknown kind");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_window_remembers_and_evicts_fifo() {
        let mut dedup = EventDedup::new(2);
        assert!(dedup.insert("e1"));
        assert!(!dedup.insert("e1"));
        assert!(dedup.insert("e2"));
        assert!(dedup.insert("e3")); // evicts e1
        assert!(dedup.insert("e1"));
        assert!(!dedup.insert("e3"));
    }
}
