//! Reactive store: the single owner of normalized client state.
//!
//! Mutations are named, synchronous, total, and idempotent under
//! re-application with the same payload, because every entity can be updated
//! twice for one logical change (optimistic local write plus confirmed remote
//! echo). A malformed payload is rejected with a diagnostic and the mutation
//! is a no-op; mutations never panic across the subscriber boundary.
//!
//! The store is owned by the coordinator and mutated only between awaits on a
//! single task, so no locking is needed around the snapshot. Subscribers
//! observe commits through a `watch` revision counter, which coalesces a
//! burst of commits into one wakeup per subscriber.

use crate::cache::{CachedState, CacheWriter};
use crate::types::{Activity, Community, Identity, Project};
use std::collections::{HashSet, VecDeque};
use tokio::sync::watch;

pub struct Store {
    identity: Option<Identity>,
    projects: Vec<Project>,
    communities: Vec<Community>,
    activity: VecDeque<Activity>,
    following: HashSet<String>,
    keep_activity: usize,
    revision: watch::Sender<u64>,
    persist: Option<CacheWriter>,
}

impl Store {
    pub fn new(keep_activity: usize) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            identity: None,
            projects: Vec::new(),
            communities: Vec::new(),
            activity: VecDeque::new(),
            following: HashSet::new(),
            keep_activity,
            revision,
            persist: None,
        }
    }

    /// Attach the durable cache writer. Every committed mutation from here on
    /// enqueues a snapshot write.
    pub fn set_persistence(&mut self, writer: CacheWriter) {
        self.persist = Some(writer);
    }

    /// Change notifications: the receiver wakes once per committed batch.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    // ---- read accessors ----

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn communities(&self) -> &[Community] {
        &self.communities
    }

    pub fn community(&self, id: &str) -> Option<&Community> {
        self.communities.iter().find(|c| c.id == id)
    }

    pub fn activity(&self) -> impl Iterator<Item = &Activity> {
        self.activity.iter()
    }

    pub fn activity_len(&self) -> usize {
        self.activity.len()
    }

    pub fn following(&self) -> &HashSet<String> {
        &self.following
    }

    pub fn is_following(&self, id: &str) -> bool {
        self.following.contains(id)
    }

    // ---- mutations ----

    pub fn set_identity(&mut self, identity: Identity) -> bool {
        if identity.id.is_empty() {
            log::warn!("rejecting identity with empty id");
            return false;
        }
        if self.identity.as_ref() == Some(&identity) {
            return true;
        }
        self.identity = Some(identity);
        self.commit();
        true
    }

    /// Insert or replace a project by id. Same payload twice commits once.
    pub fn upsert_project(&mut self, project: Project) -> bool {
        if project.id.is_empty() {
            log::warn!("rejecting project with empty id");
            return false;
        }
        if project.progress > 100 {
            log::warn!(
                "rejecting project {} with progress {} out of range",
                project.id,
                project.progress
            );
            return false;
        }
        match self.projects.iter_mut().find(|p| p.id == project.id) {
            Some(existing) => {
                if *existing == project {
                    return true;
                }
                *existing = project;
            }
            None => self.projects.push(project),
        }
        self.commit();
        true
    }

    pub fn remove_project(&mut self, id: &str) -> bool {
        let before = self.projects.len();
        self.projects.retain(|p| p.id != id);
        if self.projects.len() != before {
            self.commit();
        }
        true
    }

    /// Set the follow edge to `target` to `following`. Absolute, not a
    /// toggle, so optimistic and confirmed applications agree.
    pub fn set_following(&mut self, target: &str, following: bool) -> bool {
        if target.is_empty() {
            log::warn!("rejecting follow edge with empty target id");
            return false;
        }
        if following {
            if let Some(me) = &self.identity {
                if me.id == target {
                    log::warn!("rejecting self-follow for {target}");
                    return false;
                }
            }
        }
        let changed = if following {
            self.following.insert(target.to_string())
        } else {
            self.following.remove(target)
        };
        if changed {
            self.commit();
        }
        true
    }

    /// Set the current identity's membership flag on a community. The member
    /// count moves only when the flag actually transitions, so a confirmed
    /// echo of an optimistic join cannot double-count.
    pub fn set_community_joined(&mut self, id: &str, joined: bool) -> bool {
        let Some(community) = self.communities.iter_mut().find(|c| c.id == id) else {
            log::warn!("membership change for unknown community {id}");
            return false;
        };
        if community.joined == joined {
            return true;
        }
        community.joined = joined;
        if joined {
            community.member_count += 1;
        } else {
            community.member_count = community.member_count.saturating_sub(1);
        }
        self.commit();
        true
    }

    /// Count-only member delta for remote joins/leaves. The dispatcher
    /// deduplicates delta events by event id before calling this.
    pub fn apply_member_delta(&mut self, id: &str, delta: i64) -> bool {
        let Some(community) = self.communities.iter_mut().find(|c| c.id == id) else {
            log::warn!("member delta for unknown community {id}");
            return false;
        };
        if delta >= 0 {
            community.member_count += delta as u64;
        } else {
            community.member_count = community.member_count.saturating_sub((-delta) as u64);
        }
        self.commit();
        true
    }

    /// Append a timeline record. Duplicate ids are ignored; the buffer keeps
    /// the most recent `keep_activity` records, oldest evicted first.
    pub fn record_activity(&mut self, activity: Activity) -> bool {
        if activity.id.is_empty() {
            log::warn!("rejecting activity with empty id");
            return false;
        }
        if self.activity.iter().any(|a| a.id == activity.id) {
            return true;
        }
        self.activity.push_back(activity);
        while self.activity.len() > self.keep_activity {
            self.activity.pop_front();
        }
        self.commit();
        true
    }

    pub fn remove_activity(&mut self, id: &str) -> bool {
        let before = self.activity.len();
        self.activity.retain(|a| a.id != id);
        if self.activity.len() != before {
            self.commit();
        }
        true
    }

    // ---- wholesale replacement (authoritative resync) ----

    pub fn replace_projects(&mut self, projects: Vec<Project>) {
        self.projects = projects;
        self.commit();
    }

    pub fn replace_communities(&mut self, communities: Vec<Community>) {
        self.communities = communities;
        self.commit();
    }

    pub fn replace_activity(&mut self, activity: Vec<Activity>) {
        let skip = activity.len().saturating_sub(self.keep_activity);
        self.activity = activity.into_iter().skip(skip).collect();
        self.commit();
    }

    /// Seed the store from the durable cache at cold start. Commits once so
    /// subscribers render the cached state before any network activity.
    pub fn hydrate(&mut self, cached: CachedState) {
        self.projects = cached.projects;
        self.communities = cached.communities;
        self.following = cached.following;
        self.revision.send_modify(|r| *r += 1);
    }

    fn commit(&mut self) {
        self.revision.send_modify(|r| *r += 1);
        if let Some(writer) = &self.persist {
            writer.save(CachedState {
                projects: self.projects.clone(),
                communities: self.communities.clone(),
                following: self.following.clone(),
            });
        }
    }
}
