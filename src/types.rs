use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// The authenticated end user. Created and refreshed by the auth
/// collaborator; the sync core treats it as read-mostly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub bio: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Planning,
    Active,
    Paused,
    Completed,
}

/// A collaborative work item. `owner_id` is a weak reference resolved by
/// lookup; deleting the referenced identity never cascades here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub tech_tags: Vec<String>,
    pub status: ProjectStatus,
    /// Invariant: 0..=100, enforced at the store boundary.
    pub progress: u8,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Client-side input for a project creation intent. The store assigns a
/// temporary id until the server returns the canonical record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewProject {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub tech_tags: Vec<String>,
    pub status: ProjectStatus,
    pub progress: u8,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privacy {
    Public,
    Private,
}

/// A named group. `joined` is the current identity's membership flag;
/// `member_count` moves on the flag transition (self path) or on deduplicated
/// member-joined deltas (remote path), never both for the same logical join.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub privacy: Privacy,
    #[serde(default)]
    pub member_count: u64,
    #[serde(default)]
    pub post_count: u64,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub joined: bool,
}

/// An immutable timeline record. Append-only, bounded FIFO retention.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub actor_id: String,
    pub kind: String,
    #[serde(default)]
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Client-side input for a post-activity intent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewActivity {
    pub kind: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Inbound push events. Closed tagged union; kinds the client does not know
/// fall into `Unknown` and are logged and ignored rather than failing the
/// whole frame stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    ActivityCreated {
        event_id: String,
        activity: Activity,
    },
    ProjectUpdated {
        event_id: String,
        project: Project,
    },
    /// The current identity's own join was confirmed.
    CommunityJoined {
        event_id: String,
        community_id: String,
    },
    /// Another member joined: count-only delta, deduplicated by event id.
    CommunityMemberJoined {
        event_id: String,
        community_id: String,
    },
    /// Someone started following the current identity.
    IdentityFollowed {
        event_id: String,
        follower_id: String,
    },
    /// Authoritative snapshot; replaces the carried slices wholesale.
    FullStateSync {
        #[serde(default)]
        projects: Vec<Project>,
        #[serde(default)]
        communities: Vec<Community>,
        #[serde(default)]
        activity: Vec<Activity>,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

/// Outbound channel messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Credential attached at handshake time.
    Hello {
        identity_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    JoinCommunity {
        community_id: String,
    },
    Follow {
        target_id: String,
    },
    PostActivity {
        kind: String,
        body: serde_json::Value,
    },
    RequestFullSync,
}

/// Events the connection manager delivers to the sync coordinator.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    /// `resync_required` is true on every connection after the first: the
    /// client cannot assume it saw every event missed while offline.
    Connected { resync_required: bool },
    Disconnected,
    Push(PushEvent),
    Closed,
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Client-generated temporary id for optimistic records. Reconciled to the
/// server-assigned canonical id by the coordinator's id table.
pub fn temp_id() -> String {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("tmp-{}-{}", Utc::now().timestamp_millis(), seq)
}
