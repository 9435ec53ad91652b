//! Sync coordinator: owns the store and drives it from three inputs.
//!
//! Startup order is cache hydrate, then identity fetch, then channel open,
//! then authoritative resync. User intents apply optimistically to the store
//! first, then go out over the channel when it is connected or over HTTP
//! otherwise; a rejected intent rolls the store back to the captured prior
//! state rather than blindly inverting the mutation. Optimistic records carry
//! temporary ids that are reconciled to server-assigned canonical ids.

use crate::api::{HttpApi, RemoteApi};
use crate::cache::{self, CacheWriter};
use crate::channel::{BackoffConfig, ChannelTransport, ConnectionManager, LinkState, WsTransport};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::SyncError;
use crate::store::Store;
use crate::types::{
    temp_id, Activity, ChannelEvent, ClientMessage, NewActivity, NewProject, Project, PushEvent,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Delta events to remember for redelivery suppression.
const DEDUP_WINDOW: usize = 1024;

/// An optimistic activity record awaiting its confirmed echo.
struct PendingActivity {
    temp_id: String,
    kind: String,
    body: serde_json::Value,
}

pub struct SyncCoordinator {
    store: Store,
    dispatcher: Dispatcher,
    api: Arc<dyn RemoteApi>,
    connection: ConnectionManager,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    cache_path: PathBuf,
    /// Temporary id to server-assigned canonical id.
    id_map: HashMap<String, String>,
    pending_activity: Vec<PendingActivity>,
    synced_once: bool,
}

impl SyncCoordinator {
    pub fn new(cfg: &Config) -> Result<Self, SyncError> {
        let api = HttpApi::new(cfg)?;
        let transport = WsTransport::new(cfg.channel_url.clone(), cfg.auth_token.clone());
        Ok(Self::with_parts(cfg, Arc::new(api), Arc::new(transport)))
    }

    /// Assemble from explicit seams. Tests script the api and transport.
    pub fn with_parts(
        cfg: &Config,
        api: Arc<dyn RemoteApi>,
        transport: Arc<dyn ChannelTransport>,
    ) -> Self {
        let (connection, events_rx) = ConnectionManager::new(
            transport,
            BackoffConfig {
                base_ms: cfg.reconnect_base_ms,
                max_ms: cfg.reconnect_max_ms,
                max_retries: cfg.reconnect_max_retries,
            },
        );
        let cache_path = PathBuf::from(&cfg.cache_path);
        let mut store = Store::new(cfg.keep_activity);
        store.set_persistence(CacheWriter::start(cache_path.clone()));
        Self {
            store,
            dispatcher: Dispatcher::new(DEDUP_WINDOW),
            api,
            connection,
            events_rx,
            cache_path,
            id_map: HashMap::new(),
            pending_activity: Vec::new(),
            synced_once: false,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Map a temporary id to its canonical id once known.
    pub fn resolve_id<'a>(&'a self, id: &'a str) -> &'a str {
        self.id_map.get(id).map(String::as_str).unwrap_or(id)
    }

    /// Seed the store from the durable cache. Runs before any network
    /// activity so the first render shows last known state.
    pub fn cold_start(&mut self) {
        let cached = cache::load(Path::new(&self.cache_path));
        self.store.hydrate(cached);
    }

    /// Authenticate and open the realtime channel. An authentication failure
    /// is surfaced as-is; it is never retried by the reconnect loop.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        let identity = self.api.fetch_identity().await?;
        self.store.set_identity(identity.clone());
        self.connection.open(identity);
        Ok(())
    }

    /// Terminal shutdown (logout). The channel will not reconnect.
    pub fn close(&mut self) {
        self.connection.close();
    }

    /// Fetch the authoritative state and replace the store's slices. The
    /// identity is read-mostly but refreshed here so profile edits made
    /// elsewhere land on reconnect.
    pub async fn initial_sync(&mut self) -> Result<(), SyncError> {
        let identity = self.api.fetch_identity().await?;
        self.store.set_identity(identity);
        let projects = self.api.fetch_projects().await?;
        let communities = self.api.fetch_communities().await?;
        let activity = self.api.fetch_activity().await?;
        self.store.replace_projects(projects);
        self.store.replace_communities(communities);
        self.store.replace_activity(activity);
        self.synced_once = true;
        Ok(())
    }

    /// Drive channel events until the channel closes.
    pub async fn run(&mut self) {
        while self.step().await {}
    }

    /// Handle one channel event. Returns false once the channel is closed.
    pub async fn step(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => self.handle_channel_event(event).await,
            None => false,
        }
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Connected { resync_required } => {
                if resync_required || !self.synced_once {
                    // Events missed while offline are gone; ask for the world.
                    self.connection.send(ClientMessage::RequestFullSync);
                    if let Err(e) = self.initial_sync().await {
                        log::warn!("resync after connect failed: {e}");
                    }
                }
                true
            }
            ChannelEvent::Push(event) => {
                let event = self.reconcile_activity_echo(event);
                self.dispatcher.apply(event, &mut self.store);
                true
            }
            ChannelEvent::Disconnected => {
                log::info!("channel disconnected; reconnect pending");
                true
            }
            ChannelEvent::Closed => {
                log::info!("channel closed");
                false
            }
        }
    }

    /// Match a confirmed activity echo against an optimistic temp record:
    /// drop the temp record and remember the id mapping, then let the event
    /// land as the canonical record.
    fn reconcile_activity_echo(&mut self, event: PushEvent) -> PushEvent {
        if let PushEvent::ActivityCreated { activity, .. } = &event {
            let mine = self
                .store
                .identity()
                .map(|me| me.id == activity.actor_id)
                .unwrap_or(false);
            if mine {
                if let Some(pos) = self
                    .pending_activity
                    .iter()
                    .position(|p| p.kind == activity.kind && p.body == activity.body)
                {
                    let pending = self.pending_activity.swap_remove(pos);
                    self.store.remove_activity(&pending.temp_id);
                    self.id_map.insert(pending.temp_id, activity.id.clone());
                }
            }
        }
        event
    }

    // ---- user intents ----

    /// Follow another identity. Optimistic; rolls back to the prior edge
    /// state on rejection.
    pub async fn follow(&mut self, target_id: &str) -> Result<(), SyncError> {
        let target = self.resolve_id(target_id).to_string();
        let was = self.store.is_following(&target);
        if !self.store.set_following(&target, true) {
            return Err(SyncError::InvalidIntent(format!(
                "cannot follow {target}"
            )));
        }
        if self.connection.send(ClientMessage::Follow {
            target_id: target.clone(),
        }) {
            return Ok(());
        }
        if let Err(e) = self.api.follow(&target).await {
            self.store.set_following(&target, was);
            return Err(e);
        }
        Ok(())
    }

    pub async fn unfollow(&mut self, target_id: &str) -> Result<(), SyncError> {
        let target = self.resolve_id(target_id).to_string();
        let was = self.store.is_following(&target);
        if !self.store.set_following(&target, false) {
            return Err(SyncError::InvalidIntent(format!(
                "cannot unfollow {target}"
            )));
        }
        if let Err(e) = self.api.unfollow(&target).await {
            self.store.set_following(&target, was);
            return Err(e);
        }
        Ok(())
    }

    /// Join a community. The member count moves here through the joined-flag
    /// transition; the confirmed echo is absorbed by the same guard.
    pub async fn join_community(&mut self, community_id: &str) -> Result<(), SyncError> {
        let id = self.resolve_id(community_id).to_string();
        let was = self
            .store
            .community(&id)
            .map(|c| c.joined)
            .ok_or_else(|| SyncError::InvalidIntent(format!("unknown community {id}")))?;
        self.store.set_community_joined(&id, true);
        if self.connection.send(ClientMessage::JoinCommunity {
            community_id: id.clone(),
        }) {
            return Ok(());
        }
        if let Err(e) = self.api.join_community(&id).await {
            self.store.set_community_joined(&id, was);
            return Err(e);
        }
        Ok(())
    }

    pub async fn leave_community(&mut self, community_id: &str) -> Result<(), SyncError> {
        let id = self.resolve_id(community_id).to_string();
        let was = self
            .store
            .community(&id)
            .map(|c| c.joined)
            .ok_or_else(|| SyncError::InvalidIntent(format!("unknown community {id}")))?;
        self.store.set_community_joined(&id, false);
        if let Err(e) = self.api.leave_community(&id).await {
            self.store.set_community_joined(&id, was);
            return Err(e);
        }
        Ok(())
    }

    /// Create a project. Appears immediately under a temporary id; on
    /// confirmation the temp record is swapped for the canonical one and the
    /// mapping is kept so stale references keep resolving. Returns the
    /// canonical id.
    pub async fn create_project(&mut self, input: NewProject) -> Result<String, SyncError> {
        let me = self
            .store
            .identity()
            .ok_or_else(|| SyncError::InvalidIntent("not authenticated".into()))?
            .id
            .clone();
        let tmp = temp_id();
        let now = Utc::now();
        let optimistic = Project {
            id: tmp.clone(),
            owner_id: me,
            title: input.title.clone(),
            description: input.description.clone(),
            domain: input.domain.clone(),
            tech_tags: input.tech_tags.clone(),
            status: input.status,
            progress: input.progress,
            due_at: input.due_at,
            created_at: now,
            updated_at: now,
        };
        if !self.store.upsert_project(optimistic) {
            return Err(SyncError::InvalidIntent("invalid project input".into()));
        }
        match self.api.create_project(&input).await {
            Ok(canonical) => {
                let id = canonical.id.clone();
                self.store.remove_project(&tmp);
                self.store.upsert_project(canonical);
                self.id_map.insert(tmp, id.clone());
                Ok(id)
            }
            Err(e) => {
                self.store.remove_project(&tmp);
                Err(e)
            }
        }
    }

    /// Post a timeline record. Optimistic under a temporary id; the channel
    /// echo (matched by kind and body) replaces it with the canonical record.
    /// Returns the temporary id, resolvable once the echo lands.
    pub async fn post_activity(&mut self, input: NewActivity) -> Result<String, SyncError> {
        let me = self
            .store
            .identity()
            .ok_or_else(|| SyncError::InvalidIntent("not authenticated".into()))?
            .id
            .clone();
        let tmp = temp_id();
        self.store.record_activity(Activity {
            id: tmp.clone(),
            actor_id: me,
            kind: input.kind.clone(),
            body: input.body.clone(),
            created_at: Utc::now(),
        });
        self.pending_activity.push(PendingActivity {
            temp_id: tmp.clone(),
            kind: input.kind.clone(),
            body: input.body.clone(),
        });
        if self.connection.send(ClientMessage::PostActivity {
            kind: input.kind.clone(),
            body: input.body.clone(),
        }) {
            return Ok(tmp);
        }
        if let Err(e) = self.api.post_activity(&input).await {
            self.store.remove_activity(&tmp);
            self.pending_activity.retain(|p| p.temp_id != tmp);
            return Err(e);
        }
        Ok(tmp)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.state() == LinkState::Connected
    }
}
