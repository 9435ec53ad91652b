//! Client-side state synchronization core for Guildhall.
//!
//! Keeps a single in-memory store of the signed-in member's projects,
//! communities, follow edges, and recent activity, synchronized against the
//! server over a realtime push channel with an HTTP fallback, and persisted
//! to a durable JSON snapshot between sessions.
//!
//! # Architecture
//!
//! ```text
//!   WsTransport ──► ConnectionManager ──► ChannelEvent ─┐
//!                                                       ▼
//!   HttpApi ◄──────────────────── SyncCoordinator ──► Dispatcher
//!                                        │                │
//!                                        ▼                ▼
//!                                      Store ◄────────────┘
//!                                        │
//!                                        ▼
//!                                   CacheWriter (JSON snapshot)
//! ```
//!
//! The coordinator owns the store; everything else reaches state through it.
//! Mutations are idempotent so an optimistic local write and its confirmed
//! remote echo converge, and count-only delta events are deduplicated by
//! event id before application.

pub mod api;
pub mod cache;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod store;
pub mod types;

/// Logger setup for embedders without logging of their own. Controlled by
/// `RUST_LOG`; safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::try_init();
}

pub use api::{HttpApi, RemoteApi};
pub use cache::{CacheWriter, CachedState};
pub use channel::{Backoff, BackoffConfig, ChannelLink, ChannelTransport, ConnectionManager, LinkState, WsTransport};
pub use config::Config;
pub use coordinator::SyncCoordinator;
pub use dispatch::Dispatcher;
pub use error::SyncError;
pub use store::Store;
pub use types::{
    Activity, ChannelEvent, ClientMessage, Community, Identity, NewActivity, NewProject, Privacy,
    Project, ProjectStatus, PushEvent,
};
