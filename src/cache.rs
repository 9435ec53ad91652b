//! Durable cache codec and background writer.
//!
//! The store's persistable slices are written as a versioned JSON snapshot so
//! a reload starts from the last known state before the channel attaches.
//! The follow-edge set never hits disk as a set: it is written as a sorted id
//! sequence and rebuilt into a `HashSet` on load, so duplicates in the byte
//! stream (or a different ordering written by another version) collapse
//! instead of corrupting the invariant.
//!
//! Loads fail soft: corrupt bytes, a version mismatch, or a missing file all
//! yield the empty default snapshot — the channel repopulates state later.

use crate::types::{Community, Project};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::spawn_blocking;

pub const CACHE_VERSION: u32 = 1;

/// The slices of store state that survive a reload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CachedState {
    pub projects: Vec<Project>,
    pub communities: Vec<Community>,
    pub following: HashSet<String>,
}

#[derive(Serialize, Deserialize)]
struct CacheEnvelope {
    version: u32,
    saved_at: DateTime<Utc>,
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    communities: Vec<Community>,
    /// Follow edges as an ordered sequence, never a set.
    #[serde(default)]
    following: Vec<String>,
}

pub fn encode_snapshot(state: &CachedState) -> Vec<u8> {
    let mut following: Vec<String> = state.following.iter().cloned().collect();
    following.sort();
    let envelope = CacheEnvelope {
        version: CACHE_VERSION,
        saved_at: Utc::now(),
        projects: state.projects.clone(),
        communities: state.communities.clone(),
        following,
    };
    match serde_json::to_vec(&envelope) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("cache snapshot encode failed: {e}");
            Vec::new()
        }
    }
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<CachedState> {
    let envelope: CacheEnvelope = serde_json::from_slice(bytes)?;
    if envelope.version != CACHE_VERSION {
        return Err(anyhow!(
            "cache version mismatch: expected {CACHE_VERSION}, got {}",
            envelope.version
        ));
    }
    Ok(CachedState {
        projects: envelope.projects,
        communities: envelope.communities,
        following: envelope
            .following
            .into_iter()
            .filter(|id| !id.is_empty())
            .collect(),
    })
}

/// Load the persisted snapshot. Any failure degrades to the empty default.
pub fn load(path: &Path) -> CachedState {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("no cache at {}; starting empty", path.display());
            return CachedState::default();
        }
        Err(e) => {
            log::warn!("cache read failed at {}: {e}", path.display());
            return CachedState::default();
        }
    };
    match decode_snapshot(&bytes) {
        Ok(state) => state,
        Err(e) => {
            log::warn!("discarding cache at {}: {e}", path.display());
            CachedState::default()
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

/// Handle to the background snapshot writer. Cheap to clone; `save` is
/// fire-and-forget so store mutations never block on file IO.
#[derive(Clone)]
pub struct CacheWriter {
    tx: UnboundedSender<CachedState>,
}

impl CacheWriter {
    /// Spawn the single writer worker off the main thread.
    pub fn start(path: PathBuf) -> Self {
        let (tx, mut rx) = unbounded_channel::<CachedState>();
        tokio::spawn(async move {
            let _ = spawn_blocking(move || {
                while let Some(state) = rx.blocking_recv() {
                    // Coalesce a burst of commits into one write of the newest snapshot.
                    let mut latest = state;
                    while let Ok(next) = rx.try_recv() {
                        latest = next;
                    }
                    if let Err(e) = write_atomic(&path, &encode_snapshot(&latest)) {
                        log::warn!("cache write failed at {}: {e}", path.display());
                    }
                }
            })
            .await;
        });
        Self { tx }
    }

    pub fn save(&self, state: CachedState) {
        let _ = self.tx.send(state);
    }
}
