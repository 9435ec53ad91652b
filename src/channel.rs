//! Realtime channel lifecycle: connect, authenticate, reconnect, close.
//!
//! The manager owns a supervision task that drives the state machine
//! {Disconnected, Connecting, Connected, Reconnecting, Closed}. Reconnects
//! use capped exponential backoff with jitter and a bounded retry count.
//! Every transition into Connected after a prior Connected state flags
//! `resync_required`: events missed while offline are not redelivered, so
//! reconnection is treated as a gap in the stream.

use crate::error::SyncError;
use crate::types::{ChannelEvent, ClientMessage, Identity, PushEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::{thread_rng, Rng};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tungstenite::protocol::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_retries: u32,
}

/// Capped exponential backoff: base delay doubling per attempt, uniform
/// jitter, hard ceiling, bounded attempt count.
pub struct Backoff {
    cfg: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg, attempt: 0 }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Next delay, or `None` once the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.cfg.max_retries {
            return None;
        }
        let exp = self
            .cfg
            .base_ms
            .saturating_mul(1u64 << self.attempt.min(16));
        self.attempt += 1;
        let jitter: u64 = thread_rng().gen_range(0..=250);
        let delay = exp.min(self.cfg.max_ms).saturating_add(jitter);
        Some(Duration::from_millis(delay.min(self.cfg.max_ms)))
    }
}

/// A live link: outgoing intent messages in, decoded push events out.
pub struct ChannelLink {
    pub outgoing: mpsc::UnboundedSender<ClientMessage>,
    pub incoming: mpsc::UnboundedReceiver<PushEvent>,
}

/// Seam between the lifecycle machine and the wire. Production uses
/// WebSockets; tests script connections.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self, identity: &Identity) -> Result<ChannelLink, SyncError>;
}

/// WebSocket transport: JSON text frames, hello message with the identity
/// credential sent at handshake time.
pub struct WsTransport {
    url: String,
    token: Option<String>,
}

impl WsTransport {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self { url, token }
    }
}

#[async_trait]
impl ChannelTransport for WsTransport {
    async fn connect(&self, identity: &Identity) -> Result<ChannelLink, SyncError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let hello = ClientMessage::Hello {
            identity_id: identity.id.clone(),
            token: self.token.clone(),
        };
        let text =
            serde_json::to_string(&hello).map_err(|e| SyncError::Decode(e.to_string()))?;
        write
            .send(Message::Text(text))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<PushEvent>();

        // Writer: forward queued intents as text frames.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(t) => t,
                    Err(e) => {
                        log::warn!("dropping unencodable channel message: {e}");
                        continue;
                    }
                };
                if write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        // Reader: decode push events; malformed frames are skipped, a closed
        // stream ends the link (the supervisor sees the incoming side close).
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let frame = match frame {
                    Ok(f) => f,
                    Err(_) => break,
                };
                if !frame.is_text() {
                    continue;
                }
                let text = frame.into_text().unwrap_or_default();
                match serde_json::from_str::<PushEvent>(&text) {
                    Ok(event) => {
                        if in_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("skipping malformed push frame: {e}"),
                }
            }
        });

        Ok(ChannelLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

type OutgoingSlot = Arc<Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>>;

fn set_outgoing(slot: &OutgoingSlot, value: Option<mpsc::UnboundedSender<ClientMessage>>) {
    if let Ok(mut guard) = slot.lock() {
        *guard = value;
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn ChannelTransport>,
    backoff_cfg: BackoffConfig,
    state_tx: watch::Sender<LinkState>,
    shutdown_tx: watch::Sender<bool>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    outgoing: OutgoingSlot,
    opened: bool,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        backoff_cfg: BackoffConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        (
            Self {
                transport,
                backoff_cfg,
                state_tx,
                shutdown_tx,
                events_tx,
                outgoing: Arc::new(Mutex::new(None)),
                opened: false,
            },
            events_rx,
        )
    }

    /// Start the supervision task once an authenticated identity is known.
    pub fn open(&mut self, identity: Identity) {
        if self.opened {
            log::warn!("channel already opened; ignoring open()");
            return;
        }
        if *self.state_tx.borrow() == LinkState::Closed {
            log::warn!("channel is closed; ignoring open()");
            return;
        }
        self.opened = true;
        tokio::spawn(supervise(
            self.transport.clone(),
            identity,
            self.backoff_cfg.clone(),
            self.state_tx.clone(),
            self.events_tx.clone(),
            self.outgoing.clone(),
            self.shutdown_tx.subscribe(),
        ));
    }

    /// Terminal close (logout). No further automatic retries. A live
    /// supervision task emits the Closed event on its way out; when none is
    /// running (never opened, or parked after exhausting its retry budget)
    /// the event is emitted here so the coordinator's loop still ends.
    pub fn close(&mut self) {
        let supervising = self.shutdown_tx.receiver_count() > 0;
        let _ = self.shutdown_tx.send(true);
        set_outgoing(&self.outgoing, None);
        self.state_tx.send_replace(LinkState::Closed);
        if !supervising {
            let _ = self.events_tx.send(ChannelEvent::Closed);
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Queue a message on the live link. Returns false when not Connected;
    /// the coordinator falls back to HTTP in that case.
    pub fn send(&self, msg: ClientMessage) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.outgoing.lock() {
            Ok(guard) => guard
                .as_ref()
                .map(|tx| tx.send(msg).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

async fn supervise(
    transport: Arc<dyn ChannelTransport>,
    identity: Identity,
    cfg: BackoffConfig,
    state_tx: watch::Sender<LinkState>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    outgoing: OutgoingSlot,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(cfg);
    let mut was_connected = false;

    loop {
        if *shutdown.borrow() {
            break;
        }
        state_tx.send_replace(LinkState::Connecting);

        let link = tokio::select! {
            res = transport.connect(&identity) => res,
            _ = shutdown.changed() => break,
        };

        match link {
            Ok(mut link) => {
                backoff.reset();
                set_outgoing(&outgoing, Some(link.outgoing.clone()));
                state_tx.send_replace(LinkState::Connected);
                let _ = events_tx.send(ChannelEvent::Connected {
                    resync_required: was_connected,
                });
                was_connected = true;

                let mut closing = false;
                loop {
                    tokio::select! {
                        event = link.incoming.recv() => match event {
                            Some(event) => {
                                let _ = events_tx.send(ChannelEvent::Push(event));
                            }
                            None => break,
                        },
                        _ = shutdown.changed() => {
                            closing = true;
                            break;
                        }
                    }
                }
                set_outgoing(&outgoing, None);
                if closing || *shutdown.borrow() {
                    break;
                }
                log::info!("channel lost; scheduling reconnect");
                let _ = events_tx.send(ChannelEvent::Disconnected);
                state_tx.send_replace(LinkState::Reconnecting);
            }
            Err(e) => {
                log::warn!("channel connect failed: {e}");
                state_tx.send_replace(LinkState::Reconnecting);
            }
        }

        match backoff.next_delay() {
            Some(delay) => {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
            None => {
                log::error!(
                    "channel retries exhausted after {} attempts; staying offline",
                    backoff.attempt()
                );
                state_tx.send_replace(LinkState::Disconnected);
                return;
            }
        }
    }

    set_outgoing(&outgoing, None);
    state_tx.send_replace(LinkState::Closed);
    let _ = events_tx.send(ChannelEvent::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(base_ms: u64, max_ms: u64, max_retries: u32) -> BackoffConfig {
        BackoffConfig {
            base_ms,
            max_ms,
            max_retries,
        }
    }

    #[test]
    fn backoff_doubles_and_respects_ceiling() {
        let mut backoff = Backoff::new(cfg(300, 5000, 32));
        let mut prev = 0u128;
        for attempt in 0..10 {
            let delay = backoff.next_delay().expect("within retry budget").as_millis();
            assert!(delay <= 5000, "attempt {attempt} exceeded ceiling: {delay}ms");
            // Monotone until the ceiling kicks in.
            if prev < 5000 {
                assert!(delay + 250 >= prev, "attempt {attempt} went backwards");
            }
            prev = delay;
        }
    }

    #[test]
    fn backoff_stops_after_retry_budget() {
        let mut backoff = Backoff::new(cfg(100, 1000, 3));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn backoff_reset_restores_budget() {
        let mut backoff = Backoff::new(cfg(100, 1000, 1));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn zero_retries_never_delays() {
        let mut backoff = Backoff::new(cfg(100, 1000, 0));
        assert!(backoff.next_delay().is_none());
    }
}
