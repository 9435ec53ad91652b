//! Connection lifecycle: reconnect after a dropped link, resync flagging,
//! bounded retry budget, terminal close.

use async_trait::async_trait;
use guildhall_sync::channel::{
    BackoffConfig, ChannelLink, ChannelTransport, ConnectionManager, LinkState,
};
use guildhall_sync::{ChannelEvent, Identity, PushEvent, SyncError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn me() -> Identity {
    Identity {
        id: "me".into(),
        display_name: "Me".into(),
        headline: String::new(),
        bio: String::new(),
    }
}

fn fast_backoff(max_retries: u32) -> BackoffConfig {
    BackoffConfig {
        base_ms: 10,
        max_ms: 50,
        max_retries,
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no channel event within 2s")
        .expect("event stream ended")
}

/// Poll until the supervision task has made `attempts` connect attempts and
/// parked in `want`. The state channel starts at Disconnected, so waiting on
/// the state alone would be satisfied before the task ever runs.
async fn wait_for_parked(
    transport: &FlakyTransport,
    manager: &ConnectionManager,
    attempts: usize,
    want: LinkState,
) {
    timeout(Duration::from_secs(2), async {
        while transport.attempts() < attempts || manager.state() != want {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "never parked in {want:?} after {attempts} attempts (saw {} attempts, state {:?})",
            transport.attempts(),
            manager.state()
        )
    });
}

/// Connects successfully unless told to fail; the test holds the server end
/// of each link so it can drop connections at will.
#[derive(Default)]
struct FlakyTransport {
    attempts: AtomicUsize,
    fail_all: bool,
    servers: Mutex<Vec<mpsc::UnboundedSender<PushEvent>>>,
}

impl FlakyTransport {
    fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn drop_link(&self) {
        self.servers.lock().unwrap().clear();
    }
}

#[async_trait]
impl ChannelTransport for FlakyTransport {
    async fn connect(&self, _identity: &Identity) -> Result<ChannelLink, SyncError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_all {
            return Err(SyncError::Transport("refused".into()));
        }
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.servers.lock().unwrap().push(in_tx);
        Ok(ChannelLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[tokio::test]
async fn dropped_link_reconnects_and_flags_resync() {
    let transport = Arc::new(FlakyTransport::default());
    let (mut manager, mut events) = ConnectionManager::new(transport.clone(), fast_backoff(5));
    manager.open(me());

    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Connected {
            resync_required: false
        }
    ));

    transport.drop_link();
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Disconnected
    ));
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Connected {
            resync_required: true
        }
    ));
    assert_eq!(transport.attempts(), 2);
    assert!(manager.is_connected());
}

#[tokio::test]
async fn pushes_flow_through_as_events() {
    let transport = Arc::new(FlakyTransport::default());
    let (mut manager, mut events) = ConnectionManager::new(transport.clone(), fast_backoff(5));
    manager.open(me());
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Connected { .. }
    ));

    transport
        .servers
        .lock()
        .unwrap()
        .last()
        .unwrap()
        .send(PushEvent::Unknown)
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Push(PushEvent::Unknown)
    ));
}

#[tokio::test]
async fn retry_budget_exhaustion_goes_offline() {
    let transport = Arc::new(FlakyTransport::failing());
    let (mut manager, _events) = ConnectionManager::new(transport.clone(), fast_backoff(2));
    manager.open(me());

    // One initial attempt plus the retry budget.
    wait_for_parked(&transport, &manager, 3, LinkState::Disconnected).await;
    assert_eq!(transport.attempts(), 3);

    // Parked for good: no further attempts.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.attempts(), 3);
}

#[tokio::test]
async fn state_reads_need_no_subscriber() {
    let transport = Arc::new(FlakyTransport::default());
    let (mut manager, mut events) = ConnectionManager::new(transport, fast_backoff(5));
    assert_eq!(manager.state(), LinkState::Disconnected);
    manager.open(me());

    // No watch_state() receiver is held anywhere; the manager's own view
    // must still track the supervision task.
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Connected { .. }
    ));
    assert_eq!(manager.state(), LinkState::Connected);
    assert!(manager.is_connected());
}

#[tokio::test]
async fn close_after_retry_exhaustion_still_emits_closed() {
    let transport = Arc::new(FlakyTransport::failing());
    let (mut manager, mut events) = ConnectionManager::new(transport.clone(), fast_backoff(1));
    manager.open(me());
    wait_for_parked(&transport, &manager, 2, LinkState::Disconnected).await;

    let state_rx = manager.watch_state();
    manager.close();
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Closed
    ));
    assert_eq!(manager.state(), LinkState::Closed);
    assert_eq!(*state_rx.borrow(), LinkState::Closed);
}

#[tokio::test]
async fn close_is_terminal() {
    let transport = Arc::new(FlakyTransport::default());
    let (mut manager, mut events) = ConnectionManager::new(transport.clone(), fast_backoff(5));
    manager.open(me());
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Connected { .. }
    ));

    manager.close();
    loop {
        match next_event(&mut events).await {
            ChannelEvent::Closed => break,
            ChannelEvent::Disconnected => continue,
            other => panic!("unexpected event after close: {other:?}"),
        }
    }
    assert_eq!(manager.state(), LinkState::Closed);

    // No reconnect attempts after a terminal close.
    let before = transport.attempts();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.attempts(), before);
}
