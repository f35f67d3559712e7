use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use ipc_task::{ShutdownSignal, Task};

use crate::config::TransportConfig;
use crate::peer_id::PeerId;

/// Errors `send` may report to its caller (component C3).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("outbound backlog exceeds the configured high-water mark")]
    BackpressureFull,
    #[error("peer is closed")]
    Closed,
    #[error("operation was cancelled")]
    Cancelled,
}

/// Events a transport delivers to the peer's owner (the bridge, typically).
///
/// Invariants (SPEC_FULL.md §3): "open" precedes any "receive"; "close" is
/// terminal; callbacks for one peer are never re-entered.
#[async_trait]
pub trait TransportObserver: Send + Sync {
    async fn on_new_peer(&self, peer: PeerId);
    async fn on_receive(&self, peer: PeerId, bytes: Bytes);
    async fn on_peer_closed(&self, peer: PeerId, gracefully: bool);
}

struct PeerState {
    created_at: Instant,
    last_carrier_seen: Instant,
    last_inbound_at: Instant,
    carrier_attached: bool,
    backlog: VecDeque<Bytes>,
    notify: Arc<Notify>,
}

impl PeerState {
    fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            last_carrier_seen: now,
            last_inbound_at: now,
            carrier_attached: false,
            backlog: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

/// Snapshot of a peer's bookkeeping, returned by [`TransportBase::lookup`].
#[derive(Debug, Clone, Copy)]
pub struct PeerSnapshot {
    pub created_at: Instant,
    pub last_carrier_seen: Instant,
}

/// Shared base for every concrete transport (component C3): peer registry,
/// bounded per-peer outbound backlog, and open/receive/close event
/// dispatch. Concrete transports (e.g. the long-polling transport, C4) use
/// this as composition, draining the backlog whenever a carrier becomes
/// available.
pub struct TransportBase {
    peers: Mutex<HashMap<PeerId, PeerState>>,
    live_ids: Mutex<HashSet<PeerId>>,
    config: TransportConfig,
    observer: Arc<dyn TransportObserver>,
}

impl TransportBase {
    pub fn new(config: TransportConfig, observer: Arc<dyn TransportObserver>) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            live_ids: Mutex::new(HashSet::new()),
            config,
            observer,
        })
    }

    /// Allocates a fresh peer, fires `on_new_peer`, and returns its id.
    ///
    /// Collision-checked against the live set: a vanished peer's id is
    /// never immediately reused (SPEC_FULL.md §3 invariant).
    pub async fn new_peer(&self) -> PeerId {
        let id = loop {
            let candidate = PeerId::generate();
            let mut live_ids = self.live_ids.lock().await;
            if live_ids.insert(candidate.clone()) {
                break candidate;
            }
        };

        let now = Instant::now();
        self.peers.lock().await.insert(id.clone(), PeerState::new(now));

        debug!(peer = %id, "New peer allocated");
        self.observer.on_new_peer(id.clone()).await;

        id
    }

    pub async fn lookup(&self, id: &PeerId) -> Option<PeerSnapshot> {
        self.peers.lock().await.get(id).map(|p| PeerSnapshot {
            created_at: p.created_at,
            last_carrier_seen: p.last_carrier_seen,
        })
    }

    /// Marks the peer as having a carrier currently attached (or just seen),
    /// refreshing its idle-timeout clock.
    pub async fn touch(&self, id: &PeerId, carrier_attached: bool) {
        if let Some(state) = self.peers.lock().await.get_mut(id) {
            state.last_carrier_seen = Instant::now();
            state.carrier_attached = carrier_attached;
        }
    }

    /// Enqueues `bytes` for delivery to `id`'s carrier and wakes up anyone
    /// waiting on [`TransportBase::wait_for_backlog`].
    pub async fn send(&self, id: &PeerId, bytes: Bytes) -> Result<(), TransportError> {
        let mut peers = self.peers.lock().await;
        let state = peers.get_mut(id).ok_or(TransportError::Closed)?;

        if state.backlog.len() >= self.config.backlog_high_water {
            return Err(TransportError::BackpressureFull);
        }

        state.backlog.push_back(bytes);
        state.notify.notify_waiters();
        Ok(())
    }

    /// Pops every currently queued outbound buffer for `id` (FIFO order).
    pub async fn drain_backlog(&self, id: &PeerId) -> Vec<Bytes> {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(id) {
            Some(state) => state.backlog.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Waits until the backlog has at least one entry, or returns
    /// immediately if one is already queued. Used by a carrier implementing
    /// the "park until data is available" long-polling behavior.
    pub async fn wait_for_backlog(&self, id: &PeerId) -> Result<(), TransportError> {
        let notify = {
            let peers = self.peers.lock().await;
            let state = peers.get(id).ok_or(TransportError::Closed)?;
            Arc::clone(&state.notify)
        };

        // Register-then-check: `notify_waiters` only wakes futures that are
        // already registered at the time it's called, so the future has to
        // exist (and be enabled) before we re-check the backlog under the
        // lock. A plain clone-then-await here would lose a `send()` that
        // lands in the gap between dropping the lock and awaiting.
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let peers = self.peers.lock().await;
        let has_backlog = peers.get(id).is_some_and(|state| !state.backlog.is_empty());
        drop(peers);
        if has_backlog {
            return Ok(());
        }

        notified.await;
        Ok(())
    }

    /// Delivers one complete inbound application frame to the peer's owner.
    pub async fn receive(&self, id: &PeerId, bytes: Bytes) {
        {
            let mut peers = self.peers.lock().await;
            if let Some(state) = peers.get_mut(id) {
                state.last_inbound_at = Instant::now();
                state.last_carrier_seen = state.last_inbound_at;
            } else {
                return;
            }
        }
        self.observer.on_receive(id.clone(), bytes).await;
    }

    /// Removes the peer immediately and fires `on_peer_closed`. Idempotent:
    /// closing an already-closed peer is a no-op.
    pub async fn close(&self, id: &PeerId, gracefully: bool) {
        let removed = self.peers.lock().await.remove(id).is_some();
        if removed {
            info!(peer = %id, gracefully, "Peer closed");
            self.observer.on_peer_closed(id.clone(), gracefully).await;
        }
        // Deliberately keep `id` in `live_ids` forever: ids are never reused.
    }

    /// One sweep of the idle-timeout / dead-heartbeat rules. Exposed for
    /// tests; [`PeerExpiryTask`] calls this on a timer in production.
    pub async fn sweep_expired(self: &Arc<Self>) {
        let now = Instant::now();
        let expired: Vec<PeerId> = {
            let peers = self.peers.lock().await;
            peers
                .iter()
                .filter(|(_, state)| {
                    let idle_expired = !state.carrier_attached
                        && now.duration_since(state.last_carrier_seen) > self.config.idle_timeout;
                    let dead_expired = now.duration_since(state.last_inbound_at) > self.config.dead_timeout;
                    idle_expired || dead_expired
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in expired {
            self.close(&id, false).await;
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

/// Background expiry sweep (component C2's "background expiry runs at a
/// configurable interval").
pub struct PeerExpiryTask {
    base: Arc<TransportBase>,
}

impl PeerExpiryTask {
    pub fn new(base: Arc<TransportBase>) -> Self {
        Self { base }
    }
}

#[async_trait]
impl Task for PeerExpiryTask {
    type Output = ();

    const NAME: &'static str = "peer expiry";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let interval = self.base.config().expiry_sweep_interval;
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.base.sweep_expired().await;
                }
                _ = shutdown_signal.wait() => {
                    debug!("Closing peer expiry task...");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Default)]
    struct RecordingObserver {
        new_peers: TokioMutex<Vec<PeerId>>,
        received: TokioMutex<Vec<(PeerId, Bytes)>>,
        closed: TokioMutex<Vec<(PeerId, bool)>>,
    }

    #[async_trait]
    impl TransportObserver for RecordingObserver {
        async fn on_new_peer(&self, peer: PeerId) {
            self.new_peers.lock().await.push(peer);
        }

        async fn on_receive(&self, peer: PeerId, bytes: Bytes) {
            self.received.lock().await.push((peer, bytes));
        }

        async fn on_peer_closed(&self, peer: PeerId, gracefully: bool) {
            self.closed.lock().await.push((peer, gracefully));
        }
    }

    #[tokio::test]
    async fn allocate_touch_send_receive_close() {
        let observer = Arc::new(RecordingObserver::default());
        let base = TransportBase::new(TransportConfig::default(), observer.clone());

        let id = base.new_peer().await;
        assert_eq!(observer.new_peers.lock().await.as_slice(), &[id.clone()]);

        base.send(&id, Bytes::from_static(b"hello")).await.unwrap();
        let backlog = base.drain_backlog(&id).await;
        assert_eq!(backlog, vec![Bytes::from_static(b"hello")]);

        base.receive(&id, Bytes::from_static(b"world")).await;
        assert_eq!(
            observer.received.lock().await.as_slice(),
            &[(id.clone(), Bytes::from_static(b"world"))]
        );

        base.close(&id, true).await;
        assert_eq!(observer.closed.lock().await.as_slice(), &[(id.clone(), true)]);
        assert!(base.lookup(&id).await.is_none());
    }

    #[tokio::test]
    async fn send_respects_backpressure_high_water() {
        let observer = Arc::new(RecordingObserver::default());
        let mut config = TransportConfig::default();
        config.backlog_high_water = 2;
        let base = TransportBase::new(config, observer);

        let id = base.new_peer().await;
        base.send(&id, Bytes::from_static(b"a")).await.unwrap();
        base.send(&id, Bytes::from_static(b"b")).await.unwrap();
        let err = base.send(&id, Bytes::from_static(b"c")).await.unwrap_err();
        assert_eq!(err, TransportError::BackpressureFull);
    }

    #[tokio::test]
    async fn idle_timeout_closes_peer_non_gracefully() {
        let observer = Arc::new(RecordingObserver::default());
        let mut config = TransportConfig::default();
        config.idle_timeout = Duration::from_millis(10);
        config.dead_timeout = Duration::from_secs(999);
        let base = TransportBase::new(config, observer.clone());

        let id = base.new_peer().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        base.sweep_expired().await;

        assert_eq!(observer.closed.lock().await.as_slice(), &[(id, false)]);
    }

    #[tokio::test]
    async fn sweep_is_idempotent_once_closed() {
        let observer = Arc::new(RecordingObserver::default());
        let mut config = TransportConfig::default();
        config.idle_timeout = Duration::from_millis(5);
        let base = TransportBase::new(config, observer.clone());

        let id = base.new_peer().await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        base.sweep_expired().await;
        base.sweep_expired().await;

        assert_eq!(observer.closed.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn ids_are_never_reused_after_close() {
        let observer = Arc::new(RecordingObserver::default());
        let base = TransportBase::new(TransportConfig::default(), observer);

        let id = base.new_peer().await;
        base.close(&id, true).await;

        let reused = AtomicBool::new(false);
        for _ in 0..1_000 {
            let other = base.new_peer().await;
            if other == id {
                reused.store(true, Ordering::SeqCst);
            }
        }
        assert!(!reused.load(Ordering::SeqCst));
    }
}
