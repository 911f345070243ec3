//! Signaling transport
//!
//! Keeps a single logical connection to the relay alive:
//! - `connect()` is idempotent and retries with exponential backoff
//! - `send()` is at-most-once; frames sent while disconnected are dropped
//! - one handler per event kind, re-subscribing replaces the old one
//! - status changes are published on a `watch` channel

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{SignalKind, SignalingMessage};
use super::relay::{RelayConnector, RelayLink};
use super::retry::{RetryPolicy, Scheduler};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Handler invoked for every inbound message of one kind
pub type SignalHandler = Arc<dyn Fn(SignalingMessage) + Send + Sync>;

/// Connection status of the signaling link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    /// Never opened, or closed explicitly
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for / running a backoff retry
    Reconnecting,
    /// Retry budget exhausted
    DisconnectedPermanent,
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportStatus::Disconnected => write!(f, "disconnected"),
            TransportStatus::Connecting => write!(f, "connecting"),
            TransportStatus::Connected => write!(f, "connected"),
            TransportStatus::Reconnecting => write!(f, "reconnecting"),
            TransportStatus::DisconnectedPermanent => write!(f, "disconnected-permanent"),
        }
    }
}

/// Snapshot of the transport's liveness bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportState {
    pub status: TransportStatus,
    /// Failed retries since the last successful connect
    pub reconnect_attempt: u32,
    pub last_error: Option<String>,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            status: TransportStatus::Disconnected,
            reconnect_attempt: 0,
            last_error: None,
        }
    }
}

/// Outbound half of the transport contract
///
/// The negotiation engine only needs to emit messages, so it depends on this
/// trait rather than on the whole transport.
pub trait SignalSink: Send + Sync {
    /// Returns `false` if the message was dropped.
    fn send(&self, message: SignalingMessage) -> bool;
}

/// Signaling transport
#[derive(Clone)]
pub struct SignalingTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    connector: Arc<dyn RelayConnector>,
    scheduler: Arc<dyn Scheduler>,
    policy: RetryPolicy,
    state: Mutex<TransportState>,
    status_tx: watch::Sender<TransportStatus>,
    handlers: RwLock<HashMap<SignalKind, SignalHandler>>,
    /// Present only while a link is up
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Bumped by `connect()` from idle and by `close()`; stale tasks compare against it
    epoch: AtomicU64,
    dropped: AtomicU64,
    throttler: LogThrottler,
    shutdown: CancellationToken,
}

impl SignalingTransport {
    /// Create a transport. Nothing happens until `connect()`.
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        scheduler: Arc<dyn Scheduler>,
        policy: RetryPolicy,
    ) -> Self {
        let (status_tx, _) = watch::channel(TransportStatus::Disconnected);
        Self {
            inner: Arc::new(TransportInner {
                connector,
                scheduler,
                policy,
                state: Mutex::new(TransportState::default()),
                status_tx,
                handlers: RwLock::new(HashMap::new()),
                outbound: Mutex::new(None),
                epoch: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                throttler: LogThrottler::with_secs(5),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Open the link. No-op while connecting, connected or waiting to retry.
    ///
    /// `DisconnectedPermanent` is terminal: once the retry budget is spent the
    /// link stays down for the rest of the session.
    pub fn connect(&self) {
        let epoch = {
            let mut state = self.inner.state.lock();
            match state.status {
                TransportStatus::Connecting
                | TransportStatus::Connected
                | TransportStatus::Reconnecting => {
                    debug!("Signaling connect ignored, already {}", state.status);
                    return;
                }
                TransportStatus::DisconnectedPermanent => {
                    warn!(
                        "Signaling relay gave up after {} attempts, not reconnecting",
                        state.reconnect_attempt
                    );
                    return;
                }
                TransportStatus::Disconnected => {}
            }
            if self.inner.shutdown.is_cancelled() {
                warn!("Signaling transport is closed, not connecting");
                return;
            }
            self.inner.set_status(&mut state, TransportStatus::Connecting);
            self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };

        info!("Connecting to signaling relay");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.attempt(epoch).await;
        });
    }

    /// Close the link for good. Pending retries are abandoned.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        *self.inner.outbound.lock() = None;
        let mut state = self.inner.state.lock();
        self.inner.set_status(&mut state, TransportStatus::Disconnected);
        info!("Signaling transport closed");
    }

    /// Send a message if the link is up; otherwise drop it with a warning.
    pub fn send(&self, message: SignalingMessage) -> bool {
        let kind = message.kind();
        let outbound = self.inner.outbound.lock().clone();

        let Some(tx) = outbound else {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            warn_throttled!(
                self.inner.throttler,
                &format!("send:{}", kind),
                "Signaling not connected, dropping '{}' message",
                kind
            );
            return false;
        };

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode '{}' message: {}", kind, e);
                return false;
            }
        };

        if tx.send(text).is_err() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Signaling link closed while sending '{}'", kind);
            return false;
        }

        debug!("Sent signaling message '{}'", kind);
        true
    }

    /// Register the handler for `kind`, replacing any previous one
    pub fn subscribe<F>(&self, kind: SignalKind, handler: F)
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        if self
            .inner
            .handlers
            .write()
            .insert(kind, Arc::new(handler))
            .is_some()
        {
            debug!("Replaced handler for '{}'", kind);
        }
    }

    /// Remove the handler for `kind`
    pub fn unsubscribe(&self, kind: SignalKind) {
        self.inner.handlers.write().remove(&kind);
    }

    pub fn status(&self) -> TransportStatus {
        self.inner.state.lock().status
    }

    pub fn state(&self) -> TransportState {
        self.inner.state.lock().clone()
    }

    /// Subscribe to status changes
    pub fn status_watch(&self) -> watch::Receiver<TransportStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Messages dropped because no link was up
    pub fn dropped_messages(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl SignalSink for SignalingTransport {
    fn send(&self, message: SignalingMessage) -> bool {
        SignalingTransport::send(self, message)
    }
}

impl TransportInner {
    fn set_status(&self, state: &mut TransportState, status: TransportStatus) {
        if state.status != status {
            debug!("Signaling status: {} -> {}", state.status, status);
        }
        state.status = status;
        self.status_tx.send_replace(status);
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.shutdown.is_cancelled() || self.epoch.load(Ordering::SeqCst) != epoch
    }

    async fn attempt(self: Arc<Self>, epoch: u64) {
        let result = self.connector.connect().await;

        if self.is_stale(epoch) {
            debug!("Discarding signaling connect result from a closed lifecycle");
            return;
        }

        match result {
            Ok(link) => self.on_link(link, epoch),
            Err(e) => self.on_failure(e.to_string(), epoch),
        }
    }

    fn on_link(self: &Arc<Self>, link: RelayLink, epoch: u64) {
        let RelayLink { outbound, inbound } = link;
        {
            let mut state = self.state.lock();
            *self.outbound.lock() = Some(outbound);
            state.reconnect_attempt = 0;
            state.last_error = None;
            self.set_status(&mut state, TransportStatus::Connected);
        }
        self.throttler.clear_all();
        info!("Signaling relay connected");

        let inner = self.clone();
        tokio::spawn(async move {
            inner.read_loop(inbound, epoch).await;
        });
    }

    async fn read_loop(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<String>, epoch: u64) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                frame = inbound.recv() => match frame {
                    Some(text) => self.dispatch(&text),
                    None => break,
                },
            }
        }

        if !self.is_stale(epoch) {
            self.on_failure("relay link closed".to_string(), epoch);
        }
    }

    fn dispatch(&self, text: &str) {
        let message = match SignalingMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn_throttled!(
                    self.throttler,
                    "decode",
                    "Ignoring undecodable signaling frame: {}",
                    e
                );
                return;
            }
        };

        let kind = message.kind();
        let handler = self.handlers.read().get(&kind).cloned();
        match handler {
            Some(handler) => {
                debug!("Dispatching signaling message '{}'", kind);
                handler(message);
            }
            None => debug!("No handler for signaling message '{}'", kind),
        }
    }

    fn on_failure(self: &Arc<Self>, reason: String, epoch: u64) {
        *self.outbound.lock() = None;
        let mut state = self.state.lock();
        state.last_error = Some(reason.clone());

        if self.policy.allows(state.reconnect_attempt) {
            let delay = self.policy.delay_for(state.reconnect_attempt);
            warn!(
                "Signaling connection failed: {}. Retrying in {:?} (attempt {}/{})",
                reason,
                delay,
                state.reconnect_attempt + 1,
                self.policy.max_attempts
            );
            self.set_status(&mut state, TransportStatus::Reconnecting);

            let inner = self.clone();
            self.scheduler
                .schedule(delay, Box::pin(async move { inner.retry(epoch).await }));
        } else {
            error!(
                "Signaling connection failed: {}. Giving up after {} attempts",
                reason, state.reconnect_attempt
            );
            self.set_status(&mut state, TransportStatus::DisconnectedPermanent);
        }
    }

    async fn retry(self: Arc<Self>, epoch: u64) {
        {
            let mut state = self.state.lock();
            if self.is_stale(epoch) {
                return;
            }
            state.reconnect_attempt += 1;
            info!(
                "Signaling reconnection attempt {}/{}",
                state.reconnect_attempt, self.policy.max_attempts
            );
        }
        self.attempt(epoch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::Participant;
    use crate::signaling::retry::ManualScheduler;
    use crate::testing::{wait_for_status, MemoryConnector};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn transport(connector: &MemoryConnector, scheduler: &ManualScheduler) -> SignalingTransport {
        SignalingTransport::new(
            Arc::new(connector.clone()),
            Arc::new(scheduler.clone()),
            RetryPolicy::default(),
        )
    }

    fn match_found(name: &str) -> SignalingMessage {
        SignalingMessage::MatchFound {
            partner: Participant::new(name, "Norway"),
            session_id: None,
            role: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_send_reaches_relay() {
        let connector = MemoryConnector::new();
        let scheduler = ManualScheduler::new();
        let transport = transport(&connector, &scheduler);

        transport.connect();
        wait_for_status(&transport, TransportStatus::Connected).await;
        let mut relay = connector.next_peer().await;

        assert!(transport.send(SignalingMessage::SearchCancelled));
        assert_eq!(relay.recv_message().await, SignalingMessage::SearchCancelled);
        assert_eq!(transport.dropped_messages(), 0);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let connector = MemoryConnector::new();
        let scheduler = ManualScheduler::new();
        let transport = transport(&connector, &scheduler);

        assert!(!transport.send(SignalingMessage::SearchCancelled));
        assert!(!transport.send(SignalingMessage::CallEnded { session_id: None }));
        assert_eq!(transport.dropped_messages(), 2);
        assert_eq!(connector.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let connector = MemoryConnector::new();
        let scheduler = ManualScheduler::new();
        let transport = transport(&connector, &scheduler);

        transport.connect();
        transport.connect();
        wait_for_status(&transport, TransportStatus::Connected).await;
        transport.connect();

        assert_eq!(connector.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_handler() {
        let connector = MemoryConnector::new();
        let scheduler = ManualScheduler::new();
        let transport = transport(&connector, &scheduler);

        let first = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let counter = first.clone();
        transport.subscribe(SignalKind::MatchFound, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        transport.subscribe(SignalKind::MatchFound, move |msg| {
            let _ = tx.send(msg);
        });

        transport.connect();
        wait_for_status(&transport, TransportStatus::Connected).await;
        let relay = connector.next_peer().await;
        relay.send_message(&match_found("Ada"));

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.kind(), SignalKind::MatchFound);
        assert_eq!(first.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let connector = MemoryConnector::new();
        let scheduler = ManualScheduler::new();
        let transport = transport(&connector, &scheduler);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let match_tx = tx.clone();
        transport.subscribe(SignalKind::MatchFound, move |msg| {
            let _ = match_tx.send(msg);
        });
        transport.subscribe(SignalKind::CallEnded, move |msg| {
            let _ = tx.send(msg);
        });
        transport.unsubscribe(SignalKind::MatchFound);

        transport.connect();
        wait_for_status(&transport, TransportStatus::Connected).await;
        let relay = connector.next_peer().await;
        relay.send_message(&match_found("Ada"));
        relay.send_message(&SignalingMessage::CallEnded { session_id: None });

        // Frames are dispatched in order, so the first delivery must be call-ended
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.kind(), SignalKind::CallEnded);
    }

    #[tokio::test]
    async fn test_backoff_then_permanent_failure() {
        let connector = MemoryConnector::refusing();
        let scheduler = ManualScheduler::new();
        let transport = transport(&connector, &scheduler);
        let mut status = transport.status_watch();

        transport.connect();
        wait_for_status(&transport, TransportStatus::Reconnecting).await;

        for expected_attempt in 1..=5 {
            assert!(scheduler.fire_next().await);
            assert_eq!(transport.state().reconnect_attempt, expected_attempt);
        }

        assert_eq!(transport.status(), TransportStatus::DisconnectedPermanent);
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), TransportStatus::DisconnectedPermanent);
        assert_eq!(scheduler.pending(), 0);
        // Initial attempt plus five retries
        assert_eq!(connector.connect_calls(), 6);
        let delays: Vec<u64> = scheduler.delays().iter().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert!(transport.state().last_error.is_some());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_terminal() {
        let connector = MemoryConnector::scripted(&[false; 6]);
        let scheduler = ManualScheduler::new();
        let transport = transport(&connector, &scheduler);

        transport.connect();
        wait_for_status(&transport, TransportStatus::Reconnecting).await;
        while scheduler.fire_next().await {}
        assert_eq!(transport.status(), TransportStatus::DisconnectedPermanent);
        assert_eq!(transport.state().reconnect_attempt, 5);

        // The relay would accept now, but the budget is spent
        transport.connect();
        let state = transport.state();
        assert_eq!(state.status, TransportStatus::DisconnectedPermanent);
        assert_eq!(state.reconnect_attempt, 5);
        assert_eq!(scheduler.pending(), 0);
        tokio::task::yield_now().await;
        assert_eq!(connector.connect_calls(), 6);
    }

    #[tokio::test]
    async fn test_success_resets_attempt_counter() {
        let connector = MemoryConnector::scripted(&[false, false, true]);
        let scheduler = ManualScheduler::new();
        let transport = transport(&connector, &scheduler);

        transport.connect();
        wait_for_status(&transport, TransportStatus::Reconnecting).await;
        assert_eq!(transport.state().reconnect_attempt, 0);

        assert!(scheduler.fire_next().await);
        assert_eq!(transport.state().reconnect_attempt, 1);
        assert_eq!(transport.status(), TransportStatus::Reconnecting);

        assert!(scheduler.fire_next().await);
        let state = transport.state();
        assert_eq!(state.status, TransportStatus::Connected);
        assert_eq!(state.reconnect_attempt, 0);
        assert_eq!(state.last_error, None);
    }

    #[tokio::test]
    async fn test_link_loss_schedules_reconnect() {
        let connector = MemoryConnector::new();
        let scheduler = ManualScheduler::new();
        let transport = transport(&connector, &scheduler);

        transport.connect();
        wait_for_status(&transport, TransportStatus::Connected).await;
        let relay = connector.next_peer().await;
        drop(relay);

        wait_for_status(&transport, TransportStatus::Reconnecting).await;
        assert_eq!(scheduler.delays(), vec![Duration::from_secs(1)]);
        assert!(!transport.send(SignalingMessage::SearchCancelled));

        assert!(scheduler.fire_next().await);
        assert_eq!(transport.status(), TransportStatus::Connected);
        assert_eq!(connector.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_close_abandons_pending_retry() {
        let connector = MemoryConnector::refusing();
        let scheduler = ManualScheduler::new();
        let transport = transport(&connector, &scheduler);

        transport.connect();
        wait_for_status(&transport, TransportStatus::Reconnecting).await;
        transport.close();

        assert!(scheduler.fire_next().await);
        assert_eq!(transport.status(), TransportStatus::Disconnected);
        assert_eq!(connector.connect_calls(), 1);

        transport.connect();
        assert_eq!(transport.status(), TransportStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_garbage_frames_are_ignored() {
        let connector = MemoryConnector::new();
        let scheduler = ManualScheduler::new();
        let transport = transport(&connector, &scheduler);

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.subscribe(SignalKind::CallEnded, move |msg| {
            let _ = tx.send(msg);
        });

        transport.connect();
        wait_for_status(&transport, TransportStatus::Connected).await;
        let relay = connector.next_peer().await;
        relay.send_raw("{not json");
        relay.send_message(&SignalingMessage::CallEnded { session_id: None });

        assert!(tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .is_some());
        assert_eq!(transport.status(), TransportStatus::Connected);
    }
}
