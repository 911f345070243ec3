//! Fakes for the external collaborators, shared by unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{AppError, Result};
use crate::negotiation::{
    LocalMedia, LocalTrack, MediaConstraints, MediaSource, PeerEvent, PeerFactory, PeerLink,
    TrackKind,
};
use crate::signaling::{
    IceCandidate, RelayConnector, RelayLink, SdpType, SessionDescription, SignalSink,
    SignalingMessage, SignalingTransport, TransportStatus,
};

const WAIT: Duration = Duration::from_secs(2);

/// Wait until the transport reports `status`
pub async fn wait_for_status(transport: &SignalingTransport, status: TransportStatus) {
    let mut rx = transport.status_watch();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == status))
        .await
        .unwrap_or_else(|_| panic!("transport never reached {}", status))
        .unwrap();
}

/// Relay side of one in-memory link
pub struct RelayPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl RelayPeer {
    pub async fn recv_message(&mut self) -> SignalingMessage {
        let text = tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("no frame from client")
            .expect("client link closed");
        SignalingMessage::from_json(&text).unwrap()
    }

    /// Every message the client sent so far
    pub fn drain(&mut self) -> Vec<SignalingMessage> {
        let mut messages = vec![];
        while let Ok(text) = self.from_client.try_recv() {
            messages.push(SignalingMessage::from_json(&text).unwrap());
        }
        messages
    }

    pub fn send_message(&self, message: &SignalingMessage) {
        self.send_raw(&message.to_json().unwrap());
    }

    pub fn send_raw(&self, text: &str) {
        self.to_client.send(text.to_string()).unwrap();
    }
}

/// In-memory relay connector
///
/// Each connect either fails or hands the relay side of a new link to the test.
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<MemoryConnectorState>,
}

struct MemoryConnectorState {
    script: Mutex<VecDeque<bool>>,
    accept_by_default: bool,
    calls: AtomicUsize,
    peers_tx: mpsc::UnboundedSender<RelayPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RelayPeer>>,
}

impl MemoryConnector {
    fn build(script: &[bool], accept_by_default: bool) -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MemoryConnectorState {
                script: Mutex::new(script.iter().copied().collect()),
                accept_by_default,
                calls: AtomicUsize::new(0),
                peers_tx,
                peers_rx: tokio::sync::Mutex::new(peers_rx),
            }),
        }
    }

    /// Accepts every connect
    pub fn new() -> Self {
        Self::build(&[], true)
    }

    /// Refuses every connect
    pub fn refusing() -> Self {
        Self::build(&[], false)
    }

    /// Follows `script` (true = accept), then accepts
    pub fn scripted(script: &[bool]) -> Self {
        Self::build(script, true)
    }

    pub fn connect_calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Relay side of the next accepted link
    pub async fn next_peer(&self) -> RelayPeer {
        let mut rx = self.inner.peers_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("no link was accepted")
            .expect("connector dropped")
    }
}

#[async_trait]
impl RelayConnector for MemoryConnector {
    async fn connect(&self) -> Result<RelayLink> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let accept = self
            .inner
            .script
            .lock()
            .pop_front()
            .unwrap_or(self.inner.accept_by_default);
        if !accept {
            return Err(AppError::TransportUnavailable("connection refused".to_string()));
        }

        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let _ = self.inner.peers_tx.send(RelayPeer {
            from_client,
            to_client,
        });
        Ok(RelayLink { outbound, inbound })
    }
}

/// Signal sink that records what was sent
#[derive(Clone)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<SignalingMessage>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn messages(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    /// Wait until at least `count` messages were sent
    pub async fn wait_for(&self, count: usize) -> Vec<SignalingMessage> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let sent = self.messages();
            if sent.len() >= count {
                return sent;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "only {} of {} messages sent",
                sent.len(),
                count
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, message: SignalingMessage) -> bool {
        self.sent.lock().push(message);
        true
    }
}

/// Media source that hands out track-less streams, or refuses
#[derive(Clone)]
pub struct FakeMediaSource {
    deny: Arc<AtomicBool>,
    acquisitions: Arc<AtomicUsize>,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        Self {
            deny: Arc::new(AtomicBool::new(false)),
            acquisitions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Number of acquire calls, including refused ones
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, _constraints: &MediaConstraints) -> Result<LocalMedia> {
        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
        if self.deny.load(Ordering::SeqCst) {
            return Err(AppError::MediaPermissionDenied(
                "NotAllowedError: permission denied".to_string(),
            ));
        }
        Ok(LocalMedia::new(
            format!("fake-stream-{}", n),
            Some(LocalTrack::new("video0", TrackKind::Video, None)),
            Some(LocalTrack::new("audio0", TrackKind::Audio, None)),
        ))
    }
}

/// Operation recorded by [`FakePeer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    AttachMedia,
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

/// Scripted peer connection
///
/// Remote descriptions whose SDP contains `bad` and candidates containing
/// `bad` are rejected.
pub struct FakePeer {
    label: String,
    calls: Mutex<Vec<PeerCall>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    fail_attach: bool,
}

impl FakePeer {
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                PeerCall::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &PeerCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    /// Raise a connection callback
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerLink for FakePeer {
    async fn attach_local_media(&self, _media: &LocalMedia) -> Result<()> {
        self.record(PeerCall::AttachMedia);
        if self.fail_attach {
            return Err(AppError::WebRtcError("add_track failed".to_string()));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(PeerCall::CreateOffer);
        Ok(SessionDescription::offer(format!("v=0 offer from {}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer(format!("v=0 answer from {}", self.label)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(PeerCall::SetLocal(description.sdp_type));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if description.sdp.contains("bad") {
            return Err(AppError::Negotiation("malformed remote SDP".to_string()));
        }
        self.record(PeerCall::SetRemote(description.sdp_type));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.contains("bad") {
            return Err(AppError::Negotiation("malformed candidate".to_string()));
        }
        self.record(PeerCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(PeerCall::Close);
        Ok(())
    }
}

/// Peer factory that keeps every peer it created
#[derive(Clone)]
pub struct FakePeerFactory {
    peers: Arc<Mutex<Vec<Arc<FakePeer>>>>,
    fail_next: Arc<AtomicBool>,
    fail_next_attach: Arc<AtomicBool>,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(Mutex::new(vec![])),
            fail_next: Arc::new(AtomicBool::new(false)),
            fail_next_attach: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        self.peers.lock()[index].clone()
    }

    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }

    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// The next peer created refuses local media
    pub fn fail_next_attach(&self) {
        self.fail_next_attach.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        label: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AppError::WebRtcError("peer connection unavailable".to_string()));
        }
        let peer = Arc::new(FakePeer {
            label: label.to_string(),
            calls: Mutex::new(vec![]),
            events,
            fail_attach: self.fail_next_attach.swap(false, Ordering::SeqCst),
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}
