//! Negotiation engine
//!
//! Drives one peer connection at a time through offer/answer/ICE exchange.
//!
//! Every connection gets a generation number. Callbacks of a connection are
//! forwarded tagged with its generation, and the forwarder stops as soon as
//! the generation is no longer live, so a torn-down connection cannot leak
//! events into the next call attempt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::media::{LocalMedia, MediaConstraints, MediaSource};
use super::peer::{PeerEvent, PeerFactory, PeerLink};
use crate::error::{AppError, Result};
use crate::signaling::{IceCandidate, SdpType, SessionDescription, SessionId, SignalSink, SignalingMessage};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Offer/answer progress of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Connection created, nothing exchanged yet
    New,
    /// We sent an offer and wait for the answer
    HaveLocalOffer,
    /// Transient while answering a remote offer
    HaveRemoteOffer,
    /// Both descriptions set
    Stable,
}

/// Per-attempt negotiation bookkeeping
///
/// Created with each connection and dropped with it, never reused.
#[derive(Debug, Clone)]
pub struct NegotiationState {
    pub local_description_set: bool,
    pub remote_description_set: bool,
    /// Remote candidates that arrived before the remote description, in arrival order
    pub pending_remote_candidates: VecDeque<IceCandidate>,
    pub phase: NegotiationPhase,
}

impl NegotiationState {
    fn new() -> Self {
        Self {
            local_description_set: false,
            remote_description_set: false,
            pending_remote_candidates: VecDeque::new(),
            phase: NegotiationPhase::New,
        }
    }
}

/// What happened to an inbound remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    /// Buffered until the remote description is set
    Queued,
    /// The peer connection rejected it; logged, not fatal
    Rejected,
    /// No connection to apply it to
    Dropped,
}

/// Peer-connection event tagged with the generation it belongs to
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub generation: u64,
    pub event: PeerEvent,
}

struct ActiveNegotiation {
    generation: u64,
    session_id: Option<SessionId>,
    state: NegotiationState,
    peer: Arc<dyn PeerLink>,
    forwarder: JoinHandle<()>,
}

/// Negotiation engine
pub struct NegotiationEngine {
    peers: Arc<dyn PeerFactory>,
    media_source: Arc<dyn MediaSource>,
    signals: Arc<dyn SignalSink>,
    constraints: MediaConstraints,
    local_media: Option<LocalMedia>,
    current: Option<ActiveNegotiation>,
    /// Generation of the current connection, 0 when there is none
    live_generation: Arc<AtomicU64>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    throttler: LogThrottler,
}

impl NegotiationEngine {
    /// Create an engine and the receiver for its connection events
    pub fn new(
        peers: Arc<dyn PeerFactory>,
        media_source: Arc<dyn MediaSource>,
        signals: Arc<dyn SignalSink>,
        constraints: MediaConstraints,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            peers,
            media_source,
            signals,
            constraints,
            local_media: None,
            current: None,
            live_generation: Arc::new(AtomicU64::new(0)),
            next_generation: 0,
            events_tx,
            throttler: LogThrottler::with_secs(5),
        };
        (engine, events_rx)
    }

    /// Acquire camera and microphone, reusing the stream already held
    pub async fn acquire_local_media(&mut self) -> Result<LocalMedia> {
        if let Some(media) = self.local_media.as_ref().filter(|m| !m.is_stopped()) {
            debug!("Reusing local stream {}", media.stream_id());
            return Ok(media.clone());
        }

        let media = self.media_source.acquire(&self.constraints).await?;
        info!("Local stream {} acquired", media.stream_id());
        self.local_media = Some(media.clone());
        Ok(media)
    }

    /// Stop and forget the local stream
    pub fn release_local_media(&mut self) {
        if let Some(media) = self.local_media.take() {
            media.stop();
            info!("Local stream {} released", media.stream_id());
        }
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    /// Flip the camera flag; `None` without a local stream
    pub fn toggle_video(&self) -> Option<bool> {
        self.local_media.as_ref().map(|m| m.toggle_video())
    }

    /// Flip the microphone flag; `None` without a local stream
    pub fn toggle_audio(&self) -> Option<bool> {
        self.local_media.as_ref().map(|m| m.toggle_audio())
    }

    /// Start a new negotiation attempt, tearing down any previous one first.
    ///
    /// Returns the generation of the new connection.
    pub async fn create_connection(&mut self, session_id: Option<SessionId>) -> Result<u64> {
        self.teardown().await;

        self.next_generation += 1;
        let generation = self.next_generation;
        let label = match &session_id {
            Some(id) => format!("{}#{}", id, generation),
            None => format!("call#{}", generation),
        };

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = self.peers.create(&label, peer_tx).await?;

        if let Some(media) = &self.local_media {
            if let Err(e) = peer.attach_local_media(media).await {
                if let Err(close_err) = peer.close().await {
                    warn!("Error closing peer connection {}: {}", label, close_err);
                }
                return Err(e);
            }
        }

        self.live_generation.store(generation, Ordering::SeqCst);
        let forwarder = tokio::spawn(forward_peer_events(
            peer_rx,
            generation,
            self.live_generation.clone(),
            self.signals.clone(),
            session_id.clone(),
            self.events_tx.clone(),
        ));

        self.current = Some(ActiveNegotiation {
            generation,
            session_id,
            state: NegotiationState::new(),
            peer,
            forwarder,
        });

        info!("Negotiation {} started", label);
        Ok(generation)
    }

    /// Create an offer, set it locally and send it to the partner
    pub async fn create_offer(&mut self) -> Result<()> {
        let active = self
            .current
            .as_mut()
            .ok_or_else(|| AppError::Negotiation("no active connection to offer on".to_string()))?;

        if active.state.phase != NegotiationPhase::New {
            return Err(AppError::Negotiation(format!(
                "offer already in flight for generation {}",
                active.generation
            )));
        }

        let offer = active.peer.create_offer().await?;
        active.peer.set_local_description(offer.clone()).await?;
        active.state.local_description_set = true;
        active.state.phase = NegotiationPhase::HaveLocalOffer;

        let message = SignalingMessage::CallOffer {
            offer,
            session_id: active.session_id.clone(),
        };
        if !self.signals.send(message) {
            warn!("Offer for generation {} was not delivered", active.generation);
        }
        debug!("Offer created for generation {}", active.generation);
        Ok(())
    }

    /// Answer a remote offer (callee side)
    pub async fn handle_remote_offer(&mut self, offer: SessionDescription) -> Result<()> {
        if offer.sdp_type != SdpType::Offer {
            return Err(AppError::Negotiation(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }

        let active = self.current.as_mut().ok_or_else(|| {
            AppError::Negotiation("offer received with no active connection".to_string())
        })?;

        if active.state.phase != NegotiationPhase::New {
            return Err(AppError::Negotiation(format!(
                "unexpected offer in phase {:?}",
                active.state.phase
            )));
        }

        active.peer.set_remote_description(offer).await?;
        active.state.remote_description_set = true;
        active.state.phase = NegotiationPhase::HaveRemoteOffer;
        Self::flush_candidates(active, &self.throttler).await;

        let answer = active.peer.create_answer().await?;
        active.peer.set_local_description(answer.clone()).await?;
        active.state.local_description_set = true;
        active.state.phase = NegotiationPhase::Stable;

        let message = SignalingMessage::CallAnswer {
            answer,
            session_id: active.session_id.clone(),
        };
        if !self.signals.send(message) {
            warn!("Answer for generation {} was not delivered", active.generation);
        }
        debug!("Answered offer for generation {}", active.generation);
        Ok(())
    }

    /// Apply the partner's answer to our offer
    pub async fn handle_remote_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if answer.sdp_type != SdpType::Answer {
            return Err(AppError::Negotiation(format!(
                "expected an answer, got {:?}",
                answer.sdp_type
            )));
        }

        let active = self.current.as_mut().ok_or_else(|| {
            AppError::Negotiation("answer received with no active connection".to_string())
        })?;

        if active.state.phase != NegotiationPhase::HaveLocalOffer {
            return Err(AppError::Negotiation(format!(
                "answer received without a pending offer (phase {:?})",
                active.state.phase
            )));
        }

        active.peer.set_remote_description(answer).await?;
        active.state.remote_description_set = true;
        active.state.phase = NegotiationPhase::Stable;
        Self::flush_candidates(active, &self.throttler).await;

        debug!("Answer applied for generation {}", active.generation);
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the remote description is set
    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) -> CandidateOutcome {
        let Some(active) = self.current.as_mut() else {
            debug!("Dropping remote candidate, no active connection");
            return CandidateOutcome::Dropped;
        };

        if !active.state.remote_description_set {
            active.state.pending_remote_candidates.push_back(candidate);
            debug!(
                "Queued remote candidate ({} pending)",
                active.state.pending_remote_candidates.len()
            );
            return CandidateOutcome::Queued;
        }

        Self::apply_candidate(active.peer.as_ref(), candidate, &self.throttler).await
    }

    async fn flush_candidates(active: &mut ActiveNegotiation, throttler: &LogThrottler) {
        if active.state.pending_remote_candidates.is_empty() {
            return;
        }
        debug!(
            "Flushing {} queued remote candidates",
            active.state.pending_remote_candidates.len()
        );
        while let Some(candidate) = active.state.pending_remote_candidates.pop_front() {
            Self::apply_candidate(active.peer.as_ref(), candidate, throttler).await;
        }
    }

    async fn apply_candidate(
        peer: &dyn PeerLink,
        candidate: IceCandidate,
        throttler: &LogThrottler,
    ) -> CandidateOutcome {
        match peer.add_ice_candidate(candidate).await {
            Ok(()) => CandidateOutcome::Applied,
            Err(e) => {
                warn_throttled!(throttler, "add_candidate", "Failed to apply remote candidate: {}", e);
                CandidateOutcome::Rejected
            }
        }
    }

    /// Close the current connection and discard its state.
    ///
    /// Returns `false` if there was nothing to tear down.
    pub async fn teardown(&mut self) -> bool {
        let Some(active) = self.current.take() else {
            return false;
        };

        self.live_generation.store(0, Ordering::SeqCst);
        active.forwarder.abort();
        if let Err(e) = active.peer.close().await {
            warn!("Error closing peer connection {}: {}", active.generation, e);
        }

        info!(
            "Negotiation {} torn down ({} queued candidates discarded)",
            active.generation,
            active.state.pending_remote_candidates.len()
        );
        true
    }

    pub fn has_connection(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.current.as_ref().map(|a| a.generation)
    }

    /// Whether an event tagged `generation` belongs to the live connection
    pub fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == Some(generation)
    }

    pub fn negotiation_state(&self) -> Option<&NegotiationState> {
        self.current.as_ref().map(|a| &a.state)
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.current.as_ref().and_then(|a| a.session_id.as_ref())
    }
}

/// Relay one connection's callbacks until its generation is retired.
///
/// Local candidates go straight to the partner; everything else is handed to
/// the owner of the engine.
async fn forward_peer_events(
    mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    generation: u64,
    live_generation: Arc<AtomicU64>,
    signals: Arc<dyn SignalSink>,
    session_id: Option<SessionId>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
) {
    while let Some(event) = peer_rx.recv().await {
        if live_generation.load(Ordering::SeqCst) != generation {
            debug!("Dropping event from retired connection {}", generation);
            break;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                signals.send(SignalingMessage::Candidate {
                    candidate,
                    session_id: session_id.clone(),
                });
            }
            event => {
                if events_tx.send(EngineEvent { generation, event }).is_err() {
                    break;
                }
            }
        }
    }
}
