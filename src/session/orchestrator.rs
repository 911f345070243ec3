//! Session orchestrator
//!
//! A single task owns the session state, the negotiation engine and the
//! transport subscriptions. Commands, inbound signals, peer-connection events
//! and transport status changes are all handled one at a time in its loop.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::state::{session_matches, SessionPhase, SessionState};
use crate::config::SessionConfig;
use crate::error::{AppError, Result};
use crate::events::{CallEndReason, EventBus, SessionEvent};
use crate::negotiation::{
    ConnectionQuality, ConnectionState, EngineEvent, NegotiationEngine, PeerEvent,
};
use crate::signaling::{
    CallRole, ChatMessage, MatchPreferences, Participant, ReportReason, SessionId, SignalKind,
    SignalingMessage, SignalingTransport, TransportStatus,
};

/// Command queue depth
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Inbound events the orchestrator reacts to
const SUBSCRIBED_SIGNALS: [SignalKind; 6] = [
    SignalKind::MatchFound,
    SignalKind::CallOffer,
    SignalKind::CallAnswer,
    SignalKind::IceCandidate,
    SignalKind::CallEnded,
    SignalKind::ChatMessage,
];

type Reply<T> = oneshot::Sender<Result<T>>;

/// Commands accepted by the orchestrator
enum SessionCommand {
    GetStarted(Reply<()>),
    CompleteOnboarding {
        profile: Participant,
        preferences: MatchPreferences,
        reply: Reply<()>,
    },
    BackToLanding(Reply<()>),
    UpdatePreferences {
        preferences: MatchPreferences,
        reply: Reply<()>,
    },
    DismissError(Reply<()>),
    StartSearch(Reply<()>),
    CancelSearch(Reply<()>),
    EndCall(Reply<()>),
    NextPartner(Reply<()>),
    SendMessage {
        text: String,
        reply: Reply<()>,
    },
    ReportUser {
        reason: ReportReason,
        reply: Reply<()>,
    },
    ToggleVideo(Reply<bool>),
    ToggleAudio(Reply<bool>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running session
///
/// Cheap to clone. When every handle is dropped the session shuts down.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionState>>,
    events: Arc<EventBus>,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Self::closed())?;
        rx.await.map_err(|_| Self::closed())?
    }

    fn closed() -> AppError {
        AppError::InvalidState("session is shut down".to_string())
    }

    /// Current session state (read-only snapshot)
    pub fn snapshot(&self) -> Arc<SessionState> {
        self.snapshot.load_full()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Landing -> onboarding
    pub async fn get_started(&self) -> Result<()> {
        self.request(SessionCommand::GetStarted).await
    }

    /// Record the profile, acquire camera and microphone, enter the lobby
    pub async fn complete_onboarding(
        &self,
        profile: Participant,
        preferences: MatchPreferences,
    ) -> Result<()> {
        self.request(|reply| SessionCommand::CompleteOnboarding {
            profile,
            preferences,
            reply,
        })
        .await
    }

    pub async fn back_to_landing(&self) -> Result<()> {
        self.request(SessionCommand::BackToLanding).await
    }

    pub async fn update_preferences(&self, preferences: MatchPreferences) -> Result<()> {
        self.request(|reply| SessionCommand::UpdatePreferences { preferences, reply })
            .await
    }

    pub async fn dismiss_error(&self) -> Result<()> {
        self.request(SessionCommand::DismissError).await
    }

    /// Lobby -> searching
    pub async fn start_search(&self) -> Result<()> {
        self.request(SessionCommand::StartSearch).await
    }

    /// Searching -> lobby
    pub async fn cancel_search(&self) -> Result<()> {
        self.request(SessionCommand::CancelSearch).await
    }

    /// Hang up and return to the lobby
    pub async fn end_call(&self) -> Result<()> {
        self.request(SessionCommand::EndCall).await
    }

    /// Hang up and search again
    pub async fn next_partner(&self) -> Result<()> {
        self.request(SessionCommand::NextPartner).await
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| SessionCommand::SendMessage { text, reply })
            .await
    }

    pub async fn report_user(&self, reason: ReportReason) -> Result<()> {
        self.request(|reply| SessionCommand::ReportUser { reason, reply })
            .await
    }

    /// Flip the camera; returns whether it is now enabled
    pub async fn toggle_video(&self) -> Result<bool> {
        self.request(SessionCommand::ToggleVideo).await
    }

    /// Flip the microphone; returns whether it is now enabled
    pub async fn toggle_audio(&self) -> Result<bool> {
        self.request(SessionCommand::ToggleAudio).await
    }

    /// End any call, stop local media and close the transport
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Session orchestrator
pub struct Orchestrator {
    config: SessionConfig,
    transport: SignalingTransport,
    engine: NegotiationEngine,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    signals_tx: mpsc::UnboundedSender<SignalingMessage>,
    signals_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    status_rx: watch::Receiver<TransportStatus>,
    commands: mpsc::Receiver<SessionCommand>,
    state: SessionState,
    snapshot: Arc<ArcSwap<SessionState>>,
    events: Arc<EventBus>,
}

impl Orchestrator {
    /// Start the orchestrator task
    ///
    /// `engine` must send through `transport`; `engine_events` is the
    /// receiver returned alongside it.
    pub fn spawn(
        config: SessionConfig,
        transport: SignalingTransport,
        engine: NegotiationEngine,
        engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        events: Arc<EventBus>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let mut state = SessionState::new(config.default_preferences.clone());
        state.transport = transport.status();
        let snapshot = Arc::new(ArcSwap::from_pointee(state.clone()));

        let orchestrator = Self {
            config,
            status_rx: transport.status_watch(),
            transport,
            engine,
            engine_events,
            signals_tx,
            signals_rx,
            commands,
            state,
            snapshot: snapshot.clone(),
            events: events.clone(),
        };

        let task = tokio::spawn(orchestrator.run());
        let handle = SessionHandle {
            commands: commands_tx,
            snapshot,
            events,
        };
        (handle, task)
    }

    async fn run(mut self) {
        info!("Session orchestrator started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown(done)) => {
                        self.shutdown().await;
                        self.commit();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(message) = self.signals_rx.recv() => self.handle_signal(message).await,
                Some(event) = self.engine_events.recv() => self.handle_engine_event(event).await,
                Ok(()) = self.status_rx.changed() => {
                    let status = *self.status_rx.borrow_and_update();
                    self.handle_transport_status(status).await;
                }
            }
            self.commit();
        }

        self.commit();
        info!("Session orchestrator stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::GetStarted(reply) => {
                let _ = reply.send(self.get_started());
            }
            SessionCommand::CompleteOnboarding {
                profile,
                preferences,
                reply,
            } => {
                let _ = reply.send(self.complete_onboarding(profile, preferences).await);
            }
            SessionCommand::BackToLanding(reply) => {
                let _ = reply.send(self.back_to_landing());
            }
            SessionCommand::UpdatePreferences { preferences, reply } => {
                let _ = reply.send(self.update_preferences(preferences));
            }
            SessionCommand::DismissError(reply) => {
                self.state.error = None;
                let _ = reply.send(Ok(()));
            }
            SessionCommand::StartSearch(reply) => {
                let _ = reply.send(self.start_search().await);
            }
            SessionCommand::CancelSearch(reply) => {
                let _ = reply.send(self.cancel_search());
            }
            SessionCommand::EndCall(reply) => {
                let result = self.require_call("end call");
                if result.is_ok() {
                    self.finish_call(CallEndReason::UserEnded, true).await;
                }
                let _ = reply.send(result);
            }
            SessionCommand::NextPartner(reply) => {
                let _ = reply.send(self.next_partner().await);
            }
            SessionCommand::SendMessage { text, reply } => {
                let _ = reply.send(self.send_message(&text));
            }
            SessionCommand::ReportUser { reason, reply } => {
                let _ = reply.send(self.report_user(reason));
            }
            SessionCommand::ToggleVideo(reply) => {
                let _ = reply.send(self.engine.toggle_video().ok_or_else(Self::no_media));
            }
            SessionCommand::ToggleAudio(reply) => {
                let _ = reply.send(self.engine.toggle_audio().ok_or_else(Self::no_media));
            }
            // Handled by the run loop
            SessionCommand::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    fn no_media() -> AppError {
        AppError::InvalidState("no local media".to_string())
    }

    fn require_phase(&self, expected: SessionPhase, action: &str) -> Result<()> {
        if self.state.phase == expected {
            Ok(())
        } else {
            Err(AppError::InvalidState(format!(
                "cannot {} while {}",
                action, self.state.phase
            )))
        }
    }

    fn require_call(&self, action: &str) -> Result<()> {
        if self.state.phase.in_call() {
            Ok(())
        } else {
            Err(AppError::InvalidState(format!(
                "cannot {} while {}",
                action, self.state.phase
            )))
        }
    }

    // ------------------------------------------------------------------
    // Onboarding
    // ------------------------------------------------------------------

    fn get_started(&mut self) -> Result<()> {
        self.require_phase(SessionPhase::Landing, "get started")?;
        self.set_phase(SessionPhase::Onboarding);
        Ok(())
    }

    async fn complete_onboarding(
        &mut self,
        profile: Participant,
        preferences: MatchPreferences,
    ) -> Result<()> {
        self.require_phase(SessionPhase::Onboarding, "complete onboarding")?;

        info!(
            "Onboarding {} from {}",
            profile.display_name, profile.country
        );
        self.state.user = Some(profile);
        self.state.preferences = preferences;

        match self.engine.acquire_local_media().await {
            Ok(media) => {
                self.state.local_media = Some(media);
                self.state.error = None;
                self.set_phase(SessionPhase::Lobby);
                Ok(())
            }
            Err(e) => {
                warn!("Local media unavailable during onboarding: {}", e);
                self.set_error(&e);
                Err(e)
            }
        }
    }

    fn back_to_landing(&mut self) -> Result<()> {
        if !matches!(
            self.state.phase,
            SessionPhase::Onboarding | SessionPhase::Lobby
        ) {
            return Err(AppError::InvalidState(format!(
                "cannot leave for landing while {}",
                self.state.phase
            )));
        }
        self.engine.release_local_media();
        self.state.local_media = None;
        self.state.error = None;
        self.set_phase(SessionPhase::Landing);
        Ok(())
    }

    fn update_preferences(&mut self, preferences: MatchPreferences) -> Result<()> {
        if !matches!(
            self.state.phase,
            SessionPhase::Onboarding | SessionPhase::Lobby
        ) {
            return Err(AppError::InvalidState(format!(
                "cannot change preferences while {}",
                self.state.phase
            )));
        }
        let (min_age, max_age) = preferences.age_range;
        if min_age > max_age {
            return Err(AppError::BadRequest(format!(
                "age range {}-{} is empty",
                min_age, max_age
            )));
        }
        self.state.preferences = preferences;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Search and match
    // ------------------------------------------------------------------

    async fn start_search(&mut self) -> Result<()> {
        self.require_phase(SessionPhase::Lobby, "start a search")?;
        if self.state.user.is_none() {
            return Err(AppError::InvalidState(
                "complete onboarding before searching".to_string(),
            ));
        }

        match self.engine.acquire_local_media().await {
            Ok(media) => self.state.local_media = Some(media),
            Err(e) => {
                self.set_error(&e);
                return Err(e);
            }
        }

        let status = self.transport.status();
        if status == TransportStatus::DisconnectedPermanent {
            let e = AppError::TransportUnavailable(
                "signaling relay unreachable after all retries".to_string(),
            );
            self.set_error(&e);
            return Err(e);
        }

        self.arm_subscriptions();
        self.state.error = None;
        self.set_phase(SessionPhase::Searching);

        self.state.transport = status;
        if status == TransportStatus::Connected {
            self.send_search();
        } else {
            // The request goes out once the link is up
            self.transport.connect();
        }
        Ok(())
    }

    fn arm_subscriptions(&self) {
        for kind in SUBSCRIBED_SIGNALS {
            let tx = self.signals_tx.clone();
            self.transport.subscribe(kind, move |message| {
                let _ = tx.send(message);
            });
        }
    }

    fn send_search(&self) {
        let Some(user) = &self.state.user else {
            return;
        };
        info!("Searching for a partner");
        self.transport.send(SignalingMessage::SearchPartner {
            user_id: user.id.clone(),
            preferences: self.state.preferences.clone(),
        });
    }

    fn cancel_search(&mut self) -> Result<()> {
        self.require_phase(SessionPhase::Searching, "cancel a search")?;
        self.transport.send(SignalingMessage::SearchCancelled);
        self.set_phase(SessionPhase::Lobby);
        info!("Search cancelled");
        Ok(())
    }

    async fn match_found(
        &mut self,
        partner: Participant,
        session_id: Option<SessionId>,
        role: CallRole,
    ) {
        if self.state.phase != SessionPhase::Searching {
            debug!("Ignoring match for {} while {}", partner.id, self.state.phase);
            return;
        }
        if self.state.local_media.is_none() {
            let e = AppError::MediaPermissionDenied("no local media for the call".to_string());
            self.set_error(&e);
            self.set_phase(SessionPhase::Lobby);
            return;
        }

        info!(
            "Matched with {} from {} as {:?}",
            partner.display_name, partner.country, role
        );
        self.state.clear_call();
        let greeting = ChatMessage::system(format!(
            "Connected with {} from {}",
            partner.display_name, partner.country
        ));
        self.state.messages.push(greeting);
        self.state.partner = Some(partner);
        self.state.session_id = session_id.clone();
        self.state.role = Some(role);
        self.state.call_started_at = Some(Utc::now());
        self.set_phase(SessionPhase::Negotiating);

        if let Err(e) = self.engine.create_connection(session_id).await {
            self.fail_call(e).await;
            return;
        }
        if role == CallRole::Caller {
            if let Err(e) = self.engine.create_offer().await {
                self.fail_call(e).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // In-call
    // ------------------------------------------------------------------

    async fn next_partner(&mut self) -> Result<()> {
        self.require_call("skip to the next partner")?;
        self.finish_call(CallEndReason::NextPartner, true).await;
        self.start_search().await
    }

    fn send_message(&mut self, text: &str) -> Result<()> {
        self.require_call("send a message")?;
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::BadRequest("message is empty".to_string()));
        }
        let length = text.chars().count();
        if length > self.config.max_message_length {
            return Err(AppError::BadRequest(format!(
                "message is {} characters, the limit is {}",
                length, self.config.max_message_length
            )));
        }
        let (Some(user), Some(partner)) = (&self.state.user, &self.state.partner) else {
            return Err(AppError::InvalidState("no partner to message".to_string()));
        };

        let message = ChatMessage::text(user.id.clone(), text);
        self.transport.send(SignalingMessage::Chat {
            message: message.clone(),
            partner_id: partner.id.clone(),
            session_id: self.state.session_id.clone(),
        });
        self.append_message(message);
        Ok(())
    }

    fn report_user(&mut self, reason: ReportReason) -> Result<()> {
        self.require_call("report")?;
        let Some(partner) = &self.state.partner else {
            return Err(AppError::InvalidState("no partner to report".to_string()));
        };

        info!("Reporting {}: {}", partner.id, reason);
        self.transport.send(SignalingMessage::ReportUser {
            user_id: partner.id.clone(),
            reason,
        });
        Ok(())
    }

    fn append_message(&mut self, message: ChatMessage) {
        self.state.messages.push(message.clone());
        self.events.publish(SessionEvent::Message { message });
    }

    /// Tear the call down and go back to the lobby
    async fn finish_call(&mut self, reason: CallEndReason, notify_partner: bool) {
        self.engine.teardown().await;
        if notify_partner {
            self.transport.send(SignalingMessage::CallEnded {
                session_id: self.state.session_id.clone(),
            });
        }

        if let Some(partner) = &self.state.partner {
            info!("Call with {} ended: {}", partner.id, reason);
            self.events.publish(SessionEvent::CallEnded {
                session_id: self.state.session_id.as_ref().map(|s| s.to_string()),
                partner_id: partner.id.clone(),
                duration_secs: self.state.call_duration_secs(),
                reason,
            });
        }

        self.state.clear_call();
        self.set_phase(SessionPhase::Lobby);
    }

    /// End the attempt after a negotiation failure; the profile is kept
    async fn fail_call(&mut self, e: AppError) {
        error!("Call setup failed: {}", e);
        self.finish_call(CallEndReason::NegotiationFailed, true).await;
        self.set_error(&e);
    }

    // ------------------------------------------------------------------
    // Inbound signals
    // ------------------------------------------------------------------

    async fn handle_signal(&mut self, message: SignalingMessage) {
        let kind = message.kind();

        if let SignalingMessage::MatchFound {
            partner,
            session_id,
            role,
        } = message
        {
            self.match_found(partner, session_id, role).await;
            return;
        }

        if !self.state.phase.in_call() {
            debug!("Ignoring '{}' while {}", kind, self.state.phase);
            return;
        }
        if !session_matches(self.state.session_id.as_ref(), message.session_id()) {
            warn!(
                "Dropping '{}' for session {:?}, current is {:?}",
                kind,
                message.session_id(),
                self.state.session_id
            );
            return;
        }

        match message {
            SignalingMessage::CallOffer { offer, .. } => {
                if let Err(e) = self.engine.handle_remote_offer(offer).await {
                    self.fail_call(e).await;
                }
            }
            SignalingMessage::CallAnswer { answer, .. } => {
                if let Err(e) = self.engine.handle_remote_answer(answer).await {
                    self.fail_call(e).await;
                }
            }
            SignalingMessage::Candidate { candidate, .. } => {
                let outcome = self.engine.handle_remote_candidate(candidate).await;
                debug!("Remote candidate: {:?}", outcome);
            }
            SignalingMessage::CallEnded { .. } => {
                info!("{}", AppError::RemoteAbandoned);
                self.finish_call(CallEndReason::RemoteEnded, false).await;
            }
            SignalingMessage::Chat { message, .. } => {
                let own = self.state.user.as_ref().map(|u| u.id.as_str());
                if own == Some(message.sender_id.as_str()) {
                    debug!("Ignoring echo of our own chat message");
                } else {
                    self.append_message(message);
                }
            }
            other => debug!("Ignoring inbound '{}'", other.kind()),
        }
    }

    // ------------------------------------------------------------------
    // Peer connection events
    // ------------------------------------------------------------------

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        if !self.engine.is_current(event.generation) {
            debug!("Dropping event from stale connection {}", event.generation);
            return;
        }

        match event.event {
            PeerEvent::ConnectionState(state) => {
                let quality = ConnectionQuality::from(state);
                if self.state.quality != Some(quality) {
                    self.state.quality = Some(quality);
                    self.events.publish(SessionEvent::QualityChanged { quality });
                }

                match state {
                    ConnectionState::Connected if self.state.phase == SessionPhase::Negotiating => {
                        info!("Peer connection established");
                        self.set_phase(SessionPhase::Chat);
                    }
                    ConnectionState::Failed => {
                        self.fail_call(AppError::Negotiation("peer connection failed".to_string()))
                            .await;
                    }
                    _ => {}
                }
            }
            PeerEvent::RemoteTrack(track) => {
                self.events.publish(SessionEvent::RemoteTrack {
                    track_id: track.id.clone(),
                    kind: track.kind,
                });
                self.state.remote_media.add(track);
            }
            PeerEvent::LocalCandidate(_) => {}
        }
    }

    // ------------------------------------------------------------------
    // Transport status
    // ------------------------------------------------------------------

    async fn handle_transport_status(&mut self, status: TransportStatus) {
        let previous = self.state.transport;
        if previous == status {
            return;
        }
        self.state.transport = status;

        let attempt = self.transport.state().reconnect_attempt;
        self.events
            .publish(SessionEvent::TransportStatusChanged { status, attempt });

        match status {
            TransportStatus::DisconnectedPermanent => {
                let e = AppError::TransportUnavailable(
                    "signaling relay unreachable after all retries".to_string(),
                );
                if self.state.phase.in_call() {
                    warn!("Signaling lost for good, ending the call");
                    self.finish_call(CallEndReason::TransportLost, false).await;
                    self.set_error(&e);
                } else if self.state.phase == SessionPhase::Searching {
                    warn!("Signaling lost for good, abandoning the search");
                    self.set_phase(SessionPhase::Lobby);
                    self.set_error(&e);
                }
            }
            TransportStatus::Connected if self.state.phase == SessionPhase::Searching => {
                self.send_search();
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // State plumbing
    // ------------------------------------------------------------------

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.state.phase == phase {
            return;
        }
        info!("Session phase: {} -> {}", self.state.phase, phase);
        self.state.phase = phase;
        self.events.publish(SessionEvent::PhaseChanged {
            phase,
            view: phase.view(),
        });
    }

    fn set_error(&mut self, e: &AppError) {
        let message = e.user_message();
        self.state.error = Some(message.clone());
        self.events.publish(SessionEvent::Error {
            message,
            retryable: e.is_retryable(),
        });
    }

    /// Publish the current state to readers
    fn commit(&self) {
        self.snapshot.store(Arc::new(self.state.clone()));
    }

    async fn shutdown(&mut self) {
        info!("Session shutting down");
        if self.state.phase.in_call() {
            self.finish_call(CallEndReason::Shutdown, true).await;
        } else if self.state.phase == SessionPhase::Searching {
            self.transport.send(SignalingMessage::SearchCancelled);
            self.set_phase(SessionPhase::Lobby);
        }
        self.engine.release_local_media();
        self.state.local_media = None;
        for kind in SUBSCRIBED_SIGNALS {
            self.transport.unsubscribe(kind);
        }
        self.transport.close();
    }
}
