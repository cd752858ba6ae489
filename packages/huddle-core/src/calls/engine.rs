//! Call signaling engine.
//!
//! ## Negotiation
//!
//! ```text
//!   Caller (us)                    push / backend                  Callee
//!   ───────────                    ──────────────                  ──────
//!   initialize_call ──► capture ──► POST /calls ──► join-call
//!                                                   user-joined-call ──►
//!   ◄── user-joined-call (callee)
//!   create connection (offerer)
//!   offer ─────────────────────────► call-signal ─────────────────► offer
//!                                                   create connection (answerer)
//!   answer ◄──────────────────────── call-signal ◄───────────────── answer
//!   ice ◄──────────────────────────► call-signal ◄────────────────► ice
//! ```
//!
//! Every path that ends a call converges on [`CallEngine::end_call`]:
//! explicit hang-up, remote `call-ended`, [`CallEngine::stop`] and
//! [`CallEngine::before_unload`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::media::{MediaDevices, MediaStream, TrackKind};
use super::peer::{ConnectionHealth, PeerConfig, PeerConnection, PeerConnectionFactory, PeerEvent};
use super::session::{CallKind, CallSession, CallSnapshot, CallStatus, NegotiationRole, PeerEntry};
use super::signal::{IceCandidate, SessionDescription, SignalPayload};
use crate::backend::CallBackend;
use crate::config::CallConfig;
use crate::error::{Error, ErrorClass, Result};
use crate::push::{ChannelEvent, ClientEvent, PushChannel, ServerEvent};

/// Events published by the engine
#[derive(Debug, Clone)]
pub enum CallEvent {
    StatusChanged {
        room_id: String,
        status: CallStatus,
    },
    PeerAdded {
        participant_id: String,
        role: NegotiationRole,
    },
    PeerRemoved {
        participant_id: String,
    },
    /// A participant's connection health changed
    HealthChanged {
        participant_id: String,
        health: ConnectionHealth,
    },
    /// Remote media is available via [`CallEngine::remote_stream`]
    RemoteStream {
        participant_id: String,
    },
    ScreenShareChanged {
        active: bool,
    },
    Error(Error),
}

/// Returned by [`CallEngine::before_unload`] when leaving would end a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnloadPrompt {
    pub room_id: String,
    pub message: String,
}

/// Resources pulled out of a session when it ends
struct Teardown {
    room_id: String,
    local: Option<Arc<dyn MediaStream>>,
    screen: Option<Arc<dyn MediaStream>>,
    peers: Vec<PeerEntry>,
}

/// Multi-party call signaling and peer connection lifecycle
pub struct CallEngine {
    self_id: String,
    config: CallConfig,
    backend: Arc<dyn CallBackend>,
    channel: Arc<PushChannel>,
    media: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerConnectionFactory>,
    session: Mutex<Option<CallSession>>,
    /// Candidates that arrived before their connection, when buffering is on
    early_candidates: Mutex<HashMap<String, Vec<IceCandidate>>>,
    event_tx: broadcast::Sender<CallEvent>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CallEngine {
    pub fn new(
        self_id: impl Into<String>,
        config: CallConfig,
        backend: Arc<dyn CallBackend>,
        channel: Arc<PushChannel>,
        media: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            self_id: self_id.into(),
            config,
            backend,
            channel,
            media,
            factory,
            session: Mutex::new(None),
            early_candidates: Mutex::new(HashMap::new()),
            event_tx,
            peer_tx,
            peer_rx: Mutex::new(Some(peer_rx)),
            task: Mutex::new(None),
        })
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Spawn the event loop over push frames and peer callbacks
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(Error::AlreadyStarted("call engine"));
        }
        let Some(mut peer_rx) = self.peer_rx.lock().take() else {
            return Err(Error::AlreadyStarted("call engine"));
        };
        let mut push_rx = self.channel.subscribe();
        let this = Arc::clone(self);

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = push_rx.recv() => match event {
                        Ok(ChannelEvent::Server(event)) => {
                            if let Err(e) = this.handle_server_event(event).await {
                                this.log_dropped(&e);
                            }
                        }
                        Ok(ChannelEvent::Connected) | Ok(ChannelEvent::Reconnected { .. }) => {
                            this.rejoin_room();
                        }
                        Ok(ChannelEvent::Disconnected { .. }) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Call engine lagged behind push events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    Some(event) = peer_rx.recv() => {
                        this.handle_peer_event(event).await;
                    }
                }
            }
        }));
        Ok(())
    }

    /// End any call and stop the event loop
    pub async fn stop(&self) {
        if let Err(e) = self.end_call().await {
            tracing::warn!(error = %e, "Error ending call during stop");
        }
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Status of the current or last session; `None` when idle
    pub fn status(&self) -> Option<CallStatus> {
        self.session.lock().as_ref().map(|s| s.status)
    }

    pub fn is_active(&self) -> bool {
        self.status().map_or(false, |s| s.is_active())
    }

    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.session.lock().as_ref().map(CallSession::snapshot)
    }

    pub fn local_stream(&self) -> Option<Arc<dyn MediaStream>> {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.local_stream.clone())
    }

    pub fn remote_stream(&self, participant_id: &str) -> Option<Arc<dyn MediaStream>> {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.peers.get(participant_id))
            .and_then(|entry| entry.remote_stream.clone())
    }

    // ========================================================================
    // STARTING A CALL
    // ========================================================================

    /// Start a call in `conversation_id`. Returns the room id.
    ///
    /// Media is acquired first; if that fails nothing else happens.
    pub async fn initialize_call(&self, kind: CallKind, conversation_id: &str) -> Result<String> {
        if self.is_active() {
            return Err(Error::CallAlreadyActive);
        }

        let stream = self.acquire_media(kind).await?;

        let record = match self.backend.initiate_call(conversation_id, kind).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "Backend refused to start call");
                stream.stop_all();
                self.publish(CallEvent::Error(e.clone()));
                return Err(e);
            }
        };

        let session = CallSession::new(record.room_id.clone(), conversation_id, kind, Some(stream));
        if let Err(e) = self.install_session(session) {
            if let Err(end_err) = self.backend.end_call(&record.room_id).await {
                tracing::debug!(room_id = %record.room_id, error = %end_err, "Could not close orphaned room");
            }
            return Err(e);
        }

        tracing::info!(room_id = %record.room_id, conversation_id, ?kind, "Call initiated");
        self.join_room(&record.room_id).await;
        Ok(record.room_id)
    }

    /// Join an existing call room as a callee
    pub async fn join_call(&self, room_id: &str, conversation_id: &str, kind: CallKind) -> Result<()> {
        if self.is_active() {
            return Err(Error::CallAlreadyActive);
        }

        let stream = self.acquire_media(kind).await?;
        self.install_session(CallSession::new(room_id, conversation_id, kind, Some(stream)))?;

        tracing::info!(room_id, conversation_id, ?kind, "Joining call");
        self.join_room(room_id).await;
        Ok(())
    }

    async fn acquire_media(&self, kind: CallKind) -> Result<Arc<dyn MediaStream>> {
        match self.media.get_user_media(kind.constraints()).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                tracing::warn!(?kind, error = %e, "Media capture failed");
                self.publish(CallEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    fn install_session(&self, session: CallSession) -> Result<()> {
        let room_id = session.room_id.clone();
        {
            let mut current = self.session.lock();
            if current.as_ref().map_or(false, |s| s.status.is_active()) {
                if let Some(stream) = &session.local_stream {
                    stream.stop_all();
                }
                return Err(Error::CallAlreadyActive);
            }
            *current = Some(session);
        }
        self.early_candidates.lock().clear();
        self.publish(CallEvent::StatusChanged {
            room_id,
            status: CallStatus::Initiated,
        });
        Ok(())
    }

    /// Join the signaling room, retrying once if the channel is down
    async fn join_room(&self, room_id: &str) {
        let event = ClientEvent::JoinCall {
            room_id: room_id.to_string(),
        };
        if self.channel.emit(event.clone()).is_ok() {
            return;
        }

        tracing::debug!(room_id, "Push channel down, retrying join");
        tokio::time::sleep(self.config.join_retry_delay()).await;
        if let Err(e) = self.channel.emit(event) {
            tracing::warn!(room_id, error = %e, "Could not join call room");
        }
    }

    fn rejoin_room(&self) {
        let Some(room_id) = self.active_room() else {
            return;
        };
        if let Err(e) = self.channel.emit(ClientEvent::JoinCall {
            room_id: room_id.clone(),
        }) {
            tracing::debug!(%room_id, error = %e, "Rejoin after reconnect failed");
        }
    }

    fn active_room(&self) -> Option<String> {
        self.session
            .lock()
            .as_ref()
            .filter(|s| s.status.is_active())
            .map(|s| s.room_id.clone())
    }

    // ========================================================================
    // INBOUND EVENTS
    // ========================================================================

    /// Apply one push frame
    pub async fn handle_server_event(&self, event: ServerEvent) -> Result<()> {
        let room = self.active_room();
        let in_room = |room_id: &str| room.as_deref() == Some(room_id);

        match event {
            ServerEvent::UserJoinedCall { room_id, user_id } => {
                if !in_room(&room_id) || user_id == self.self_id {
                    return Ok(());
                }
                self.handle_participant_joined(&user_id).await
            }
            ServerEvent::UserLeftCall { room_id, user_id } => {
                if in_room(&room_id) {
                    self.handle_participant_left(&user_id);
                }
                Ok(())
            }
            ServerEvent::CallSignal {
                room_id,
                from,
                signal,
            } => {
                if !in_room(&room_id) {
                    return Err(Error::UnexpectedSignal(format!(
                        "{} for room {} from {}",
                        signal.kind(),
                        room_id,
                        from
                    )));
                }
                self.handle_signal(&from, signal).await
            }
            ServerEvent::CallEnded { room_id } => {
                if in_room(&room_id) {
                    tracing::info!(%room_id, "Call ended remotely");
                    self.end_call().await?;
                }
                Ok(())
            }
            ServerEvent::NewMessage(_) => Ok(()),
        }
    }

    /// A participant joined: offer to them if we have local media
    pub async fn handle_participant_joined(&self, participant_id: &str) -> Result<()> {
        let (room_id, local) = {
            let session = self.session.lock();
            let Some(session) = session.as_ref().filter(|s| s.status.is_active()) else {
                return Err(Error::NoActiveCall);
            };
            if session.peers.contains_key(participant_id) {
                tracing::debug!(participant_id, "Already connected to participant");
                return Ok(());
            }
            let Some(local) = session.local_stream.clone() else {
                tracing::debug!(participant_id, "No local capture yet, waiting for their offer");
                return Ok(());
            };
            (session.room_id.clone(), local)
        };

        let connection = self
            .open_connection(participant_id, &local, NegotiationRole::Offerer)
            .await?;

        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        self.send_signal(&room_id, participant_id, offer.into()).await;
        Ok(())
    }

    /// A participant left: drop their connection
    pub fn handle_participant_left(&self, participant_id: &str) {
        let entry = self
            .session
            .lock()
            .as_mut()
            .and_then(|s| s.peers.remove(participant_id));
        self.early_candidates.lock().remove(participant_id);

        if let Some(entry) = entry {
            entry.connection.close();
            tracing::info!(participant_id, "Participant left call");
            self.publish(CallEvent::PeerRemoved {
                participant_id: participant_id.to_string(),
            });
        }
    }

    /// Apply a signaling payload from `from`
    pub async fn handle_signal(&self, from: &str, signal: SignalPayload) -> Result<()> {
        tracing::trace!(from, kind = signal.kind(), "Inbound call signal");
        match signal {
            SignalPayload::Offer { sdp } => self.handle_offer(from, sdp).await,
            SignalPayload::Answer { sdp } => {
                let connection = self
                    .connection_for(from)
                    .ok_or_else(|| Error::UnknownPeer(from.to_string()))?;
                connection
                    .set_remote_description(SessionDescription::answer(sdp))
                    .await?;
                self.flush_early_candidates(from, &connection).await;
                Ok(())
            }
            SignalPayload::IceCandidate(candidate) => match self.connection_for(from) {
                Some(connection) => connection.add_ice_candidate(candidate).await,
                None if self.config.buffer_early_candidates => {
                    tracing::debug!(from, "Buffering early ICE candidate");
                    self.early_candidates
                        .lock()
                        .entry(from.to_string())
                        .or_default()
                        .push(candidate);
                    Ok(())
                }
                None => Err(Error::UnknownPeer(from.to_string())),
            },
        }
    }

    async fn handle_offer(&self, from: &str, sdp: String) -> Result<()> {
        let (room_id, existing) = {
            let session = self.session.lock();
            let Some(session) = session.as_ref().filter(|s| s.status.is_active()) else {
                return Err(Error::NoActiveCall);
            };
            (
                session.room_id.clone(),
                session
                    .peers
                    .get(from)
                    .map(|entry| Arc::clone(&entry.connection)),
            )
        };

        let connection = match existing {
            Some(connection) => connection,
            None => {
                let local = self.ensure_local_stream().await?;
                self.open_connection(from, &local, NegotiationRole::Answerer)
                    .await?
            }
        };

        connection
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.flush_early_candidates(from, &connection).await;

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        self.send_signal(&room_id, from, answer.into()).await;
        Ok(())
    }

    /// Local capture for the session, acquiring it if the session has none
    async fn ensure_local_stream(&self) -> Result<Arc<dyn MediaStream>> {
        let (existing, kind) = {
            let session = self.session.lock();
            let session = session.as_ref().ok_or(Error::NoActiveCall)?;
            (session.local_stream.clone(), session.kind)
        };
        if let Some(stream) = existing {
            return Ok(stream);
        }

        let stream = self.acquire_media(kind).await?;
        let mut session = self.session.lock();
        match session.as_mut().filter(|s| s.status.is_active()) {
            None => {
                stream.stop_all();
                Err(Error::NoActiveCall)
            }
            Some(session) => match &session.local_stream {
                Some(raced) => {
                    stream.stop_all();
                    Ok(Arc::clone(raced))
                }
                None => {
                    session.local_stream = Some(Arc::clone(&stream));
                    Ok(stream)
                }
            },
        }
    }

    /// Create a connection, attach local tracks, and register the peer entry
    async fn open_connection(
        &self,
        participant_id: &str,
        local: &Arc<dyn MediaStream>,
        role: NegotiationRole,
    ) -> Result<Arc<dyn PeerConnection>> {
        let peer_config = PeerConfig {
            ice_servers: self.config.ice_servers.clone(),
        };
        let connection = self
            .factory
            .create(participant_id, &peer_config, self.peer_tx.clone())?;

        for track in local.tracks() {
            if let Err(e) = connection.add_track(track, local) {
                connection.close();
                return Err(e);
            }
        }

        let screen_track = {
            let mut session = self.session.lock();
            let Some(session) = session.as_mut().filter(|s| s.status.is_active()) else {
                connection.close();
                return Err(Error::NoActiveCall);
            };
            if session.peers.contains_key(participant_id) {
                connection.close();
                return Err(Error::UnexpectedSignal(format!(
                    "connection to {} already exists",
                    participant_id
                )));
            }
            session.peers.insert(
                participant_id.to_string(),
                PeerEntry {
                    participant_id: participant_id.to_string(),
                    connection: Arc::clone(&connection),
                    remote_stream: None,
                    role,
                    health: None,
                },
            );
            session
                .screen_stream
                .as_ref()
                .and_then(|s| s.video_tracks().into_iter().next())
        };

        // Late joiners see the shared screen, not the camera
        if let Some(track) = screen_track {
            if let Err(e) = connection.replace_video_track(Some(track)).await {
                tracing::warn!(participant_id, error = %e, "Could not attach screen track");
            }
        }

        tracing::info!(participant_id, ?role, "Peer connection created");
        self.publish(CallEvent::PeerAdded {
            participant_id: participant_id.to_string(),
            role,
        });
        Ok(connection)
    }

    fn connection_for(&self, participant_id: &str) -> Option<Arc<dyn PeerConnection>> {
        self.session
            .lock()
            .as_ref()
            .filter(|s| s.status.is_active())
            .and_then(|s| s.peers.get(participant_id))
            .map(|entry| Arc::clone(&entry.connection))
    }

    async fn flush_early_candidates(&self, participant_id: &str, connection: &Arc<dyn PeerConnection>) {
        let buffered = self.early_candidates.lock().remove(participant_id);
        for candidate in buffered.into_iter().flatten() {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                tracing::debug!(participant_id, error = %e, "Buffered candidate rejected");
            }
        }
    }

    async fn send_signal(&self, room_id: &str, to: &str, payload: SignalPayload) {
        if let Err(e) = self.backend.send_signal(room_id, to, &payload).await {
            tracing::warn!(room_id, to, kind = payload.kind(), error = %e, "Failed to send call signal");
        }
    }

    /// Apply one callback from a peer connection
    pub async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate {
                participant_id,
                candidate,
            } => {
                if let Some(room_id) = self.active_room() {
                    self.send_signal(&room_id, &participant_id, SignalPayload::IceCandidate(candidate))
                        .await;
                }
            }
            PeerEvent::StateChanged {
                participant_id,
                state,
            } => {
                let Some(health) = ConnectionHealth::from_state(state) else {
                    return;
                };
                let (room_id, status_change) = {
                    let mut session = self.session.lock();
                    let Some(session) = session.as_mut().filter(|s| s.status.is_active()) else {
                        return;
                    };
                    let Some(entry) = session.peers.get_mut(&participant_id) else {
                        return;
                    };
                    entry.health = Some(health);
                    session.connection_status = Some(health);

                    let status = match health {
                        ConnectionHealth::Connected => CallStatus::Connected,
                        ConnectionHealth::Reconnecting | ConnectionHealth::Disconnected => {
                            CallStatus::Reconnecting
                        }
                    };
                    let changed = session.status != status;
                    session.status = status;
                    (session.room_id.clone(), changed.then_some(status))
                };

                tracing::debug!(%participant_id, ?state, ?health, "Peer connection state changed");
                self.publish(CallEvent::HealthChanged {
                    participant_id,
                    health,
                });
                if let Some(status) = status_change {
                    self.publish(CallEvent::StatusChanged {
                        room_id: room_id.clone(),
                        status,
                    });
                }
                if let Err(e) = self.backend.update_connection_status(&room_id, health).await {
                    tracing::debug!(%room_id, error = %e, "Failed to report connection status");
                }
            }
            PeerEvent::RemoteStream {
                participant_id,
                stream,
            } => {
                let attached = {
                    let mut session = self.session.lock();
                    match session
                        .as_mut()
                        .and_then(|s| s.peers.get_mut(&participant_id))
                    {
                        Some(entry) => {
                            entry.remote_stream = Some(stream);
                            true
                        }
                        None => false,
                    }
                };
                if attached {
                    self.publish(CallEvent::RemoteStream { participant_id });
                }
            }
        }
    }

    // ========================================================================
    // LOCAL CONTROLS
    // ========================================================================

    /// Mute/unmute the microphone. Returns the new enabled state.
    pub fn toggle_audio(&self) -> Result<bool> {
        self.toggle_tracks(TrackKind::Audio)
    }

    /// Turn the camera on/off. Returns the new enabled state.
    pub fn toggle_video(&self) -> Result<bool> {
        self.toggle_tracks(TrackKind::Video)
    }

    fn toggle_tracks(&self, kind: TrackKind) -> Result<bool> {
        let stream = {
            let session = self.session.lock();
            let session = session
                .as_ref()
                .filter(|s| s.status.is_active())
                .ok_or(Error::NoActiveCall)?;
            session.local_stream.clone()
        };
        let tracks: Vec<_> = stream
            .map(|s| s.tracks())
            .unwrap_or_default()
            .into_iter()
            .filter(|t| t.kind() == kind)
            .collect();
        if tracks.is_empty() {
            return Ok(false);
        }

        let enabled = !tracks.iter().any(|t| t.is_enabled());
        for track in &tracks {
            track.set_enabled(enabled);
        }
        tracing::debug!(?kind, enabled, "Toggled local tracks");
        Ok(enabled)
    }

    /// Start or stop sharing the screen. Returns whether sharing is now on.
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        let sharing = {
            let session = self.session.lock();
            let session = session
                .as_ref()
                .filter(|s| s.status.is_active())
                .ok_or(Error::NoActiveCall)?;
            session.screen_stream.is_some()
        };
        if sharing {
            self.stop_screen_share().await;
            return Ok(false);
        }

        let screen = match self.media.get_display_media().await {
            Ok(screen) => screen,
            Err(e) => {
                tracing::warn!(error = %e, "Screen capture failed");
                self.publish(CallEvent::Error(e.clone()));
                return Err(e);
            }
        };
        let Some(track) = screen.video_tracks().into_iter().next() else {
            screen.stop_all();
            return Err(Error::MediaUnavailable("screen capture has no video track".into()));
        };

        let (room_id, connections) = {
            let mut session = self.session.lock();
            let Some(session) = session.as_mut().filter(|s| s.status.is_active()) else {
                screen.stop_all();
                return Err(Error::NoActiveCall);
            };
            if session.screen_stream.is_some() {
                screen.stop_all();
                return Ok(true);
            }
            session.screen_stream = Some(Arc::clone(&screen));
            (session.room_id.clone(), session.connections())
        };

        for connection in connections {
            if let Err(e) = connection.replace_video_track(Some(Arc::clone(&track))).await {
                tracing::warn!(error = %e, "Could not substitute screen track");
            }
        }
        tracing::info!(%room_id, "Screen share started");
        self.publish(CallEvent::ScreenShareChanged { active: true });

        if let Err(e) = self.backend.start_screen_share(&room_id).await {
            tracing::debug!(%room_id, error = %e, "Failed to report screen share start");
        }
        Ok(true)
    }

    /// The platform reported that sharing ended (e.g. the browser's stop button)
    pub async fn handle_screen_share_ended(&self) {
        self.stop_screen_share().await;
    }

    async fn stop_screen_share(&self) {
        let (room_id, screen, camera, connections) = {
            let mut session = self.session.lock();
            let Some(session) = session.as_mut() else {
                return;
            };
            let Some(screen) = session.screen_stream.take() else {
                return;
            };
            let camera = session
                .local_stream
                .as_ref()
                .and_then(|s| s.video_tracks().into_iter().next());
            (session.room_id.clone(), screen, camera, session.connections())
        };

        for connection in connections {
            if let Err(e) = connection.replace_video_track(camera.clone()).await {
                tracing::warn!(error = %e, "Could not restore camera track");
            }
        }
        screen.stop_all();
        tracing::info!(%room_id, "Screen share stopped");
        self.publish(CallEvent::ScreenShareChanged { active: false });

        if let Err(e) = self.backend.end_screen_share(&room_id).await {
            tracing::debug!(%room_id, error = %e, "Failed to report screen share end");
        }
    }

    // ========================================================================
    // ENDING A CALL
    // ========================================================================

    /// End the call. Safe to call any number of times.
    pub async fn end_call(&self) -> Result<()> {
        let Some(teardown) = self.begin_teardown() else {
            return Ok(());
        };
        let room_id = teardown.room_id.clone();

        if let Err(e) = self.backend.end_call(&room_id).await {
            tracing::warn!(%room_id, error = %e, "Backend end-call failed");
        }

        self.release(teardown);

        for event in [
            ClientEvent::LeaveCall {
                room_id: room_id.clone(),
            },
            ClientEvent::EndCall {
                room_id: room_id.clone(),
            },
        ] {
            if let Err(e) = self.channel.emit(event) {
                tracing::debug!(%room_id, error = %e, "Could not announce call end");
            }
        }
        tracing::info!(%room_id, "Call ended");
        Ok(())
    }

    /// Window is closing: tear down synchronously and ask the user to confirm.
    pub fn before_unload(&self) -> Option<UnloadPrompt> {
        let teardown = self.begin_teardown()?;
        let room_id = teardown.room_id.clone();

        if let Err(e) = self.channel.emit(ClientEvent::EndCall {
            room_id: room_id.clone(),
        }) {
            tracing::debug!(%room_id, error = %e, "Could not announce call end on unload");
        }
        self.release(teardown);

        Some(UnloadPrompt {
            room_id,
            message: "You are in a call. Leaving this page will end it.".to_string(),
        })
    }

    /// Mark the session ended and take its resources. `None` if nothing is active.
    fn begin_teardown(&self) -> Option<Teardown> {
        let teardown = {
            let mut session = self.session.lock();
            let session = session.as_mut().filter(|s| s.status.is_active())?;
            session.status = CallStatus::Ended;
            Teardown {
                room_id: session.room_id.clone(),
                local: session.local_stream.take(),
                screen: session.screen_stream.take(),
                peers: session.peers.drain().map(|(_, entry)| entry).collect(),
            }
        };
        self.early_candidates.lock().clear();
        self.publish(CallEvent::StatusChanged {
            room_id: teardown.room_id.clone(),
            status: CallStatus::Ended,
        });
        Some(teardown)
    }

    fn release(&self, teardown: Teardown) {
        if let Some(local) = teardown.local {
            local.stop_all();
        }
        if let Some(screen) = teardown.screen {
            screen.stop_all();
        }
        for entry in teardown.peers {
            entry.connection.close();
            self.publish(CallEvent::PeerRemoved {
                participant_id: entry.participant_id,
            });
        }
    }

    fn publish(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    fn log_dropped(&self, error: &Error) {
        match error.class() {
            ErrorClass::SignalingProtocol => {
                tracing::debug!(error = %error, "Dropped call event");
            }
            _ => {
                tracing::warn!(error = %error, "Failed to handle call event");
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::MediaTrack;
    use crate::calls::PeerState;
    use crate::config::PushConfig;
    use crate::testing::{MockBackend, MockMedia, MockPeerFactory, MockTransport};
    use std::time::Duration;

    struct Harness {
        engine: Arc<CallEngine>,
        backend: Arc<MockBackend>,
        media: Arc<MockMedia>,
        factory: Arc<MockPeerFactory>,
        transport: Arc<MockTransport>,
        channel: Arc<PushChannel>,
    }

    async fn harness(config: CallConfig) -> Harness {
        let backend = MockBackend::new("me");
        let media = MockMedia::new();
        let factory = MockPeerFactory::new();
        let transport = MockTransport::new();
        let channel = PushChannel::new("me", PushConfig::default(), transport.clone());
        channel.start().unwrap();
        let mut status = channel.status_watch();
        status.wait_for(|s| s.is_connected()).await.unwrap();

        let engine = CallEngine::new(
            "me",
            config,
            backend.clone(),
            channel.clone(),
            media.clone(),
            factory.clone(),
        );
        Harness {
            engine,
            backend,
            media,
            factory,
            transport,
            channel,
        }
    }

    fn joined(room_id: &str, user_id: &str) -> ServerEvent {
        ServerEvent::UserJoinedCall {
            room_id: room_id.into(),
            user_id: user_id.into(),
        }
    }

    fn signal(room_id: &str, from: &str, signal: SignalPayload) -> ServerEvent {
        ServerEvent::CallSignal {
            room_id: room_id.into(),
            from: from.into(),
            signal,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_call_participant_join_creates_one_offer() {
        let h = harness(CallConfig::default()).await;
        let room = h.engine.initialize_call(CallKind::Audio, "c1").await.unwrap();
        assert_eq!(h.engine.status(), Some(CallStatus::Initiated));
        assert!(h
            .transport
            .sent()
            .contains(&ClientEvent::JoinCall { room_id: room.clone() }));

        h.engine.handle_server_event(joined(&room, "u2")).await.unwrap();
        // Duplicate join does not open a second connection
        h.engine.handle_server_event(joined(&room, "u2")).await.unwrap();

        assert_eq!(h.factory.created().len(), 1);
        let snapshot = h.engine.snapshot().unwrap();
        assert_eq!(snapshot.peers.len(), 1);
        assert_eq!(snapshot.peers[0].role, NegotiationRole::Offerer);

        let offers: Vec<_> = h
            .backend
            .signals()
            .into_iter()
            .filter(|(_, to, p)| to == "u2" && matches!(p, SignalPayload::Offer { .. }))
            .collect();
        assert_eq!(offers.len(), 1);

        // Audio call: only an audio track was attached
        assert_eq!(h.factory.created()[0].track_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_join_event_is_ignored() {
        let h = harness(CallConfig::default()).await;
        let room = h.engine.initialize_call(CallKind::Video, "c1").await.unwrap();
        h.engine.handle_server_event(joined(&room, "me")).await.unwrap();
        assert!(h.factory.created().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_creates_no_session() {
        let h = harness(CallConfig::default()).await;
        h.media.fail_with(Error::PermissionDenied("camera".into()));
        let mut events = h.engine.subscribe();

        let result = h.engine.initialize_call(CallKind::Video, "c1").await;
        assert!(matches!(result, Err(Error::PermissionDenied(_))));
        assert!(h.engine.status().is_none());
        assert_eq!(h.backend.initiate_count(), 0);
        assert!(matches!(events.try_recv(), Ok(CallEvent::Error(Error::PermissionDenied(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_refusal_releases_media() {
        let h = harness(CallConfig::default()).await;
        h.backend.fail_calls(true);

        assert!(h.engine.initialize_call(CallKind::Video, "c1").await.is_err());
        assert!(h.engine.status().is_none());
        assert_eq!(h.media.live_track_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_is_rejected_while_active() {
        let h = harness(CallConfig::default()).await;
        h.engine.initialize_call(CallKind::Audio, "c1").await.unwrap();
        assert!(matches!(
            h.engine.initialize_call(CallKind::Audio, "c2").await,
            Err(Error::CallAlreadyActive)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_retries_once_when_channel_is_down() {
        let h = harness(CallConfig::default()).await;
        h.channel.close();

        let started = tokio::time::Instant::now();
        h.engine.join_call("r9", "c1", CallKind::Audio).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(h.engine.status(), Some(CallStatus::Initiated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_offer_creates_answerer() {
        let h = harness(CallConfig::default()).await;
        h.engine.join_call("r1", "c1", CallKind::Video).await.unwrap();

        h.engine
            .handle_server_event(signal("r1", "u3", SignalPayload::Offer { sdp: "remote-offer".into() }))
            .await
            .unwrap();

        let peers = h.factory.created();
        assert_eq!(peers.len(), 1);
        assert_eq!(
            peers[0].remote_description(),
            Some(SessionDescription::offer("remote-offer"))
        );
        assert_eq!(h.engine.snapshot().unwrap().peers[0].role, NegotiationRole::Answerer);
        assert!(h
            .backend
            .signals()
            .iter()
            .any(|(room, to, p)| room == "r1" && to == "u3" && matches!(p, SignalPayload::Answer { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_and_candidates_apply_to_existing_connection() {
        let h = harness(CallConfig::default()).await;
        let room = h.engine.initialize_call(CallKind::Audio, "c1").await.unwrap();
        h.engine.handle_server_event(joined(&room, "u2")).await.unwrap();

        h.engine
            .handle_server_event(signal(&room, "u2", SignalPayload::Answer { sdp: "ans".into() }))
            .await
            .unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        h.engine
            .handle_server_event(signal(&room, "u2", SignalPayload::IceCandidate(candidate.clone())))
            .await
            .unwrap();

        let peer = &h.factory.created()[0];
        assert_eq!(peer.remote_description(), Some(SessionDescription::answer("ans")));
        assert_eq!(peer.candidates(), vec![candidate]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_sender_candidate_is_dropped() {
        let h = harness(CallConfig::default()).await;
        let room = h.engine.initialize_call(CallKind::Audio, "c1").await.unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:early".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };

        let result = h
            .engine
            .handle_server_event(signal(&room, "u5", SignalPayload::IceCandidate(candidate)))
            .await;
        assert!(matches!(result, Err(Error::UnknownPeer(_))));
        assert!(h.factory.created().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_candidates_are_buffered_when_enabled() {
        let h = harness(CallConfig {
            buffer_early_candidates: true,
            ..Default::default()
        })
        .await;
        h.engine.join_call("r1", "c1", CallKind::Audio).await.unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:early".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };

        h.engine
            .handle_server_event(signal("r1", "u5", SignalPayload::IceCandidate(candidate.clone())))
            .await
            .unwrap();
        h.engine
            .handle_server_event(signal("r1", "u5", SignalPayload::Offer { sdp: "o".into() }))
            .await
            .unwrap();

        assert_eq!(h.factory.created()[0].candidates(), vec![candidate]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_for_other_room_is_rejected() {
        let h = harness(CallConfig::default()).await;
        h.engine.join_call("r1", "c1", CallKind::Audio).await.unwrap();
        let result = h
            .engine
            .handle_server_event(signal("r2", "u2", SignalPayload::Offer { sdp: "o".into() }))
            .await;
        assert!(matches!(result, Err(Error::UnexpectedSignal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_flip_enabled_state() {
        let h = harness(CallConfig::default()).await;
        h.engine.initialize_call(CallKind::Video, "c1").await.unwrap();

        assert!(!h.engine.toggle_audio().unwrap());
        assert!(!h.engine.snapshot().unwrap().audio_enabled);
        assert!(h.engine.toggle_audio().unwrap());
        assert!(!h.engine.toggle_video().unwrap());
        assert!(!h.engine.snapshot().unwrap().video_enabled);
        // No renegotiation
        assert!(h.backend.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_without_call_fails() {
        let h = harness(CallConfig::default()).await;
        assert!(matches!(h.engine.toggle_audio(), Err(Error::NoActiveCall)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_share_round_trip_restores_camera() {
        let h = harness(CallConfig::default()).await;
        let room = h.engine.initialize_call(CallKind::Video, "c1").await.unwrap();
        h.engine.handle_server_event(joined(&room, "u2")).await.unwrap();
        h.engine.handle_server_event(joined(&room, "u3")).await.unwrap();
        let peers = h.factory.created();
        assert_eq!(peers.len(), 2);
        let camera = peers[0].video_track().unwrap();
        assert_eq!(peers[1].video_track(), Some(camera.clone()));

        assert!(h.engine.toggle_screen_share().await.unwrap());
        let shared = peers[0].video_track().unwrap();
        assert_ne!(shared, camera);
        assert_eq!(peers[1].video_track(), Some(shared.clone()));
        assert!(h.engine.snapshot().unwrap().screen_sharing);

        assert!(!h.engine.toggle_screen_share().await.unwrap());
        for peer in &peers {
            assert_eq!(peer.video_track(), Some(camera.clone()));
        }
        assert!(!h.engine.snapshot().unwrap().screen_sharing);
        assert!(!h.media.track(&shared).unwrap().is_live());
        assert_eq!(h.backend.screen_share_calls(), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_platform_share_end_reverts() {
        let h = harness(CallConfig::default()).await;
        let room = h.engine.initialize_call(CallKind::Video, "c1").await.unwrap();
        h.engine.handle_server_event(joined(&room, "u2")).await.unwrap();
        let peer = h.factory.created()[0].clone();
        let camera = peer.video_track();

        h.engine.toggle_screen_share().await.unwrap();
        h.engine.handle_screen_share_ended().await;
        assert_eq!(peer.video_track(), camera);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_twice_releases_everything() {
        let h = harness(CallConfig::default()).await;
        let room = h.engine.initialize_call(CallKind::Video, "c1").await.unwrap();
        h.engine.handle_server_event(joined(&room, "u2")).await.unwrap();
        h.engine.handle_server_event(joined(&room, "u3")).await.unwrap();
        h.engine.toggle_screen_share().await.unwrap();

        h.engine.end_call().await.unwrap();
        h.engine.end_call().await.unwrap();

        assert_eq!(h.engine.status(), Some(CallStatus::Ended));
        assert!(h.engine.snapshot().unwrap().peers.is_empty());
        assert_eq!(h.media.live_track_count(), 0);
        assert!(h.factory.created().iter().all(|p| p.is_closed()));
        assert_eq!(h.backend.end_count(), 1);
        assert!(h
            .transport
            .sent()
            .contains(&ClientEvent::EndCall { room_id: room }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_end_converges() {
        let h = harness(CallConfig::default()).await;
        let room = h.engine.initialize_call(CallKind::Audio, "c1").await.unwrap();
        h.engine.handle_server_event(joined(&room, "u2")).await.unwrap();

        h.engine
            .handle_server_event(ServerEvent::CallEnded { room_id: room })
            .await
            .unwrap();
        assert_eq!(h.engine.status(), Some(CallStatus::Ended));
        assert_eq!(h.media.live_track_count(), 0);

        // A new call is allowed after the old one ended
        assert!(h.engine.initialize_call(CallKind::Audio, "c1").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_participant_left_closes_entry() {
        let h = harness(CallConfig::default()).await;
        let room = h.engine.initialize_call(CallKind::Audio, "c1").await.unwrap();
        h.engine.handle_server_event(joined(&room, "u2")).await.unwrap();

        h.engine
            .handle_server_event(ServerEvent::UserLeftCall {
                room_id: room,
                user_id: "u2".into(),
            })
            .await
            .unwrap();
        assert!(h.factory.created()[0].is_closed());
        assert!(h.engine.snapshot().unwrap().peers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_is_last_writer_and_per_peer() {
        let h = harness(CallConfig::default()).await;
        let room = h.engine.initialize_call(CallKind::Audio, "c1").await.unwrap();
        h.engine.handle_server_event(joined(&room, "u2")).await.unwrap();
        h.engine.handle_server_event(joined(&room, "u3")).await.unwrap();

        let state = |participant: &str, state| PeerEvent::StateChanged {
            participant_id: participant.into(),
            state,
        };
        h.engine.handle_peer_event(state("u2", PeerState::Connected)).await;
        assert_eq!(h.engine.status(), Some(CallStatus::Connected));

        h.engine.handle_peer_event(state("u3", PeerState::Failed)).await;
        let snapshot = h.engine.snapshot().unwrap();
        assert_eq!(snapshot.status, CallStatus::Reconnecting);
        assert_eq!(snapshot.connection_status, Some(ConnectionHealth::Disconnected));
        assert_eq!(snapshot.peers[0].health, Some(ConnectionHealth::Connected));
        assert_eq!(snapshot.peers[1].health, Some(ConnectionHealth::Disconnected));

        // Failure does not end the session
        assert!(h.engine.is_active());
        assert_eq!(
            h.backend.status_updates(),
            vec![ConnectionHealth::Connected, ConnectionHealth::Disconnected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_candidates_are_relayed() {
        let h = harness(CallConfig::default()).await;
        let room = h.engine.initialize_call(CallKind::Audio, "c1").await.unwrap();
        h.engine.handle_server_event(joined(&room, "u2")).await.unwrap();

        let candidate = IceCandidate {
            candidate: "candidate:local".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        h.engine
            .handle_peer_event(PeerEvent::IceCandidate {
                participant_id: "u2".into(),
                candidate: candidate.clone(),
            })
            .await;
        assert!(h
            .backend
            .signals()
            .contains(&(room, "u2".to_string(), SignalPayload::IceCandidate(candidate))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_before_unload_prompts_and_tears_down() {
        let h = harness(CallConfig::default()).await;
        assert!(h.engine.before_unload().is_none());

        let room = h.engine.initialize_call(CallKind::Video, "c1").await.unwrap();
        h.engine.handle_server_event(joined(&room, "u2")).await.unwrap();

        let prompt = h.engine.before_unload().unwrap();
        assert_eq!(prompt.room_id, room);
        assert_eq!(h.media.live_track_count(), 0);
        assert!(h.factory.created()[0].is_closed());
        assert!(h.transport.sent().contains(&ClientEvent::EndCall { room_id: room }));
        assert!(h.engine.before_unload().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_handles_pushed_frames() {
        let h = harness(CallConfig::default()).await;
        h.engine.start().unwrap();
        assert!(h.engine.start().is_err());
        let room = h.engine.initialize_call(CallKind::Audio, "c1").await.unwrap();
        let mut events = h.engine.subscribe();

        h.transport.push(crate::push::LinkEvent::Frame(joined(&room, "u2")));
        loop {
            match events.recv().await.unwrap() {
                CallEvent::PeerAdded { participant_id, .. } => {
                    assert_eq!(participant_id, "u2");
                    break;
                }
                _ => continue,
            }
        }

        h.engine.stop().await;
        assert_eq!(h.engine.status(), Some(CallStatus::Ended));
    }
}
