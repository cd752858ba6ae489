//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};

use crate::backend::{
    CallBackend, CallRecord, MessageBackend, MessagePage, MessageRecord, PaginationRecord,
    SenderField, TimestampField,
};
use crate::calls::{
    CallKind, ConnectionHealth, IceCandidate, MediaConstraints, MediaDevices, MediaStream,
    MediaTrack, PeerConfig, PeerConnection, PeerConnectionFactory, PeerEvent, PeerState,
    SessionDescription, SignalPayload, TrackKind,
};
use crate::error::{Error, Result};
use crate::messaging::MessageKind;
use crate::push::{ClientEvent, LinkEvent, PushLink, PushTransport};

/// Base timestamp for seeded history (2024-05-01T12:30:00Z)
const SEED_EPOCH_MS: i64 = 1_714_566_600_000;

/// Build a message record
pub(crate) fn record(id: &str, conversation_id: &str, sender: &str, content: &str, at_ms: i64) -> MessageRecord {
    MessageRecord {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender: SenderField::Id(sender.to_string()),
        content: content.to_string(),
        kind: MessageKind::Text,
        created_at: TimestampField::Millis(at_ms),
        read_by: Vec::new(),
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Push transport whose links are plain channels
#[derive(Default)]
pub(crate) struct MockTransport {
    connects: AtomicUsize,
    failures: AtomicUsize,
    failure: Mutex<Option<Error>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    outbound: Mutex<Vec<mpsc::UnboundedReceiver<ClientEvent>>>,
    sent: Mutex<Vec<ClientEvent>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Fail the next `n` connection attempts
    pub fn fail_next(&self, n: usize) {
        self.fail_with(n, Error::ConnectionFailed("refused".into()));
    }

    /// Fail the next `n` connection attempts with `error`
    pub fn fail_with(&self, n: usize, error: Error) {
        *self.failure.lock() = Some(error);
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Deliver an event on the most recent link
    pub fn push(&self, event: LinkEvent) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Everything emitted so far, across all links
    pub fn sent(&self) -> Vec<ClientEvent> {
        let mut sent = self.sent.lock();
        for rx in self.outbound.lock().iter_mut() {
            while let Ok(event) = rx.try_recv() {
                sent.push(event);
            }
        }
        sent.clone()
    }
}

#[async_trait]
impl PushTransport for MockTransport {
    async fn connect(&self, _identity: &str) -> Result<PushLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            let error = self.failure.lock().clone();
            return Err(error.unwrap_or_else(|| Error::ConnectionFailed("refused".into())));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.outbound.lock().push(out_rx);
        *self.inbound.lock() = Some(in_tx);
        Ok(PushLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ============================================================================
// BACKEND
// ============================================================================

/// Backend with in-memory history and call rooms
pub(crate) struct MockBackend {
    self_id: String,
    /// Ascending by time, per conversation
    history: Mutex<HashMap<String, Vec<MessageRecord>>>,
    fetches: AtomicUsize,
    fail_fetch: AtomicBool,
    fetch_gate: Mutex<Option<Arc<Semaphore>>>,
    creates: AtomicUsize,
    fail_create: AtomicBool,
    create_gate: Mutex<Option<Arc<Semaphore>>>,
    garble_create: AtomicBool,
    reads: Mutex<Vec<(String, String)>>,
    fail_read: AtomicBool,
    read_gate: Mutex<Option<Arc<Semaphore>>>,
    initiates: AtomicUsize,
    fail_call: AtomicBool,
    ends: AtomicUsize,
    signals: Mutex<Vec<(String, String, SignalPayload)>>,
    statuses: Mutex<Vec<ConnectionHealth>>,
    share_starts: AtomicUsize,
    share_ends: AtomicUsize,
}

impl MockBackend {
    pub fn new(self_id: &str) -> Arc<Self> {
        Arc::new(Self {
            self_id: self_id.to_string(),
            history: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            fail_fetch: AtomicBool::new(false),
            fetch_gate: Mutex::new(None),
            creates: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            create_gate: Mutex::new(None),
            garble_create: AtomicBool::new(false),
            reads: Mutex::new(Vec::new()),
            fail_read: AtomicBool::new(false),
            read_gate: Mutex::new(None),
            initiates: AtomicUsize::new(0),
            fail_call: AtomicBool::new(false),
            ends: AtomicUsize::new(0),
            signals: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            share_starts: AtomicUsize::new(0),
            share_ends: AtomicUsize::new(0),
        })
    }

    /// Append `count` messages `message 0..count` from `sender`, one second apart
    pub fn seed(&self, conversation_id: &str, count: usize, sender: &str) {
        let mut history = self.history.lock();
        let log = history.entry(conversation_id.to_string()).or_default();
        for i in 0..count {
            log.push(record(
                &format!("{}-m{}", conversation_id, i),
                conversation_id,
                sender,
                &format!("message {}", i),
                SEED_EPOCH_MS + i as i64 * 1000,
            ));
        }
    }

    pub fn seed_one(&self, conversation_id: &str, message: MessageRecord) {
        self.history
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Hold every fetch until `gate` hands out a permit
    pub fn gate_fetches(&self, gate: Arc<Semaphore>) {
        *self.fetch_gate.lock() = Some(gate);
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn gate_creates(&self, gate: Arc<Semaphore>) {
        *self.create_gate.lock() = Some(gate);
    }

    /// Store created messages but answer with an unreadable timestamp
    pub fn garble_creates(&self, garble: bool) {
        self.garble_create.store(garble, Ordering::SeqCst);
    }

    /// Every read-receipt call, failed ones included
    pub fn reads(&self) -> Vec<(String, String)> {
        self.reads.lock().clone()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_read.store(fail, Ordering::SeqCst);
    }

    pub fn gate_reads(&self, gate: Arc<Semaphore>) {
        *self.read_gate.lock() = Some(gate);
    }

    pub fn initiate_count(&self) -> usize {
        self.initiates.load(Ordering::SeqCst)
    }

    /// Make `initiate_call` fail
    pub fn fail_calls(&self, fail: bool) {
        self.fail_call.store(fail, Ordering::SeqCst);
    }

    pub fn end_count(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<(String, String, SignalPayload)> {
        self.signals.lock().clone()
    }

    pub fn status_updates(&self) -> Vec<ConnectionHealth> {
        self.statuses.lock().clone()
    }

    /// (starts, ends)
    pub fn screen_share_calls(&self) -> (usize, usize) {
        (
            self.share_starts.load(Ordering::SeqCst),
            self.share_ends.load(Ordering::SeqCst),
        )
    }

    async fn pass(gate: &Mutex<Option<Arc<Semaphore>>>) {
        let gate = gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl MessageBackend for MockBackend {
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Self::pass(&self.fetch_gate).await;
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Error::Http {
                status: 503,
                message: "unavailable".into(),
            });
        }

        let history = self.history.lock();
        let log = history.get(conversation_id).map(Vec::as_slice).unwrap_or_default();
        // The cursor is the oldest id of the previous page
        let end = match cursor {
            Some(cursor) => log.iter().position(|r| r.id == cursor).unwrap_or(0),
            None => log.len(),
        };
        let start = end.saturating_sub(limit as usize);
        let messages: Vec<MessageRecord> = log[start..end].iter().rev().cloned().collect();
        let next_cursor = messages.last().map(|r| r.id.clone());

        Ok(MessagePage {
            messages,
            pagination: PaginationRecord {
                has_more: start > 0,
                next_cursor,
            },
        })
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<MessageRecord> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        Self::pass(&self.create_gate).await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Http {
                status: 500,
                message: "rejected".into(),
            });
        }

        let mut created = record(
            &format!("srv-{}", n),
            conversation_id,
            &self.self_id,
            content,
            crate::time::now_timestamp_millis(),
        );
        created.kind = kind;
        self.seed_one(conversation_id, created.clone());
        if self.garble_create.load(Ordering::SeqCst) {
            created.created_at = TimestampField::Text("yesterday-ish".into());
        }
        Ok(created)
    }

    async fn mark_message_read(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        self.reads
            .lock()
            .push((conversation_id.to_string(), message_id.to_string()));
        Self::pass(&self.read_gate).await;
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(Error::Timeout("read receipt".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CallBackend for MockBackend {
    async fn initiate_call(&self, _conversation_id: &str, _kind: CallKind) -> Result<CallRecord> {
        if self.fail_call.load(Ordering::SeqCst) {
            return Err(Error::Http {
                status: 403,
                message: "not a participant".into(),
            });
        }
        let n = self.initiates.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CallRecord {
            room_id: format!("room-{}", n),
        })
    }

    async fn end_call(&self, _room_id: &str) -> Result<()> {
        self.ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_connection_status(&self, _room_id: &str, status: ConnectionHealth) -> Result<()> {
        self.statuses.lock().push(status);
        Ok(())
    }

    async fn send_signal(&self, room_id: &str, to_user_id: &str, payload: &SignalPayload) -> Result<()> {
        self.signals
            .lock()
            .push((room_id.to_string(), to_user_id.to_string(), payload.clone()));
        Ok(())
    }

    async fn start_screen_share(&self, _room_id: &str) -> Result<()> {
        self.share_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end_screen_share(&self, _room_id: &str) -> Result<()> {
        self.share_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// MEDIA
// ============================================================================

pub(crate) struct MockTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack for MockTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

struct MockStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream for MockStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks.clone()
    }
}

/// Capture devices that hand out fake tracks
#[derive(Default)]
pub(crate) struct MockMedia {
    counter: AtomicUsize,
    failure: Mutex<Option<Error>>,
    tracks: Mutex<Vec<Arc<MockTrack>>>,
}

impl MockMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every capture request with `error`
    pub fn fail_with(&self, error: Error) {
        *self.failure.lock() = Some(error);
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.lock().iter().filter(|t| t.is_live()).count()
    }

    pub fn track(&self, id: &str) -> Option<Arc<MockTrack>> {
        self.tracks.lock().iter().find(|t| t.id == id).cloned()
    }

    fn new_track(&self, prefix: &str, kind: TrackKind) -> Arc<dyn MediaTrack> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let track = Arc::new(MockTrack {
            id: format!("{}-{}", prefix, n),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        });
        self.tracks.lock().push(track.clone());
        track
    }

    fn check(&self) -> Result<()> {
        match self.failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MediaDevices for MockMedia {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<Arc<dyn MediaStream>> {
        self.check()?;
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.new_track("mic", TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(self.new_track("camera", TrackKind::Video));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockStream {
            id: format!("user-stream-{}", n),
            tracks,
        }))
    }

    async fn get_display_media(&self) -> Result<Arc<dyn MediaStream>> {
        self.check()?;
        let tracks = vec![self.new_track("screen", TrackKind::Video)];
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockStream {
            id: format!("display-stream-{}", n),
            tracks,
        }))
    }
}

// ============================================================================
// PEERS
// ============================================================================

/// Peer connection that records what the engine did to it
pub(crate) struct MockPeer {
    participant_id: String,
    tracks_added: AtomicUsize,
    video_track: Mutex<Option<String>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl MockPeer {
    pub fn track_count(&self) -> usize {
        self.tracks_added.load(Ordering::SeqCst)
    }

    /// Id of the video track currently sent
    pub fn video_track(&self) -> Option<String> {
        self.video_track.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn add_track(&self, track: Arc<dyn MediaTrack>, _stream: &Arc<dyn MediaStream>) -> Result<()> {
        self.tracks_added.fetch_add(1, Ordering::SeqCst);
        if track.kind() == TrackKind::Video {
            *self.video_track.lock() = Some(track.id());
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("offer-for-{}", self.participant_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("answer-for-{}", self.participant_id)))
    }

    async fn set_local_description(&self, _description: SessionDescription) -> Result<()> {
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<Arc<dyn MediaTrack>>) -> Result<()> {
        *self.video_track.lock() = track.map(|t| t.id());
        Ok(())
    }

    fn state(&self) -> PeerState {
        if self.is_closed() {
            PeerState::Closed
        } else {
            PeerState::New
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct MockPeerFactory {
    created: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> Vec<Arc<MockPeer>> {
        self.created.lock().clone()
    }
}

impl PeerConnectionFactory for MockPeerFactory {
    fn create(
        &self,
        participant_id: &str,
        _config: &PeerConfig,
        _events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(MockPeer {
            participant_id: participant_id.to_string(),
            tracks_added: AtomicUsize::new(0),
            video_track: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.created.lock().push(peer.clone());
        Ok(peer)
    }
}
