//! Conversation sync controller.
//!
//! Owns the [`MessageCache`] and keeps the active conversation's list
//! consistent across pagination, optimistic sends, pushed messages and
//! reconnects.
//!
//! ## Load phases (per conversation)
//!
//! ```text
//!   Idle ──switch / load_page──► Loading ──ok──► Ready
//!                                   │               │
//!                                   │ err           │ load_older
//!                                   ▼               ▼
//!                                 Failed ──retry_load──► Loading
//! ```
//!
//! ## Send path
//!
//! ```text
//!   send_message("hi")
//!     ├─ blank?                  → Err(EmptyContent)
//!     ├─ same text within window → Ok(Suppressed { original })
//!     ├─ insert Pending entry    → ListChanged(Appended)
//!     └─ create_message
//!          ├─ ok  → replace entry in place, mirror `send-message`
//!          └─ err → remove entry, clear dedup guard, SendFailed + Err
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::cache::{MessageCache, PageCursor};
use super::model::{ListChange, Message, MessageId, MessageKind, PendingToken, SenderRef};
use crate::backend::{MessageBackend, MessageRecord};
use crate::config::SyncConfig;
use crate::error::{Error, ErrorClass, Result};
use crate::push::{ChannelEvent, ClientEvent, PushChannel, ServerEvent};

/// Load state of a conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadPhase {
    #[default]
    Idle,
    Loading,
    Ready,
    /// Last load failed; [`SyncController::retry_load`] re-issues it
    Failed,
}

/// Events published by the controller
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The list for `conversation_id` changed
    ListChanged {
        conversation_id: String,
        change: ListChange,
    },
    /// Conversation-list previews should be refreshed (debounced)
    PreviewsStale { conversation_ids: Vec<String> },
    /// An optimistic send was rolled back
    SendFailed {
        conversation_id: String,
        token: PendingToken,
        error: Error,
    },
    LoadFailed {
        conversation_id: String,
        error: Error,
    },
    /// Read receipts confirmed by the backend
    ReadMarked {
        conversation_id: String,
        count: usize,
    },
}

/// Result of [`SyncController::send_message`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Stored by the backend
    Sent {
        token: PendingToken,
        message_id: String,
    },
    /// Identical send inside the dedup window; nothing was sent
    Suppressed { original: PendingToken },
}

type DedupKey = (String, MessageKind, String);

#[derive(Default)]
struct SyncState {
    active: Option<String>,
    phases: HashMap<String, LoadPhase>,
    in_flight: HashSet<String>,
    /// Cursor of the last failed request, per conversation
    failed: HashMap<String, Option<String>>,
    recent_sends: HashMap<DedupKey, (PendingToken, Instant)>,
    read_in_flight: bool,
    read_cooldown_until: Option<Instant>,
    visible: bool,
}

/// Keeps message history for the active conversation in sync
pub struct SyncController {
    self_id: String,
    config: SyncConfig,
    backend: Arc<dyn MessageBackend>,
    channel: Arc<PushChannel>,
    cache: RwLock<MessageCache>,
    state: Mutex<SyncState>,
    event_tx: broadcast::Sender<SyncEvent>,
    preview_tx: mpsc::UnboundedSender<String>,
    preview_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncController {
    pub fn new(
        self_id: impl Into<String>,
        config: SyncConfig,
        backend: Arc<dyn MessageBackend>,
        channel: Arc<PushChannel>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        let (preview_tx, preview_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            self_id: self_id.into(),
            config,
            backend,
            channel,
            cache: RwLock::new(MessageCache::new()),
            state: Mutex::new(SyncState {
                visible: true,
                ..Default::default()
            }),
            event_tx,
            preview_tx,
            preview_rx: Mutex::new(Some(preview_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Spawn the push listener, the read-receipt timer and the preview debouncer
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Err(Error::AlreadyStarted("sync controller"));
        }
        let Some(preview_rx) = self.preview_rx.lock().take() else {
            return Err(Error::AlreadyStarted("sync controller"));
        };

        tasks.push(tokio::spawn(debounce_previews(
            preview_rx,
            self.event_tx.clone(),
            self.config.preview_debounce(),
        )));

        let mut push_rx = self.channel.subscribe();
        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                match push_rx.recv().await {
                    Ok(ChannelEvent::Server(ServerEvent::NewMessage(record))) => {
                        if let Err(e) = this.ingest_remote_event(record) {
                            match e.class() {
                                ErrorClass::ConflictOrDuplicate => {
                                    tracing::trace!(error = %e, "Ignoring repeated pushed message");
                                }
                                _ => tracing::warn!(error = %e, "Dropping pushed message"),
                            }
                        }
                    }
                    Ok(ChannelEvent::Connected) | Ok(ChannelEvent::Reconnected { .. }) => {
                        this.rejoin_active();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Sync controller lagged behind push events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let this = Arc::clone(self);
        let period = self.config.read_poll_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !this.state.lock().visible {
                    continue;
                }
                if let Err(e) = this.mark_read().await {
                    tracing::debug!(error = %e, "Periodic read marking failed");
                }
            }
        }));

        Ok(())
    }

    /// Abort background tasks
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.state.lock().active.clone()
    }

    /// Sorted list for the active conversation
    pub fn visible(&self) -> Vec<Message> {
        let Some(active) = self.active_conversation() else {
            return Vec::new();
        };
        self.cache.read().snapshot(&active).unwrap_or_default()
    }

    /// Pagination state of the active conversation
    pub fn pagination(&self) -> PageCursor {
        self.active_conversation()
            .and_then(|id| self.cache.read().cursor(&id))
            .unwrap_or_default()
    }

    /// Load phase of the active conversation
    pub fn phase(&self) -> LoadPhase {
        let state = self.state.lock();
        state
            .active
            .as_ref()
            .and_then(|id| state.phases.get(id).copied())
            .unwrap_or_default()
    }

    /// Whether a page load is outstanding for the active conversation
    pub fn is_loading(&self) -> bool {
        let state = self.state.lock();
        state
            .active
            .as_ref()
            .map_or(false, |id| state.in_flight.contains(id))
    }

    // ========================================================================
    // CONVERSATION SWITCH & PAGINATION
    // ========================================================================

    /// Make `conversation_id` the active conversation.
    ///
    /// No-op when it already is. A conversation with a fetched page is shown
    /// immediately with its saved cursor; otherwise the first page is
    /// requested. Optimistic entries alone do not count as loaded.
    pub async fn switch_conversation(&self, conversation_id: &str) -> Result<()> {
        let previous = {
            let mut state = self.state.lock();
            if state.active.as_deref() == Some(conversation_id) {
                return Ok(());
            }
            state.active.replace(conversation_id.to_string())
        };

        if let Some(previous) = previous {
            self.emit_push(ClientEvent::LeaveConversation {
                conversation_id: previous,
            });
        }
        self.emit_push(ClientEvent::JoinConversation {
            conversation_id: conversation_id.to_string(),
        });

        let cached = self.cache.read().is_loaded(conversation_id);
        self.publish(SyncEvent::ListChanged {
            conversation_id: conversation_id.to_string(),
            change: ListChange::Reset,
        });

        if cached {
            tracing::debug!(conversation_id, "Hydrated conversation from cache");
            self.state
                .lock()
                .phases
                .insert(conversation_id.to_string(), LoadPhase::Ready);
        } else {
            self.load_page(None).await?;
        }

        if let Err(e) = self.mark_read().await {
            tracing::debug!(conversation_id, error = %e, "Read marking on open failed");
        }
        Ok(())
    }

    /// Fetch one page for the active conversation and merge it.
    ///
    /// A call while a load is already outstanding for the same conversation
    /// does nothing. Results that arrive after the user switched away are
    /// discarded.
    pub async fn load_page(&self, cursor: Option<String>) -> Result<()> {
        let conversation_id = {
            let mut state = self.state.lock();
            let Some(active) = state.active.clone() else {
                return Err(Error::NoActiveConversation);
            };
            if !state.in_flight.insert(active.clone()) {
                tracing::trace!(conversation_id = %active, "Page load already in flight");
                return Ok(());
            }
            state.phases.insert(active.clone(), LoadPhase::Loading);
            active
        };
        let _guard = LoadGuard {
            sync: self,
            conversation_id: conversation_id.clone(),
        };

        tracing::debug!(%conversation_id, cursor = ?cursor, "Loading page");
        let result = self
            .backend
            .fetch_messages(&conversation_id, cursor.as_deref(), self.config.page_size)
            .await;

        let still_active = {
            let mut state = self.state.lock();
            let still_active = state.active.as_deref() == Some(conversation_id.as_str());
            if !still_active {
                state
                    .phases
                    .insert(conversation_id.clone(), self.settled_phase(&conversation_id));
            }
            still_active
        };
        if !still_active {
            tracing::debug!(%conversation_id, "Discarding page for inactive conversation");
            return Ok(());
        }

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(%conversation_id, error = %e, "Page load failed");
                {
                    let mut state = self.state.lock();
                    state.phases.insert(conversation_id.clone(), LoadPhase::Failed);
                    state.failed.insert(conversation_id.clone(), cursor);
                }
                self.publish(SyncEvent::LoadFailed {
                    conversation_id,
                    error: e.clone(),
                });
                return Err(e);
            }
        };

        let messages: Vec<Message> = page
            .messages
            .into_iter()
            .filter_map(|record| match Message::from_record(record) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(%conversation_id, error = %e, "Skipping malformed message");
                    None
                }
            })
            .collect();

        let added = {
            let mut cache = self.cache.write();
            cache.mark_loaded(&conversation_id);
            let added = cache.merge(&conversation_id, messages);
            cache.set_cursor(
                &conversation_id,
                PageCursor {
                    next: page.pagination.next_cursor,
                    has_more: page.pagination.has_more,
                },
            );
            added
        };
        {
            let mut state = self.state.lock();
            state.phases.insert(conversation_id.clone(), LoadPhase::Ready);
            state.failed.remove(&conversation_id);
        }

        tracing::debug!(%conversation_id, added, "Page merged");
        let change = if cursor.is_some() {
            ListChange::Prepended { count: added }
        } else {
            ListChange::Reset
        };
        self.publish(SyncEvent::ListChanged {
            conversation_id,
            change,
        });
        Ok(())
    }

    /// Load the next older page if there is one. Returns whether a request was made.
    pub async fn load_older(&self) -> Result<bool> {
        let cursor = self.pagination();
        if !cursor.has_more || self.is_loading() {
            return Ok(false);
        }
        self.load_page(cursor.next).await?;
        Ok(true)
    }

    /// Re-issue the last failed load for the active conversation.
    ///
    /// A conversation that never finished its first page gets it requested
    /// again even without a recorded failure.
    pub async fn retry_load(&self) -> Result<()> {
        let cursor = {
            let state = self.state.lock();
            let active = state.active.as_ref().ok_or(Error::NoActiveConversation)?;
            match state.failed.get(active) {
                Some(cursor) => cursor.clone(),
                None if !self.cache.read().is_loaded(active) => None,
                None => return Ok(()),
            }
        };
        self.load_page(cursor).await
    }

    // ========================================================================
    // SENDING
    // ========================================================================

    /// Send a message to the active conversation with optimistic display
    pub async fn send_message(&self, content: &str, kind: MessageKind) -> Result<SendOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::EmptyContent);
        }

        let token = PendingToken::new();
        let (conversation_id, key) = {
            let mut state = self.state.lock();
            let conversation_id = state.active.clone().ok_or(Error::NoActiveConversation)?;
            let key: DedupKey = (conversation_id.clone(), kind, content.to_string());

            let now = Instant::now();
            let window = self.config.dedup_window();
            state
                .recent_sends
                .retain(|_, (_, at)| now.duration_since(*at) < window);
            if let Some((original, _)) = state.recent_sends.get(&key) {
                tracing::debug!(%conversation_id, "Suppressing duplicate send");
                return Ok(SendOutcome::Suppressed {
                    original: *original,
                });
            }
            state.recent_sends.insert(key.clone(), (token, now));
            (conversation_id, key)
        };

        let optimistic = Message::optimistic(
            token,
            conversation_id.clone(),
            SenderRef::new(self.self_id.clone()),
            content,
            kind,
        );
        self.cache.write().insert_optimistic(optimistic.clone());
        self.publish(SyncEvent::ListChanged {
            conversation_id: conversation_id.clone(),
            change: ListChange::Appended {
                count: 1,
                by_self: true,
            },
        });

        let created = self
            .backend
            .create_message(&conversation_id, content, kind)
            .await
            .and_then(|record| {
                if record.id.is_empty() {
                    Err(Error::InvalidMessage("created message has no id".into()))
                } else {
                    Ok(record)
                }
            });

        match created {
            Ok(record) => {
                let message_id = record.id.clone();
                // Stored server-side even when the echo does not parse
                let message = Message::from_record(record.clone()).unwrap_or_else(|e| {
                    tracing::warn!(
                        %conversation_id,
                        %message_id,
                        error = %e,
                        "Confirming send from local copy"
                    );
                    Message {
                        id: MessageId::Server(message_id.clone()),
                        ..optimistic
                    }
                });
                self.cache
                    .write()
                    .confirm(&conversation_id, token, message);
                self.publish(SyncEvent::ListChanged {
                    conversation_id: conversation_id.clone(),
                    change: ListChange::Updated,
                });
                self.emit_push(ClientEvent::SendMessage {
                    conversation_id: conversation_id.clone(),
                    message: record,
                });
                self.queue_preview(&conversation_id);
                tracing::debug!(%conversation_id, %message_id, "Message sent");
                Ok(SendOutcome::Sent { token, message_id })
            }
            Err(e) => {
                tracing::warn!(%conversation_id, error = %e, "Send failed, rolling back");
                self.cache.write().remove_pending(&conversation_id, token);
                self.state.lock().recent_sends.remove(&key);
                self.publish(SyncEvent::ListChanged {
                    conversation_id: conversation_id.clone(),
                    change: ListChange::Updated,
                });
                self.publish(SyncEvent::SendFailed {
                    conversation_id,
                    token,
                    error: e.clone(),
                });
                Err(Error::DeliveryFailed(e.to_string()))
            }
        }
    }

    // ========================================================================
    // INBOUND
    // ========================================================================

    /// Merge a pushed message. Returns whether it was appended to a cached list.
    ///
    /// A message already in the list fails with [`Error::DuplicateMessage`].
    pub fn ingest_remote_event(&self, record: MessageRecord) -> Result<bool> {
        let message = Message::from_record(record)?;
        let conversation_id = message.conversation_id.clone();
        let message_id = message.id.to_string();
        let by_self = message.is_from(&self.self_id);

        let appended = {
            let mut cache = self.cache.write();
            if !cache.contains(&conversation_id) {
                false
            } else if cache.merge(&conversation_id, vec![message]) == 0 {
                return Err(Error::DuplicateMessage(message_id));
            } else {
                true
            }
        };
        if appended {
            tracing::trace!(%conversation_id, "Appended pushed message");
            self.publish(SyncEvent::ListChanged {
                conversation_id: conversation_id.clone(),
                change: ListChange::Appended { count: 1, by_self },
            });
        }
        self.queue_preview(&conversation_id);
        Ok(appended)
    }

    fn rejoin_active(&self) {
        if let Some(conversation_id) = self.active_conversation() {
            self.emit_push(ClientEvent::JoinConversation { conversation_id });
        }
    }

    // ========================================================================
    // READ RECEIPTS
    // ========================================================================

    /// Mark every unread, server-confirmed message from others as read.
    ///
    /// Returns how many receipts the backend confirmed. Skipped while another
    /// pass is running or during the cooldown that follows a failure.
    pub async fn mark_read(&self) -> Result<usize> {
        let conversation_id = {
            let mut state = self.state.lock();
            let Some(active) = state.active.clone() else {
                return Ok(0);
            };
            if state.read_in_flight {
                return Ok(0);
            }
            if state
                .read_cooldown_until
                .map_or(false, |until| Instant::now() < until)
            {
                tracing::trace!("Read marking cooling down");
                return Ok(0);
            }
            state.read_in_flight = true;
            active
        };
        let _pass = ReadPass { state: &self.state };

        let targets: Vec<String> = self
            .cache
            .read()
            .snapshot(&conversation_id)
            .unwrap_or_default()
            .iter()
            .filter(|m| !m.is_from(&self.self_id) && !m.is_read_by(&self.self_id))
            .filter_map(|m| m.server_id().map(str::to_string))
            .collect();

        if targets.is_empty() {
            return Ok(0);
        }

        self.cache
            .write()
            .mark_read(&conversation_id, &targets, &self.self_id);
        self.publish(SyncEvent::ListChanged {
            conversation_id: conversation_id.clone(),
            change: ListChange::Updated,
        });

        let results = futures::future::join_all(targets.iter().map(|id| {
            let backend = Arc::clone(&self.backend);
            let conversation_id = conversation_id.clone();
            let id = id.clone();
            async move {
                let result = backend.mark_message_read(&conversation_id, &id).await;
                (id, result)
            }
        }))
        .await;

        let mut confirmed = 0;
        let mut failed = Vec::new();
        let mut first_error = None;
        for (id, result) in results {
            match result {
                Ok(()) => confirmed += 1,
                Err(e) => {
                    failed.push(id);
                    first_error.get_or_insert(e);
                }
            }
        }

        if !failed.is_empty() {
            tracing::warn!(
                %conversation_id,
                failed = failed.len(),
                "Read receipts failed, cooling down"
            );
            self.cache
                .write()
                .revert_read(&conversation_id, &failed, &self.self_id);
            self.publish(SyncEvent::ListChanged {
                conversation_id: conversation_id.clone(),
                change: ListChange::Updated,
            });
        }

        if !failed.is_empty() {
            self.state.lock().read_cooldown_until = Some(Instant::now() + self.config.read_cooldown());
        }

        if confirmed > 0 {
            self.publish(SyncEvent::ReadMarked {
                conversation_id,
                count: confirmed,
            });
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(confirmed),
        }
    }

    /// Report page visibility. Regaining visibility triggers a read pass.
    pub async fn set_visible(&self, visible: bool) {
        let regained = {
            let mut state = self.state.lock();
            let was_visible = std::mem::replace(&mut state.visible, visible);
            visible && !was_visible
        };
        if regained {
            if let Err(e) = self.mark_read().await {
                tracing::debug!(error = %e, "Read marking on focus failed");
            }
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Phase for a conversation with no load outstanding
    fn settled_phase(&self, conversation_id: &str) -> LoadPhase {
        if self.cache.read().is_loaded(conversation_id) {
            LoadPhase::Ready
        } else {
            LoadPhase::Idle
        }
    }

    fn publish(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_push(&self, event: ClientEvent) {
        if let Err(e) = self.channel.emit(event) {
            tracing::debug!(error = %e, "Push emit skipped");
        }
    }

    fn queue_preview(&self, conversation_id: &str) {
        let _ = self.preview_tx.send(conversation_id.to_string());
    }
}

// ============================================================================
// GUARDS
// ============================================================================

/// Releases a conversation's in-flight slot when a page load ends, including
/// when the load future is dropped mid-request.
struct LoadGuard<'a> {
    sync: &'a SyncController,
    conversation_id: String,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.sync.state.lock();
        state.in_flight.remove(&self.conversation_id);
        if state.phases.get(&self.conversation_id) == Some(&LoadPhase::Loading) {
            tracing::debug!(conversation_id = %self.conversation_id, "Page load abandoned");
            let settled = self.sync.settled_phase(&self.conversation_id);
            state.phases.insert(self.conversation_id.clone(), settled);
        }
    }
}

/// Clears the read-pass flag however the pass ends
struct ReadPass<'a> {
    state: &'a Mutex<SyncState>,
}

impl Drop for ReadPass<'_> {
    fn drop(&mut self) {
        self.state.lock().read_in_flight = false;
    }
}

/// Coalesce preview refresh requests until `window` passes with no new ones
async fn debounce_previews(
    mut rx: mpsc::UnboundedReceiver<String>,
    event_tx: broadcast::Sender<SyncEvent>,
    window: std::time::Duration,
) {
    while let Some(first) = rx.recv().await {
        let mut pending = BTreeSet::from([first]);
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                next = rx.recv() => match next {
                    Some(id) => {
                        pending.insert(id);
                        deadline.as_mut().reset(Instant::now() + window);
                    }
                    None => break,
                },
            }
        }

        let _ = event_tx.send(SyncEvent::PreviewsStale {
            conversation_ids: pending.into_iter().collect(),
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
