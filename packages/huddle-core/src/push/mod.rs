//! # Push Channel
//!
//! One persistent, bidirectional, server-push link per signed-in identity.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         CONNECTION MANAGER                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ensure_connection(identity) ──► PushChannel (one per identity)         │
//! │                                     │                                   │
//! │                                     ▼                                   │
//! │                              ┌─────────────┐   connect()  ┌──────────┐  │
//! │                              │ supervisor  │ ───────────► │ Transport│  │
//! │                              │    task     │ ◄─────────── │ (ws.rs)  │  │
//! │                              └──────┬──────┘   PushLink   └──────────┘  │
//! │                                     │                                   │
//! │               broadcast<ChannelEvent> + watch<ChannelStatus>            │
//! │                                     │                                   │
//! │                   ┌─────────────────┼─────────────────┐                 │
//! │                   ▼                 ▼                 ▼                 │
//! │             SyncController     CallEngine          host UI              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reconnect policy
//!
//! | Disconnect reason            | Action                               |
//! |------------------------------|--------------------------------------|
//! | ServerInitiated              | reconnect with backoff               |
//! | TransportClose               | reconnect with backoff               |
//! | TransportError               | reconnect with backoff               |
//! | PingTimeout                  | status only                          |
//! | ClientInitiated / Other      | status only                          |
//! | Connect error, not transient | status only                          |
//!
//! Backoff starts at `reconnect_initial_ms`, doubles per attempt, is capped
//! at `reconnect_max_ms`, and gives up after `max_reconnect_attempts`.
//! A channel whose supervisor has stopped is restarted by the next
//! [`ConnectionManager::ensure_connection`] for its identity.

mod protocol;
mod ws;

pub use protocol::{ChannelEvent, ChannelStatus, ClientEvent, DisconnectReason, ServerEvent};
pub use ws::WsTransport;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::PushConfig;
use crate::error::{Error, Result};

/// What a transport reports on its inbound side
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A decoded server frame
    Frame(ServerEvent),
    /// The link is gone; no further events follow
    Closed(DisconnectReason),
}

/// An open link: a sink for client events and a stream of link events.
///
/// Dropping the outbound sender closes the link.
pub struct PushLink {
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens links to the push server
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, identity: &str) -> Result<PushLink>;
}

// ============================================================================
// PUSH CHANNEL
// ============================================================================

/// A supervised push link for one identity
pub struct PushChannel {
    identity: String,
    config: PushConfig,
    transport: Arc<dyn PushTransport>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    event_tx: broadcast::Sender<ChannelEvent>,
    status_tx: watch::Sender<ChannelStatus>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PushChannel {
    /// Create a channel without connecting it
    pub fn new(
        identity: impl Into<String>,
        config: PushConfig,
        transport: Arc<dyn PushTransport>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let (status_tx, _) = watch::channel(ChannelStatus::Idle);
        Arc::new(Self {
            identity: identity.into(),
            config,
            transport,
            outbound: Mutex::new(None),
            event_tx,
            status_tx,
            supervisor: Mutex::new(None),
        })
    }

    /// Spawn the supervisor. Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.as_ref().map_or(false, |h| !h.is_finished()) {
            return Err(Error::AlreadyStarted("push channel"));
        }
        if *self.status_tx.borrow() == ChannelStatus::Closed {
            return Err(Error::ShutdownInProgress);
        }
        let this = Arc::clone(self);
        *supervisor = Some(tokio::spawn(async move { this.supervise().await }));
        Ok(())
    }

    /// Identity this channel belongs to
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Subscribe to lifecycle events and server frames
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.event_tx.subscribe()
    }

    /// Current status
    pub fn status(&self) -> ChannelStatus {
        self.status_tx.borrow().clone()
    }

    /// Watch status changes
    pub fn status_watch(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Whether the supervisor is still connecting, connected or backing off
    pub fn is_running(&self) -> bool {
        self.supervisor
            .lock()
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }

    /// Send an event to the server.
    ///
    /// Fails with [`Error::NotConnected`] when no link is up; nothing is queued.
    pub fn emit(&self, event: ClientEvent) -> Result<()> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            tracing::debug!(event = event.name(), "Dropping push event, not connected");
            return Err(Error::NotConnected);
        };
        tracing::trace!(event = event.name(), "Emitting push event");
        tx.send(event).map_err(|_| Error::NotConnected)
    }

    /// Stop the supervisor and drop the link. Emits nothing further.
    pub fn close(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.outbound.lock().take();
        self.status_tx.send_replace(ChannelStatus::Closed);
        tracing::info!(identity = %self.identity, "Push channel closed");
    }

    fn set_status(&self, status: ChannelStatus) {
        self.status_tx.send_replace(status);
    }

    fn broadcast(&self, event: ChannelEvent) {
        // No receivers is fine
        let _ = self.event_tx.send(event);
    }

    async fn supervise(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        let mut connected_before = false;
        let mut last_reason = DisconnectReason::TransportClose;

        loop {
            self.set_status(if attempt == 0 {
                ChannelStatus::Connecting
            } else {
                ChannelStatus::Reconnecting { attempt }
            });

            match self.transport.connect(&self.identity).await {
                Ok(PushLink {
                    outbound,
                    mut inbound,
                }) => {
                    if outbound
                        .send(ClientEvent::UserConnected {
                            user_id: self.identity.clone(),
                        })
                        .is_err()
                    {
                        tracing::warn!(identity = %self.identity, "Link closed before presence announce");
                    }
                    *self.outbound.lock() = Some(outbound);
                    self.set_status(ChannelStatus::Connected);

                    if connected_before {
                        tracing::info!(identity = %self.identity, attempts = attempt, "Push channel reconnected");
                        self.broadcast(ChannelEvent::Reconnected { attempts: attempt });
                    } else {
                        tracing::info!(identity = %self.identity, "Push channel connected");
                        self.broadcast(ChannelEvent::Connected);
                    }
                    connected_before = true;
                    attempt = 0;

                    let reason = loop {
                        match inbound.recv().await {
                            Some(LinkEvent::Frame(event)) => {
                                self.broadcast(ChannelEvent::Server(event));
                            }
                            Some(LinkEvent::Closed(reason)) => break reason,
                            None => break DisconnectReason::TransportClose,
                        }
                    };

                    self.outbound.lock().take();
                    tracing::info!(identity = %self.identity, %reason, "Push channel disconnected");
                    self.broadcast(ChannelEvent::Disconnected {
                        reason: reason.clone(),
                    });

                    if !reason.should_reconnect() {
                        self.set_status(ChannelStatus::Disconnected { reason });
                        return;
                    }
                    last_reason = reason;
                }
                Err(e) => {
                    tracing::warn!(
                        identity = %self.identity,
                        attempt,
                        error = %e,
                        "Push connect failed"
                    );
                    last_reason = DisconnectReason::TransportError(e.to_string());
                    if !e.is_recoverable() {
                        tracing::warn!(identity = %self.identity, code = e.code(), "Push connect rejected, not retrying");
                        self.set_status(ChannelStatus::Disconnected {
                            reason: last_reason,
                        });
                        return;
                    }
                }
            }

            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                tracing::warn!(
                    identity = %self.identity,
                    attempts = self.config.max_reconnect_attempts,
                    "Giving up on push channel"
                );
                self.set_status(ChannelStatus::Disconnected {
                    reason: last_reason,
                });
                return;
            }

            let delay = self.config.backoff_for(attempt);
            tracing::debug!(
                identity = %self.identity,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting push channel after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

/// Owns the push channels, one per identity
pub struct ConnectionManager {
    config: PushConfig,
    transport: Arc<dyn PushTransport>,
    channels: Mutex<HashMap<String, Arc<PushChannel>>>,
}

impl ConnectionManager {
    pub fn new(config: PushConfig, transport: Arc<dyn PushTransport>) -> Self {
        Self {
            config,
            transport,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Get the channel for `identity`, creating and starting it on first use.
    ///
    /// Calling this again for the same identity returns the same channel
    /// and opens nothing new while its supervisor runs; a channel that gave
    /// up is restarted. Must be called from within a tokio runtime.
    pub fn ensure_connection(&self, identity: &str) -> Arc<PushChannel> {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(identity) {
            if !channel.is_running() {
                tracing::info!(identity, "Restarting stopped push channel");
                if let Err(e) = channel.start() {
                    tracing::warn!(identity, error = %e, "Push channel did not restart");
                }
            }
            return Arc::clone(channel);
        }

        tracing::debug!(identity, "Opening push channel");
        let channel = PushChannel::new(identity, self.config.clone(), Arc::clone(&self.transport));
        if let Err(e) = channel.start() {
            tracing::warn!(identity, error = %e, "Push channel did not start");
        }
        channels.insert(identity.to_string(), Arc::clone(&channel));
        channel
    }

    /// Existing channel for `identity`, if any
    pub fn channel(&self, identity: &str) -> Option<Arc<PushChannel>> {
        self.channels.lock().get(identity).cloned()
    }

    /// Close and forget the channel for `identity` (logout)
    pub fn close(&self, identity: &str) -> bool {
        let channel = self.channels.lock().remove(identity);
        match channel {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Close every channel
    pub fn close_all(&self) {
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
