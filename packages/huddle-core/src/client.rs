//! # Client
//!
//! [`HuddleClient`] wires the components for one signed-in identity.
//!
//! ## Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CLIENT LIFECYCLE                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  1. HuddleClient::new / ::connect                                       │
//! │        build ConnectionManager, SyncController, CallEngine              │
//! │                                                                         │
//! │  2. start()                                                             │
//! │        ensure_connection(user) ──► PushChannel supervisor running       │
//! │        sync.start()            ──► push listener, read timer, previews  │
//! │        calls.start()           ──► signaling event loop                 │
//! │                                                                         │
//! │  3. shutdown()                       (the client cannot be restarted)   │
//! │        calls.stop()            ──► end call, release media              │
//! │        sync.stop()                                                      │
//! │        connections.close(user)                                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{CallBackend, HttpBackend, MessageBackend};
use crate::calls::{CallEngine, MediaDevices, PeerConnectionFactory};
use crate::config::HuddleConfig;
use crate::error::{Error, Result};
use crate::messaging::SyncController;
use crate::push::{ConnectionManager, PushChannel, PushTransport, WsTransport};
use crate::scroll::ScrollCoordinator;

/// Collaborators supplied by the host
pub struct Collaborators {
    pub messages: Arc<dyn MessageBackend>,
    pub calls: Arc<dyn CallBackend>,
    pub transport: Arc<dyn PushTransport>,
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
}

/// The real-time layer for one identity
pub struct HuddleClient {
    user_id: String,
    config: HuddleConfig,
    connections: ConnectionManager,
    channel: Arc<PushChannel>,
    sync: Arc<SyncController>,
    calls: Arc<CallEngine>,
    started: AtomicBool,
}

impl HuddleClient {
    /// Build a client from explicit collaborators.
    ///
    /// Must be called from within a tokio runtime; the push channel starts
    /// connecting immediately.
    pub fn new(user_id: impl Into<String>, config: HuddleConfig, collaborators: Collaborators) -> Self {
        let user_id = user_id.into();
        let connections = ConnectionManager::new(config.push.clone(), collaborators.transport);
        let channel = connections.ensure_connection(&user_id);

        let sync = SyncController::new(
            user_id.clone(),
            config.sync.clone(),
            collaborators.messages,
            Arc::clone(&channel),
        );
        let calls = CallEngine::new(
            user_id.clone(),
            config.calls.clone(),
            collaborators.calls,
            Arc::clone(&channel),
            collaborators.media,
            collaborators.peers,
        );

        Self {
            user_id,
            config,
            connections,
            channel,
            sync,
            calls,
            started: AtomicBool::new(false),
        }
    }

    /// Build a client that talks HTTP and WebSocket to the configured backend
    pub fn connect(
        user_id: impl Into<String>,
        config: HuddleConfig,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Self> {
        let backend = Arc::new(HttpBackend::new(&config.backend)?);
        let transport = Arc::new(WsTransport::new(&config.push, config.backend.api_token.clone()));
        Ok(Self::new(
            user_id,
            config,
            Collaborators {
                messages: backend.clone(),
                calls: backend,
                transport,
                media,
                peers,
            },
        ))
    }

    /// Start the sync controller and call engine.
    ///
    /// A client starts once; after [`HuddleClient::shutdown`] build a new one.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted("client"));
        }
        tracing::info!(user_id = %self.user_id, "Starting Huddle client v{}", crate::version());
        self.sync.start()?;
        self.calls.start()?;
        Ok(())
    }

    /// Tear down in order: call engine, sync controller, push channel
    pub async fn shutdown(&self) {
        tracing::info!(user_id = %self.user_id, "Shutting down Huddle client");
        self.calls.stop().await;
        self.sync.stop();
        self.connections.close(&self.user_id);
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &HuddleConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<PushChannel> {
        &self.channel
    }

    pub fn sync(&self) -> &Arc<SyncController> {
        &self.sync
    }

    pub fn calls(&self) -> &Arc<CallEngine> {
        &self.calls
    }

    /// Fresh scroll coordinator for a message list view
    pub fn scroll_coordinator(&self) -> ScrollCoordinator {
        ScrollCoordinator::new(self.config.scroll.clone())
    }
}
