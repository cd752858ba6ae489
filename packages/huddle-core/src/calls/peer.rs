//! Peer connection seams. The engine never touches a concrete WebRTC stack.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::media::{MediaStream, MediaTrack};
use super::signal::{IceCandidate, SessionDescription};
use crate::error::Result;

/// Connection state as the platform reports it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    #[default]
    New,
    Connecting,
    Connected,
    /// Temporarily lost; ICE may recover
    Disconnected,
    Failed,
    Closed,
}

/// Coarse health reported to the backend and to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    Connected,
    Reconnecting,
    Disconnected,
}

impl ConnectionHealth {
    /// Map a platform state; `None` while the connection is still being set up
    pub fn from_state(state: PeerState) -> Option<Self> {
        match state {
            PeerState::New | PeerState::Connecting => None,
            PeerState::Connected => Some(Self::Connected),
            PeerState::Disconnected => Some(Self::Reconnecting),
            PeerState::Failed | PeerState::Closed => Some(Self::Disconnected),
        }
    }
}

/// Callbacks from a peer connection, tagged with the remote participant
#[derive(Clone)]
pub enum PeerEvent {
    /// A local candidate to relay to the participant
    IceCandidate {
        participant_id: String,
        candidate: IceCandidate,
    },
    StateChanged {
        participant_id: String,
        state: PeerState,
    },
    /// The participant's media arrived
    RemoteStream {
        participant_id: String,
        stream: Arc<dyn MediaStream>,
    },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IceCandidate { participant_id, .. } => {
                write!(f, "IceCandidate({})", participant_id)
            }
            Self::StateChanged {
                participant_id,
                state,
            } => write!(f, "StateChanged({}, {:?})", participant_id, state),
            Self::RemoteStream { participant_id, .. } => {
                write!(f, "RemoteStream({})", participant_id)
            }
        }
    }
}

/// Options handed to the factory for each new connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

/// One connection to one remote participant
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn add_track(&self, track: Arc<dyn MediaTrack>, stream: &Arc<dyn MediaStream>) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Swap the outgoing video track in place; `None` sends no video
    async fn replace_video_track(&self, track: Option<Arc<dyn MediaTrack>>) -> Result<()>;
    fn state(&self) -> PeerState;
    fn close(&self);
}

/// Creates peer connections. Events for the new connection go to `events`.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        participant_id: &str,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}
