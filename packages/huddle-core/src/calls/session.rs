//! Call session state owned by the engine.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::media::{MediaConstraints, MediaStream, TrackKind};
use super::peer::{ConnectionHealth, PeerConnection};

/// Audio-only or audio + video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: true,
            video: matches!(self, CallKind::Video),
        }
    }
}

/// Session lifecycle. No session at all is the idle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Initiated,
    Connected,
    Reconnecting,
    /// Terminal; a new call needs a fresh session
    Ended,
}

impl CallStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, CallStatus::Ended)
    }
}

/// Who produced the first offer on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// One remote participant's connection
pub struct PeerEntry {
    pub participant_id: String,
    pub connection: Arc<dyn PeerConnection>,
    pub remote_stream: Option<Arc<dyn MediaStream>>,
    pub role: NegotiationRole,
    pub health: Option<ConnectionHealth>,
}

/// A call in progress (or just ended)
pub struct CallSession {
    pub room_id: String,
    pub conversation_id: String,
    pub kind: CallKind,
    pub status: CallStatus,
    pub local_stream: Option<Arc<dyn MediaStream>>,
    pub screen_stream: Option<Arc<dyn MediaStream>>,
    /// At most one entry per remote participant
    pub peers: HashMap<String, PeerEntry>,
    /// Last health reported by any connection
    pub connection_status: Option<ConnectionHealth>,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(
        room_id: impl Into<String>,
        conversation_id: impl Into<String>,
        kind: CallKind,
        local_stream: Option<Arc<dyn MediaStream>>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            conversation_id: conversation_id.into(),
            kind,
            status: CallStatus::Initiated,
            local_stream,
            screen_stream: None,
            peers: HashMap::new(),
            connection_status: None,
            started_at: crate::time::now(),
        }
    }

    /// Every connection, for fan-out operations performed outside the lock
    pub fn connections(&self) -> Vec<Arc<dyn PeerConnection>> {
        self.peers
            .values()
            .map(|entry| Arc::clone(&entry.connection))
            .collect()
    }

    fn tracks_enabled(&self, kind: TrackKind) -> bool {
        self.local_stream.as_ref().map_or(false, |stream| {
            stream
                .tracks()
                .iter()
                .any(|t| t.kind() == kind && t.is_enabled())
        })
    }

    /// Read-only view for the UI
    pub fn snapshot(&self) -> CallSnapshot {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .values()
            .map(|entry| PeerSnapshot {
                participant_id: entry.participant_id.clone(),
                role: entry.role,
                health: entry.health,
                has_remote_stream: entry.remote_stream.is_some(),
            })
            .collect();
        peers.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));

        CallSnapshot {
            room_id: self.room_id.clone(),
            conversation_id: self.conversation_id.clone(),
            kind: self.kind,
            status: self.status,
            connection_status: self.connection_status,
            audio_enabled: self.tracks_enabled(TrackKind::Audio),
            video_enabled: self.tracks_enabled(TrackKind::Video),
            screen_sharing: self.screen_stream.is_some(),
            peers,
            started_at: self.started_at,
        }
    }
}

/// Snapshot of one peer entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub participant_id: String,
    pub role: NegotiationRole,
    pub health: Option<ConnectionHealth>,
    pub has_remote_stream: bool,
}

/// Snapshot of the session
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub room_id: String,
    pub conversation_id: String,
    pub kind: CallKind,
    pub status: CallStatus,
    pub connection_status: Option<ConnectionHealth>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub peers: Vec<PeerSnapshot>,
    pub started_at: DateTime<Utc>,
}
