//! Local media seams. The host platform supplies the implementations.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Track media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single captured audio or video track
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> TrackKind;
    /// Mute/unmute without renegotiation
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Release the device. Irreversible.
    fn stop(&self);
    /// False once stopped
    fn is_live(&self) -> bool;
}

/// A bundle of tracks from one capture
pub trait MediaStream: Send + Sync {
    fn id(&self) -> String;
    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>>;

    fn audio_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks()
            .into_iter()
            .filter(|t| t.kind() == TrackKind::Audio)
            .collect()
    }

    fn video_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks()
            .into_iter()
            .filter(|t| t.kind() == TrackKind::Video)
            .collect()
    }

    /// Stop every track in the stream
    fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// What to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

/// Capture devices
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Camera and/or microphone.
    ///
    /// Implementations map a refused prompt to `Error::PermissionDenied` and a
    /// missing device to `Error::MediaUnavailable`.
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<Arc<dyn MediaStream>>;

    /// Screen capture. The host calls `CallEngine::handle_screen_share_ended`
    /// when the user stops sharing from the platform UI.
    async fn get_display_media(&self) -> Result<Arc<dyn MediaStream>>;
}
