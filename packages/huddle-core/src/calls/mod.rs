//! # Calls
//!
//! Multi-party audio/video calls: local capture, one peer connection per
//! remote participant, offer/answer/ICE exchange relayed through the
//! backend and push channel, screen-share track substitution, and teardown.
//!
//! ## Call States
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CALL STATE MACHINE                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   (idle) ──initialize_call / join_call──► Initiated                     │
//! │                                               │                         │
//! │                                   peer connected                        │
//! │                                               ▼                         │
//! │                       ┌──────────────────► Connected                    │
//! │                       │ peer connected        │                         │
//! │                       │                       │ peer disconnected/failed│
//! │                       │                       ▼                         │
//! │                       └──────────────── Reconnecting                    │
//! │                                                                         │
//! │   any state ──end_call / call-ended / before_unload──► Ended (terminal) │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The platform supplies media capture ([`MediaDevices`]) and peer
//! connections ([`PeerConnectionFactory`]); the engine only drives them.

mod engine;
mod media;
mod peer;
mod session;
mod signal;

pub use engine::{CallEngine, CallEvent, UnloadPrompt};
pub use media::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind};
pub use peer::{
    ConnectionHealth, PeerConfig, PeerConnection, PeerConnectionFactory, PeerEvent, PeerState,
};
pub use session::{
    CallKind, CallSession, CallSnapshot, CallStatus, NegotiationRole, PeerEntry, PeerSnapshot,
};
pub use signal::{IceCandidate, SdpType, SessionDescription, SignalPayload};
