//! Push channel wire protocol.
//!
//! Every frame is a JSON object `{ "event": "<name>", "data": { ... } }`
//! with kebab-case event names. Payload fields are camelCase.

use serde::{Deserialize, Serialize};

use crate::backend::MessageRecord;
use crate::calls::SignalPayload;

/// Events sent from the server to this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    NewMessage(MessageRecord),
    #[serde(rename_all = "camelCase")]
    UserJoinedCall {
        room_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    UserLeftCall {
        room_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CallSignal {
        room_id: String,
        from: String,
        signal: SignalPayload,
    },
    #[serde(rename_all = "camelCase")]
    CallEnded {
        room_id: String,
    },
}

/// Events sent from this client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    UserConnected {
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    JoinConversation {
        conversation_id: String,
    },
    #[serde(rename_all = "camelCase")]
    LeaveConversation {
        conversation_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        conversation_id: String,
        message: MessageRecord,
    },
    #[serde(rename_all = "camelCase")]
    JoinCall {
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    LeaveCall {
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    EndCall {
        room_id: String,
    },
}

impl ClientEvent {
    /// Wire name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserConnected { .. } => "user-connected",
            Self::JoinConversation { .. } => "join-conversation",
            Self::LeaveConversation { .. } => "leave-conversation",
            Self::SendMessage { .. } => "send-message",
            Self::JoinCall { .. } => "join-call",
            Self::LeaveCall { .. } => "leave-call",
            Self::EndCall { .. } => "end-call",
        }
    }
}

/// Why a link went down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the link
    ServerInitiated,
    /// The underlying stream ended without a close handshake
    TransportClose,
    /// The underlying stream failed
    TransportError(String),
    /// Nothing was heard from the server within the ping window
    PingTimeout,
    /// This client closed the link
    ClientInitiated,
    /// Anything else (policy close codes, etc.)
    Other(String),
}

impl DisconnectReason {
    /// Whether the supervisor should try to reconnect
    pub fn should_reconnect(&self) -> bool {
        matches!(
            self,
            Self::ServerInitiated | Self::TransportClose | Self::TransportError(_)
        )
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServerInitiated => f.write_str("server disconnect"),
            Self::TransportClose => f.write_str("transport close"),
            Self::TransportError(e) => write!(f, "transport error: {}", e),
            Self::PingTimeout => f.write_str("ping timeout"),
            Self::ClientInitiated => f.write_str("client disconnect"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// Events delivered to channel subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// First successful connection
    Connected,
    /// Link restored after `attempts` reconnect attempts
    Reconnected { attempts: u32 },
    /// Link lost
    Disconnected { reason: DisconnectReason },
    /// Server frame
    Server(ServerEvent),
}

/// Channel connection status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Created, supervisor not running yet
    Idle,
    /// First connection attempt in progress
    Connecting,
    /// Link is up
    Connected,
    /// Waiting on or performing reconnect attempt `attempt`
    Reconnecting { attempt: u32 },
    /// Gave up, or the server ended the session in a way that is not retried
    Disconnected { reason: DisconnectReason },
    /// Closed by `close()`
    Closed,
}

impl ChannelStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}
