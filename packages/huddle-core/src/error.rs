//! # Error Handling
//!
//! Error types for Huddle Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Lifecycle Errors (100-199)                                        │
//! │  │   ├── AlreadyStarted        - Component already running             │
//! │  │   └── ShutdownInProgress    - Component is shutting down            │
//! │  │                                                                      │
//! │  ├── Network Errors (500-599)                                          │
//! │  │   ├── NotConnected          - Push channel is down                  │
//! │  │   ├── ConnectionFailed      - Transport could not be opened         │
//! │  │   ├── Timeout               - Request timed out                     │
//! │  │   ├── Http                  - Backend answered with an error status │
//! │  │   └── ProtocolError         - Malformed push frame                  │
//! │  │                                                                      │
//! │  ├── Message Errors (700-799)                                          │
//! │  │   ├── NoActiveConversation  - Nothing selected                      │
//! │  │   ├── EmptyContent          - Refused to send blank text            │
//! │  │   ├── InvalidMessage        - Record could not be normalized        │
//! │  │   ├── DuplicateMessage      - Id already cached                     │
//! │  │   └── DeliveryFailed        - Backend rejected the create call      │
//! │  │                                                                      │
//! │  ├── Call Errors (800-899)                                             │
//! │  │   ├── PermissionDenied      - User refused camera / microphone      │
//! │  │   ├── MediaUnavailable      - No usable capture device              │
//! │  │   ├── CallAlreadyActive     - A session already exists              │
//! │  │   ├── NoActiveCall          - No session to act on                  │
//! │  │   ├── UnknownPeer           - Signal for a peer we have no entry for│
//! │  │   ├── UnexpectedSignal      - Signal that does not fit the state    │
//! │  │   └── PeerConnection        - Peer connection operation failed      │
//! │  │                                                                      │
//! │  └── Internal Errors (900-999)                                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every variant also belongs to an [`ErrorClass`], which is what controllers
//! branch on when deciding whether to retry, surface, or swallow a failure.

use thiserror::Error;

/// Result type alias for Huddle Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Huddle Core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Lifecycle Errors (100-199)
    // ========================================================================

    /// Component was started twice
    #[error("{0} is already running.")]
    AlreadyStarted(&'static str),

    /// Component is shutting down
    #[error("Huddle Core is shutting down.")]
    ShutdownInProgress,

    // ========================================================================
    // Network Errors (500-599)
    // ========================================================================

    /// The push channel has no live link
    #[error("Push channel is not connected.")]
    NotConnected,

    /// Failed to open a transport
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Backend answered with a non-success status
    #[error("Backend returned {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// Protocol-level error (malformed frame, unknown event)
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    // ========================================================================
    // Message Errors (700-799)
    // ========================================================================

    /// No conversation is selected
    #[error("No active conversation.")]
    NoActiveConversation,

    /// Message content was empty after trimming
    #[error("Message content cannot be empty.")]
    EmptyContent,

    /// A server record could not be normalized
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A message id is already present in the cache
    #[error("Message {0} is already present.")]
    DuplicateMessage(String),

    /// The backend rejected a message create call
    #[error("Failed to deliver message: {0}")]
    DeliveryFailed(String),

    // ========================================================================
    // Call Errors (800-899)
    // ========================================================================

    /// The user refused media permission
    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    /// No usable capture device
    #[error("Media device unavailable: {0}")]
    MediaUnavailable(String),

    /// A call session already exists
    #[error("A call is already active.")]
    CallAlreadyActive,

    /// No call session exists
    #[error("No active call.")]
    NoActiveCall,

    /// A signal referenced a participant without a peer connection
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// A signal arrived that does not fit the current negotiation state
    #[error("Unexpected signal: {0}")]
    UnexpectedSignal(String),

    /// A peer connection operation failed
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Coarse failure taxonomy used to pick a handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried through reconnection or the next scheduled poll
    TransientNetwork,
    /// Surfaced to the user, never retried
    Validation,
    /// Silently ignored
    ConflictOrDuplicate,
    /// Aborts call initialization before any state exists
    ResourceAcquisition,
    /// Dropped and logged
    SignalingProtocol,
    /// Logged; indicates a bug or a broken collaborator
    Internal,
}

impl Error {
    /// Get the numeric error code
    ///
    /// - 100-199: Lifecycle
    /// - 500-599: Network
    /// - 700-799: Messages
    /// - 800-899: Calls
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Lifecycle (100-199)
            Error::AlreadyStarted(_) => 100,
            Error::ShutdownInProgress => 101,

            // Network (500-599)
            Error::NotConnected => 500,
            Error::ConnectionFailed(_) => 501,
            Error::Timeout(_) => 502,
            Error::Http { .. } => 503,
            Error::ProtocolError(_) => 504,

            // Messages (700-799)
            Error::NoActiveConversation => 700,
            Error::EmptyContent => 701,
            Error::InvalidMessage(_) => 702,
            Error::DuplicateMessage(_) => 703,
            Error::DeliveryFailed(_) => 705,

            // Calls (800-899)
            Error::PermissionDenied(_) => 800,
            Error::MediaUnavailable(_) => 801,
            Error::CallAlreadyActive => 802,
            Error::NoActiveCall => 803,
            Error::UnknownPeer(_) => 804,
            Error::UnexpectedSignal(_) => 805,
            Error::PeerConnection(_) => 806,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
            Error::DeserializationError(_) => 902,
        }
    }

    /// Which handling policy applies to this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NotConnected
            | Error::ConnectionFailed(_)
            | Error::Timeout(_)
            | Error::DeliveryFailed(_) => ErrorClass::TransientNetwork,
            // 4xx responses are the caller's fault; everything else may pass.
            Error::Http { status, .. } if (400..500).contains(status) => ErrorClass::Validation,
            Error::Http { .. } => ErrorClass::TransientNetwork,

            Error::EmptyContent | Error::InvalidMessage(_) | Error::NoActiveConversation => {
                ErrorClass::Validation
            }

            Error::DuplicateMessage(_) => ErrorClass::ConflictOrDuplicate,

            Error::PermissionDenied(_) | Error::MediaUnavailable(_) => {
                ErrorClass::ResourceAcquisition
            }

            Error::UnknownPeer(_)
            | Error::UnexpectedSignal(_)
            | Error::ProtocolError(_)
            | Error::NoActiveCall
            | Error::CallAlreadyActive
            | Error::PeerConnection(_) => ErrorClass::SignalingProtocol,

            Error::AlreadyStarted(_)
            | Error::ShutdownInProgress
            | Error::Internal(_)
            | Error::SerializationError(_)
            | Error::DeserializationError(_) => ErrorClass::Internal,
        }
    }

    /// Check if this error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::TransientNetwork
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Error::DeserializationError(err.to_string())
        } else {
            Error::SerializationError(err.to_string())
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            Error::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            Error::DeserializationError(err.to_string())
        } else {
            Error::ConnectionFailed(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::ConnectionFailed(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
