//! # Backend
//!
//! The REST collaborator the real-time layer talks to. The contract is two
//! async traits so controllers can be driven by the HTTP implementation in
//! production and by in-memory mocks in tests.
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │   SyncController     │        │     CallEngine       │
//! └──────────┬───────────┘        └──────────┬───────────┘
//!            │ MessageBackend                │ CallBackend
//!            ▼                               ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                 HttpBackend (reqwest)                   │
//! │   GET/POST/PUT  {api_url}/conversations/..  /calls/..   │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod http;
mod records;

pub use http::HttpBackend;
pub use records::{
    CallRecord, MessagePage, MessageRecord, PaginationRecord, ReadByField, SenderField,
    TimestampField,
};

use async_trait::async_trait;

use crate::calls::{CallKind, ConnectionHealth, SignalPayload};
use crate::error::Result;
use crate::messaging::MessageKind;

/// Message history and delivery endpoints
#[async_trait]
pub trait MessageBackend: Send + Sync {
    /// One page of history, newest first on the server side
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MessagePage>;

    /// Create a message and return the stored record
    async fn create_message(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<MessageRecord>;

    /// Record a read receipt for the caller
    async fn mark_message_read(&self, conversation_id: &str, message_id: &str) -> Result<()>;
}

/// Call lifecycle endpoints
#[async_trait]
pub trait CallBackend: Send + Sync {
    /// Open a call room for a conversation
    async fn initiate_call(&self, conversation_id: &str, kind: CallKind) -> Result<CallRecord>;

    /// Close a call room
    async fn end_call(&self, room_id: &str) -> Result<()>;

    /// Report the caller's coarse connection health
    async fn update_connection_status(&self, room_id: &str, status: ConnectionHealth)
        -> Result<()>;

    /// Relay a signaling payload to one participant of the room
    async fn send_signal(
        &self,
        room_id: &str,
        to_user_id: &str,
        payload: &SignalPayload,
    ) -> Result<()>;

    async fn start_screen_share(&self, room_id: &str) -> Result<()>;

    async fn end_screen_share(&self, room_id: &str) -> Result<()>;
}
