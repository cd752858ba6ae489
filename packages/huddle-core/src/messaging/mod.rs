//! # Messaging Module
//!
//! Conversation history for the active conversation: paginated loads,
//! optimistic sends, pushed messages and read receipts.
//!
//! ## Data Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CONVERSATION SYNC                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   MessageBackend ──fetch page──┐                                        │
//! │                                ▼                                        │
//! │   PushChannel ──new-message──► SyncController ──► MessageCache          │
//! │        ▲                         │    │            (sorted, no dups)    │
//! │        │ send-message            │    │                                 │
//! │        └─────────────────────────┘    └──► SyncEvent (ListChanged,      │
//! │                                             PreviewsStale, ...)         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lists are cached per conversation for the lifetime of the process, so
//! switching back to a conversation shows it immediately with its saved
//! pagination cursor.

mod cache;
mod model;
mod sync;

pub use cache::{MessageCache, PageCursor};
pub use model::{
    Conversation, DeliveryState, LastMessage, ListChange, Message, MessageId, MessageKind,
    PendingToken, SenderRef,
};
pub use sync::{LoadPhase, SendOutcome, SyncController, SyncEvent};
