//! Message and conversation types as the rest of the crate sees them.
//!
//! Server records ([`MessageRecord`]) are loose: ids may be `_id`, senders
//! may be a bare id or a populated profile, timestamps may be strings or
//! epoch millis. [`Message::from_record`] is the single place that turns
//! them into the strict form below.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{MessageRecord, ReadByField, SenderField, TimestampField};
use crate::error::{Error, Result};

/// Client-generated token identifying an optimistic message until the
/// backend assigns it a real id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingToken(Uuid);

impl PendingToken {
    /// Fresh random token
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PendingToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PendingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pending-{}", self.0)
    }
}

/// Message identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    /// Issued by the backend
    Server(String),
    /// Optimistic entry awaiting confirmation
    Pending(PendingToken),
}

impl MessageId {
    /// The backend id, if this message has been confirmed
    pub fn as_server(&self) -> Option<&str> {
        match self {
            MessageId::Server(id) => Some(id),
            MessageId::Pending(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => f.write_str(id),
            MessageId::Pending(token) => token.fmt(f),
        }
    }
}

/// Content type of a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text
    #[default]
    Text,
    /// Image attachment; content is the URL
    Image,
    /// File attachment; content is the URL
    File,
}

impl MessageKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }
}

/// Delivery status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Optimistic, create call outstanding
    Pending,
    /// Confirmed by the backend
    Sent,
}

/// Who wrote a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderRef {
    /// User id
    pub id: String,
    /// Display name, when the backend populated it
    pub name: Option<String>,
}

impl SenderRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server id or pending token
    pub id: MessageId,
    /// Conversation this belongs to
    pub conversation_id: String,
    /// Author
    pub sender: SenderRef,
    /// Text, or attachment URL for image/file messages
    pub content: String,
    /// Content type
    pub kind: MessageKind,
    /// Creation time as reported by the backend (or local clock for optimistic entries)
    pub created_at: DateTime<Utc>,
    /// Users who have read this message
    pub read_by: HashSet<String>,
    /// Delivery status
    pub delivery: DeliveryState,
    /// Arrival order inside the cache, used as the sort tie-break
    pub seq: u64,
}

impl Message {
    /// Normalize a server record.
    pub fn from_record(record: MessageRecord) -> Result<Self> {
        if record.id.is_empty() {
            return Err(Error::InvalidMessage("record has no id".into()));
        }
        if record.conversation_id.is_empty() {
            return Err(Error::InvalidMessage(format!(
                "message {} has no conversation",
                record.id
            )));
        }

        let created_at = match &record.created_at {
            TimestampField::Millis(millis) => crate::time::from_millis(*millis),
            TimestampField::Text(text) => crate::time::parse_rfc3339(text),
        }
        .ok_or_else(|| {
            Error::InvalidMessage(format!("message {} has an unreadable timestamp", record.id))
        })?;

        let sender = match record.sender {
            SenderField::Id(id) => SenderRef::new(id),
            SenderField::Profile { id, name } => SenderRef { id, name },
        };

        let read_by = record
            .read_by
            .into_iter()
            .map(|entry| match entry {
                ReadByField::Id(id) => id,
                ReadByField::Entry { user } => user,
            })
            .collect();

        Ok(Self {
            id: MessageId::Server(record.id),
            conversation_id: record.conversation_id,
            sender,
            content: record.content,
            kind: record.kind,
            created_at,
            read_by,
            delivery: DeliveryState::Sent,
            seq: 0,
        })
    }

    /// Local placeholder shown while the create call is outstanding
    pub fn optimistic(
        token: PendingToken,
        conversation_id: impl Into<String>,
        sender: SenderRef,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        let read_by = HashSet::from([sender.id.clone()]);
        Self {
            id: MessageId::Pending(token),
            conversation_id: conversation_id.into(),
            sender,
            content: content.into(),
            kind,
            created_at: crate::time::now(),
            read_by,
            delivery: DeliveryState::Pending,
            seq: 0,
        }
    }

    /// Backend id, if confirmed
    pub fn server_id(&self) -> Option<&str> {
        self.id.as_server()
    }

    /// Check if `user_id` wrote this message
    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender.id == user_id
    }

    /// Check if `user_id` has read this message
    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.contains(user_id)
    }
}

/// Preview of the newest message, shown in conversation lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    pub preview: String,
    pub sender_id: String,
    pub at: DateTime<Utc>,
}

impl From<&Message> for LastMessage {
    fn from(message: &Message) -> Self {
        let preview = match message.kind {
            MessageKind::Text => message.content.clone(),
            MessageKind::Image => "Sent an image".to_string(),
            MessageKind::File => "Sent a file".to_string(),
        };
        Self {
            preview,
            sender_id: message.sender.id.clone(),
            at: message.created_at,
        }
    }
}

/// A direct or group conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: String,
    /// Display name
    pub name: String,
    /// Participant user ids
    pub participants: Vec<String>,
    /// More than two participants
    pub is_group: bool,
    /// Newest message summary
    pub last_message: Option<LastMessage>,
}

impl Conversation {
    /// Update the preview if `message` is newer than the current one.
    ///
    /// Returns whether the preview changed.
    pub fn apply_preview(&mut self, message: &Message) -> bool {
        if message.conversation_id != self.id {
            return false;
        }
        let newer = self
            .last_message
            .as_ref()
            .map_or(true, |last| message.created_at >= last.at);
        if newer {
            self.last_message = Some(LastMessage::from(message));
        }
        newer
    }
}

/// How the visible list changed, so the scroll layer can anchor correctly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChange {
    /// Whole list replaced: first page, hydration, or cleared on switch
    Reset,
    /// Older page merged in at the top
    Prepended { count: usize },
    /// New message(s) at the bottom
    Appended { count: usize, by_self: bool },
    /// Same messages, changed state (confirmation, rollback, read marks)
    Updated,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: &str) -> MessageRecord {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_from_record_with_populated_sender() {
        let msg = Message::from_record(record(
            r#"{
                "_id": "m1",
                "conversation": "c1",
                "sender": { "_id": "u2", "name": "Bob" },
                "content": "hi",
                "type": "text",
                "createdAt": "2024-05-01T12:30:00.250Z",
                "readBy": [{ "user": "u2" }, "u3"]
            }"#,
        ))
        .unwrap();

        assert_eq!(msg.id, MessageId::Server("m1".into()));
        assert_eq!(msg.conversation_id, "c1");
        assert_eq!(msg.sender.name.as_deref(), Some("Bob"));
        assert_eq!(msg.created_at.timestamp_millis(), 1_714_566_600_250);
        assert!(msg.is_read_by("u2"));
        assert!(msg.is_read_by("u3"));
        assert_eq!(msg.delivery, DeliveryState::Sent);
    }

    #[test]
    fn test_from_record_with_bare_sender_and_millis() {
        let msg = Message::from_record(record(
            r#"{
                "id": "m2",
                "conversationId": "c1",
                "sender": "u1",
                "content": "https://cdn.example.com/a.png",
                "type": "image",
                "createdAt": 1714566600250
            }"#,
        ))
        .unwrap();

        assert_eq!(msg.sender, SenderRef::new("u1"));
        assert_eq!(msg.kind, MessageKind::Image);
        assert!(msg.read_by.is_empty());
    }

    #[test]
    fn test_from_record_rejects_bad_timestamp() {
        let result = Message::from_record(record(
            r#"{ "id": "m3", "conversationId": "c1", "sender": "u1", "createdAt": "soon" }"#,
        ));
        assert!(matches!(result, Err(Error::InvalidMessage(_))));
    }

    #[test]
    fn test_optimistic_message() {
        let token = PendingToken::new();
        let msg = Message::optimistic(token, "c1", SenderRef::new("me"), "hello", MessageKind::Text);
        assert_eq!(msg.id, MessageId::Pending(token));
        assert_eq!(msg.delivery, DeliveryState::Pending);
        assert!(msg.server_id().is_none());
        assert!(msg.is_read_by("me"));
        assert!(msg.id.to_string().starts_with("pending-"));
    }

    #[test]
    fn test_conversation_preview_only_moves_forward() {
        let mut conversation = Conversation {
            id: "c1".into(),
            name: "Design".into(),
            participants: vec!["u1".into(), "u2".into(), "u3".into()],
            is_group: true,
            last_message: None,
        };

        let newer = Message::optimistic(PendingToken::new(), "c1", SenderRef::new("u1"), "new", MessageKind::Text);
        let mut older = newer.clone();
        older.created_at = newer.created_at - chrono::Duration::minutes(5);
        older.content = "old".into();

        assert!(conversation.apply_preview(&newer));
        assert!(!conversation.apply_preview(&older));
        assert_eq!(conversation.last_message.as_ref().unwrap().preview, "new");

        let mut file = newer.clone();
        file.kind = MessageKind::File;
        file.created_at = newer.created_at + chrono::Duration::seconds(1);
        assert!(conversation.apply_preview(&file));
        assert_eq!(conversation.last_message.unwrap().preview, "Sent a file");
    }
}
