//! Wire records exchanged with the backend and mirrored over the push channel.

use serde::{Deserialize, Serialize};

use crate::messaging::MessageKind;

/// A message as the backend serializes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "conversation")]
    pub conversation_id: String,
    pub sender: SenderField,
    #[serde(default)]
    pub content: String,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
    pub created_at: TimestampField,
    #[serde(default)]
    pub read_by: Vec<ReadByField>,
}

/// Sender is either a bare user id or a populated profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SenderField {
    Id(String),
    Profile {
        #[serde(alias = "_id")]
        id: String,
        #[serde(default)]
        name: Option<String>,
    },
}

/// Timestamps arrive as epoch millis or RFC 3339 text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimestampField {
    Millis(i64),
    Text(String),
}

/// Read-by entries are either user ids or `{ "user": id, ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadByField {
    Id(String),
    Entry {
        #[serde(alias = "_id", alias = "userId")]
        user: String,
    },
}

/// Response of the history endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessageRecord>,
    #[serde(default)]
    pub pagination: PaginationRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationRecord {
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Response of the call initiation endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    #[serde(alias = "_id")]
    pub room_id: String,
}
