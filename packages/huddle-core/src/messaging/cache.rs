//! Per-conversation message cache.
//!
//! Each conversation's list stays sorted ascending by `created_at`, with
//! arrival order (`seq`) as the tie-break, and never holds two entries with
//! the same id.

use std::collections::HashMap;

use super::model::{DeliveryState, Message, MessageId, PendingToken};

/// Saved pagination position for one conversation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCursor {
    /// Opaque token for the next older page
    pub next: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Default)]
struct ConversationLog {
    messages: Vec<Message>,
    next_seq: u64,
    cursor: PageCursor,
    /// Set once a fetched page has been merged
    loaded: bool,
}

impl ConversationLog {
    fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    fn push(&mut self, mut message: Message) {
        message.seq = self.next_seq;
        self.next_seq += 1;
        self.messages.push(message);
    }

    fn sort(&mut self) {
        self.messages
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
    }
}

/// Message lists keyed by conversation id, kept for the process lifetime
#[derive(Debug, Default)]
pub struct MessageCache {
    logs: HashMap<String, ConversationLog>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `conversation_id` has a list, loaded or not.
    ///
    /// An optimistic send creates the list before any page arrives.
    pub fn contains(&self, conversation_id: &str) -> bool {
        self.logs.contains_key(conversation_id)
    }

    /// Whether a fetched page has been merged for `conversation_id`
    pub fn is_loaded(&self, conversation_id: &str) -> bool {
        self.logs.get(conversation_id).map_or(false, |log| log.loaded)
    }

    /// Record that a fetched page was merged, creating the list if needed
    pub fn mark_loaded(&mut self, conversation_id: &str) {
        self.logs.entry(conversation_id.to_string()).or_default().loaded = true;
    }

    /// Copy of the sorted list
    pub fn snapshot(&self, conversation_id: &str) -> Option<Vec<Message>> {
        self.logs.get(conversation_id).map(|log| log.messages.clone())
    }

    pub fn len(&self, conversation_id: &str) -> usize {
        self.logs.get(conversation_id).map_or(0, |log| log.messages.len())
    }

    pub fn cursor(&self, conversation_id: &str) -> Option<PageCursor> {
        self.logs.get(conversation_id).map(|log| log.cursor.clone())
    }

    pub fn set_cursor(&mut self, conversation_id: &str, cursor: PageCursor) {
        self.logs
            .entry(conversation_id.to_string())
            .or_default()
            .cursor = cursor;
    }

    /// Merge messages in, skipping ids already present, then re-sort.
    ///
    /// Returns how many were added.
    pub fn merge(&mut self, conversation_id: &str, incoming: Vec<Message>) -> usize {
        let log = self.logs.entry(conversation_id.to_string()).or_default();
        let mut added = 0;
        for message in incoming {
            if log.contains(&message.id) {
                continue;
            }
            log.push(message);
            added += 1;
        }
        if added > 0 {
            log.sort();
        }
        added
    }

    /// Append an optimistic entry
    pub fn insert_optimistic(&mut self, message: Message) {
        let log = self
            .logs
            .entry(message.conversation_id.clone())
            .or_default();
        log.push(message);
        log.sort();
    }

    /// Replace the optimistic entry for `token` with its confirmed form.
    ///
    /// If the confirmed id is already cached (it arrived over the push
    /// channel first) the optimistic entry is dropped instead. Returns
    /// false if the token is unknown.
    pub fn confirm(&mut self, conversation_id: &str, token: PendingToken, confirmed: Message) -> bool {
        let Some(log) = self.logs.get_mut(conversation_id) else {
            return false;
        };
        let Some(index) = log.position(&MessageId::Pending(token)) else {
            return false;
        };

        if log.contains(&confirmed.id) {
            log.messages.remove(index);
            return true;
        }

        let seq = log.messages[index].seq;
        log.messages[index] = Message {
            seq,
            delivery: DeliveryState::Sent,
            ..confirmed
        };
        log.sort();
        true
    }

    /// Drop the optimistic entry for `token`
    pub fn remove_pending(&mut self, conversation_id: &str, token: PendingToken) -> bool {
        let Some(log) = self.logs.get_mut(conversation_id) else {
            return false;
        };
        match log.position(&MessageId::Pending(token)) {
            Some(index) => {
                log.messages.remove(index);
                true
            }
            None => false,
        }
    }

    /// Add `user_id` to the read-by set of each listed server id
    pub fn mark_read(&mut self, conversation_id: &str, ids: &[String], user_id: &str) {
        self.update_read(conversation_id, ids, |message| {
            message.read_by.insert(user_id.to_string());
        });
    }

    /// Undo [`MessageCache::mark_read`] for the listed ids
    pub fn revert_read(&mut self, conversation_id: &str, ids: &[String], user_id: &str) {
        self.update_read(conversation_id, ids, |message| {
            message.read_by.remove(user_id);
        });
    }

    fn update_read(&mut self, conversation_id: &str, ids: &[String], mut apply: impl FnMut(&mut Message)) {
        let Some(log) = self.logs.get_mut(conversation_id) else {
            return;
        };
        for message in log.messages.iter_mut() {
            if let Some(id) = message.server_id() {
                if ids.iter().any(|wanted| wanted == id) {
                    apply(message);
                }
            }
        }
    }
}
