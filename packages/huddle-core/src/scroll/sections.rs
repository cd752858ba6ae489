//! Date sections and the first-unread marker.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

use crate::messaging::{Message, MessageId};
use crate::time::day_key;

/// Heading shown above a day's messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionLabel {
    Today,
    Yesterday,
    Date(NaiveDate),
}

impl SectionLabel {
    fn for_day(day: NaiveDate, today: NaiveDate) -> Self {
        if day == today {
            SectionLabel::Today
        } else if today.pred_opt() == Some(day) {
            SectionLabel::Yesterday
        } else {
            SectionLabel::Date(day)
        }
    }
}

impl fmt::Display for SectionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionLabel::Today => f.write_str("Today"),
            SectionLabel::Yesterday => f.write_str("Yesterday"),
            SectionLabel::Date(day) => write!(f, "{}", day.format("%A, %B %-d, %Y")),
        }
    }
}

/// Consecutive messages sharing a calendar day
#[derive(Debug, Clone, PartialEq)]
pub struct DateSection {
    pub day: NaiveDate,
    pub label: SectionLabel,
    pub messages: Vec<Message>,
}

/// Split a sorted list into per-day sections.
///
/// Days are taken in `offset`, the viewer's local offset; `today` must be
/// in the same offset.
pub fn group_by_date(messages: &[Message], today: NaiveDate, offset: FixedOffset) -> Vec<DateSection> {
    let mut sections: Vec<DateSection> = Vec::new();
    for message in messages {
        let day = day_key(message.created_at, offset);
        match sections.last_mut() {
            Some(section) if section.day == day => section.messages.push(message.clone()),
            _ => sections.push(DateSection {
                day,
                label: SectionLabel::for_day(day, today),
                messages: vec![message.clone()],
            }),
        }
    }
    sections
}

/// Where the unread region starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadMarker {
    pub message_id: MessageId,
    /// Unread messages from others at or after the marker
    pub unread_count: usize,
}

/// First message from someone else created after `last_read_at`.
///
/// With no `last_read_at` every message from others counts as unread.
pub fn first_unread(
    messages: &[Message],
    last_read_at: Option<DateTime<Utc>>,
    self_id: &str,
) -> Option<UnreadMarker> {
    let mut unread = messages
        .iter()
        .filter(|m| !m.is_from(self_id))
        .filter(|m| last_read_at.map_or(true, |at| m.created_at > at));

    let first = unread.next()?;
    Some(UnreadMarker {
        message_id: first.id.clone(),
        unread_count: 1 + unread.count(),
    })
}
