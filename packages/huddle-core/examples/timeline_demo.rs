//! # Timeline Demo
//!
//! Runs the message-list side of the crate without a server:
//! 1. Two pages of history arrive out of order and are merged
//! 2. The scroll coordinator anchors across the prepend
//! 3. The list is split into date sections with an unread marker
//!
//! ## Run
//!
//! ```bash
//! cargo run --example timeline_demo
//! ```

use chrono::{Duration, FixedOffset, Utc};
use huddle_core::backend::{MessageRecord, SenderField, TimestampField};
use huddle_core::messaging::{ListChange, Message, MessageCache, MessageKind};
use huddle_core::scroll::{first_unread, group_by_date, ScrollCoordinator, Viewport};
use huddle_core::HuddleConfig;

fn record(id: &str, sender: &str, content: &str, hours_ago: i64) -> MessageRecord {
    MessageRecord {
        id: id.to_string(),
        conversation_id: "general".to_string(),
        sender: SenderField::Id(sender.to_string()),
        content: content.to_string(),
        kind: MessageKind::Text,
        created_at: TimestampField::Millis((Utc::now() - Duration::hours(hours_ago)).timestamp_millis()),
        read_by: Vec::new(),
    }
}

fn main() {
    huddle_core::logging::init_logging();

    println!("=================================================");
    println!("            HUDDLE TIMELINE DEMO");
    println!("=================================================\n");

    let config = HuddleConfig::from_env();
    println!("Page size: {}\n", config.sync.page_size);

    // =========================================================================
    // STEP 1: Merge two pages, newest page first
    // =========================================================================
    println!("1. Merging history pages...\n");

    let mut cache = MessageCache::new();
    let newest: Vec<Message> = vec![
        record("m4", "ana", "Standup in 5", 1),
        record("m3", "me", "On my way", 2),
    ]
    .into_iter()
    .filter_map(|r| Message::from_record(r).ok())
    .collect();
    let older: Vec<Message> = vec![
        record("m2", "ana", "Did the deploy go out?", 26),
        record("m1", "ben", "Morning all", 50),
        record("m3", "me", "On my way", 2),
    ]
    .into_iter()
    .filter_map(|r| Message::from_record(r).ok())
    .collect();

    println!("   First page added:  {}", cache.merge("general", newest));
    println!("   Older page added:  {} (duplicate skipped)", cache.merge("general", older));
    let messages = cache.snapshot("general").unwrap_or_default();
    for message in &messages {
        println!("   [{}] {}: {}", message.id, message.sender.id, message.content);
    }
    println!();

    // =========================================================================
    // STEP 2: Keep the viewport still while the older page lands on top
    // =========================================================================
    println!("2. Anchoring scroll position...\n");

    let mut scroll = ScrollCoordinator::new(config.scroll.clone());
    scroll.on_scroll(Viewport::new(20.0, 400.0, 600.0));
    println!("   Load more? {}", scroll.should_load_more(true, false));
    let action = scroll.after_change(ListChange::Prepended { count: 2 }, 640.0);
    println!("   After prepend: {:?}\n", action);

    // =========================================================================
    // STEP 3: Date sections and unread marker
    // =========================================================================
    println!("3. Building sections...\n");

    let offset = FixedOffset::east_opt(0).expect("UTC offset");
    let today = Utc::now().with_timezone(&offset).date_naive();
    for section in group_by_date(&messages, today, offset) {
        println!("   -- {} ({} messages)", section.label, section.messages.len());
    }

    let last_read = Utc::now() - Duration::hours(30);
    if let Some(marker) = first_unread(&messages, Some(last_read), "me") {
        println!("\n   First unread: {} ({} unread)", marker.message_id, marker.unread_count);
    }

    println!("\n=================================================");
    println!("                 DEMO COMPLETE");
    println!("=================================================");
}
