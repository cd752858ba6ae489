//! # Scroll & Unread
//!
//! Scroll anchoring, load-more triggering, the first-unread marker and date
//! sections. Nothing here renders; the host feeds in viewport metrics and
//! list changes and applies the returned [`ScrollAction`].
//!
//! ## Anchoring Rules
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ListChange                        Action                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Reset (first page, hydration)     ToBottom                             │
//! │  Appended, by self                 ToBottom                             │
//! │  Appended, by others, near bottom  ToBottom                             │
//! │  Appended, by others, scrolled up  Keep (+ new-message counter)         │
//! │  Prepended (older page)            SetOffset(offset + height delta)     │
//! │  Updated                           Keep                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod anchor;
mod sections;

pub use anchor::{ScrollAction, ScrollCoordinator, UnreadJump, Viewport};
pub use sections::{first_unread, group_by_date, DateSection, SectionLabel, UnreadMarker};
