//! Scroll position bookkeeping across list mutations.

use crate::config::ScrollConfig;
use crate::messaging::{ListChange, MessageId};

use super::sections::UnreadMarker;

/// Scroll metrics reported by the host, in pixels
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Viewport {
    /// Distance scrolled from the top
    pub offset: f64,
    /// Total height of the rendered list
    pub content_height: f64,
    /// Visible height
    pub viewport_height: f64,
}

impl Viewport {
    pub fn new(offset: f64, content_height: f64, viewport_height: f64) -> Self {
        Self {
            offset,
            content_height,
            viewport_height,
        }
    }

    pub fn distance_from_bottom(&self) -> f64 {
        (self.content_height - self.offset - self.viewport_height).max(0.0)
    }

    /// Offset that shows the end of the list
    pub fn bottom_offset(&self) -> f64 {
        (self.content_height - self.viewport_height).max(0.0)
    }

    fn shows(&self, y: f64) -> bool {
        y >= self.offset && y <= self.offset + self.viewport_height
    }
}

/// What the host should do with its scroll position
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollAction {
    ToBottom,
    SetOffset(f64),
    Keep,
}

/// Jump-to-unread affordance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadJump {
    pub target: MessageId,
    /// False while the marker row is already on screen
    pub show: bool,
}

/// Tracks the viewport of one message list
#[derive(Debug, Clone)]
pub struct ScrollCoordinator {
    config: ScrollConfig,
    viewport: Viewport,
    new_messages: usize,
}

impl ScrollCoordinator {
    pub fn new(config: ScrollConfig) -> Self {
        Self {
            config,
            viewport: Viewport::default(),
            new_messages: 0,
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Messages from others that arrived while scrolled away from the bottom
    pub fn new_message_count(&self) -> usize {
        self.new_messages
    }

    pub fn is_near_bottom(&self) -> bool {
        self.viewport.distance_from_bottom() <= self.config.bottom_threshold_px
    }

    /// Record a scroll or resize. Reaching the bottom clears the counter.
    pub fn on_scroll(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        if self.is_near_bottom() {
            self.new_messages = 0;
        }
    }

    /// Decide where to scroll after the list changed and re-rendered with
    /// `content_height`.
    pub fn after_change(&mut self, change: ListChange, content_height: f64) -> ScrollAction {
        let before = self.viewport;
        let was_near_bottom = self.is_near_bottom();
        self.viewport.content_height = content_height;

        let action = match change {
            ListChange::Reset => {
                self.new_messages = 0;
                ScrollAction::ToBottom
            }
            ListChange::Appended { by_self: true, .. } => ScrollAction::ToBottom,
            ListChange::Appended { count, .. } => {
                if was_near_bottom {
                    ScrollAction::ToBottom
                } else {
                    self.new_messages += count;
                    ScrollAction::Keep
                }
            }
            ListChange::Prepended { count } if count > 0 => {
                let delta = content_height - before.content_height;
                ScrollAction::SetOffset(before.offset + delta)
            }
            ListChange::Prepended { .. } | ListChange::Updated => ScrollAction::Keep,
        };

        match action {
            ScrollAction::ToBottom => {
                self.viewport.offset = self.viewport.bottom_offset();
                self.new_messages = 0;
            }
            ScrollAction::SetOffset(offset) => self.viewport.offset = offset,
            ScrollAction::Keep => {}
        }
        tracing::trace!(?change, ?action, "Scroll anchor");
        action
    }

    /// Whether an older page should be requested now
    pub fn should_load_more(&self, has_more: bool, loading: bool) -> bool {
        has_more && !loading && self.viewport.offset <= self.config.top_threshold_px
    }

    /// Jump affordance for `marker`. `marker_y` is the rendered position of
    /// the marker row, if the host has measured it.
    pub fn unread_jump(&self, marker: Option<&UnreadMarker>, marker_y: Option<f64>) -> Option<UnreadJump> {
        let marker = marker?;
        let on_screen = marker_y.map_or(false, |y| self.viewport.shows(y));
        Some(UnreadJump {
            target: marker.message_id.clone(),
            show: !on_screen,
        })
    }
}
