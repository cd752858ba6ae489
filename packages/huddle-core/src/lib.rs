//! # Huddle Core
//!
//! Client-side real-time layer of the Huddle team chat: keeps conversation
//! history consistent across reconnects, pagination and optimistic sends,
//! and drives multi-party audio/video call signaling over the same push
//! channel.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         HUDDLE CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │                      ┌──────────────────────┐                           │
//! │                      │     HuddleClient     │                           │
//! │                      └──────────┬───────────┘                           │
//! │            ┌────────────────────┼────────────────────┐                  │
//! │            ▼                    ▼                    ▼                  │
//! │  ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐         │
//! │  │    Messaging     │ │      Scroll      │ │      Calls       │         │
//! │  │                  │ │                  │ │                  │         │
//! │  │ - Page loads     │ │ - Anchoring      │ │ - Local media    │         │
//! │  │ - Optimistic     │ │ - Unread marker  │ │ - Peer per user  │         │
//! │  │ - Read receipts  │ │ - Date sections  │ │ - Screen share   │         │
//! │  └────────┬─────────┘ └──────────────────┘ └────────┬─────────┘         │
//! │           │                                         │                   │
//! │           ├──────────────────┬──────────────────────┤                   │
//! │           ▼                  ▼                      ▼                   │
//! │  ┌──────────────────┐ ┌─────────────────────────────────────┐           │
//! │  │     Backend      │ │                Push                 │           │
//! │  │                  │ │                                     │           │
//! │  │ - REST (reqwest) │ │ - One channel per identity          │           │
//! │  │ - Call lifecycle │ │ - Reconnect with backoff            │           │
//! │  └──────────────────┘ │ - WebSocket (tokio-tungstenite)     │           │
//! │                       └─────────────────────────────────────┘           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error type and classification
//! - [`config`] - Tunables, file and environment loading
//! - [`logging`] - tracing subscriber setup
//! - [`time`] - Timestamp parsing and calendar days
//! - [`backend`] - REST collaborator traits and HTTP implementation
//! - [`push`] - Push channel and connection manager
//! - [`messaging`] - Message cache and conversation sync
//! - [`scroll`] - Scroll anchoring, unread marker, date sections
//! - [`calls`] - Call signaling engine
//! - [`client`] - Facade that wires everything for one identity

#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod backend;
pub mod calls;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod push;
pub mod scroll;
pub mod time;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use client::{Collaborators, HuddleClient};
pub use config::HuddleConfig;
pub use error::{Error, ErrorClass, Result};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Huddle Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns build information for debugging
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        #[cfg(target_os = "macos")]
        target: "macos",
        #[cfg(target_os = "linux")]
        target: "linux",
        #[cfg(target_os = "windows")]
        target: "windows",
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        target: "unknown",
        profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    }
}

/// Build information for debugging
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Crate version
    pub version: &'static str,
    /// Target OS
    pub target: &'static str,
    /// Build profile (debug/release)
    pub profile: &'static str,
}

// ============================================================================
// TESTS
// ============================================================================
