//! Core building blocks for the huddle conferencing server.
//!
//! This crate carries everything that is independent of the WebRTC stack:
//! identifiers, the signaling envelope and per-client writer, the chat hub,
//! the room policy state (host/co-host controls, locks, waiting room,
//! recording, raised hands), configuration and logging setup.

pub mod chat;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod policy;
pub mod signal;

pub use config::Config;
pub use error::{Error, Result};
