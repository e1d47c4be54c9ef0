//! Per-room chat: a hub task fanning messages out to registered clients.

mod hub;

pub use hub::{ChatClient, ChatHub};

use std::time::Duration;

/// Time allowed to write a frame to the peer
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Time allowed to read the next pong from the peer
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping interval; must be less than `PONG_WAIT`
pub const PING_PERIOD: Duration = Duration::from_secs(54);
/// Maximum inbound chat frame size in bytes
pub const MAX_MESSAGE_SIZE: usize = 512;
/// Per-client outbound queue depth; overflow evicts the client
pub const CLIENT_QUEUE: usize = 64;
