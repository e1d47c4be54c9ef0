//! Selective Forwarding Unit for the huddle conferencing server.
//!
//! Each participant publishes media over one peer connection; the SFU
//! terminates it and relays the RTP packets to every other participant in
//! the same room, renegotiating subscriber connections whenever the set of
//! relay tracks changes.
//!
//! - [`PeerSet`]: the per-room connection and relay-track registry
//! - [`Room`]: peer set + chat hub + policy state
//! - [`Registry`]: process-wide room and stream maps, keyframe dispatch
//! - [`Session`] / [`StreamSession`]: per-connection signaling state machines

mod peers;
mod registry;
mod room;
mod rtc;
mod session;

pub use peers::{PeerConnectionState, PeerSet};
pub use registry::Registry;
pub use room::{JoinDecision, Room};
pub use rtc::new_peer_connection;
pub use session::{Session, StreamSession};
