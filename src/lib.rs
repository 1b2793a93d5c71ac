//! Peer-to-peer coordination for a turn passing game ("hand the bomb to a random peer before
//!  it explodes") over plain UDP.
//!
//! Layers, bottom up:
//! * [messaging] - the datagram wire format, the UDP transport and the [messaging::messenger::Messenger]
//!   which correlates every tracked send with its ack or a timeout
//! * [session] - a session on a local port, republishing the messenger's outcomes as events
//! * [game] - the game's JSON application protocol and peer bookkeeping

pub mod config;
pub mod game;
pub mod messaging;
pub mod session;
pub mod test_util;
pub mod util;
