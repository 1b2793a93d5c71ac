pub mod app_messages;
pub mod game_events;
pub mod p2p_api;
pub mod peer_directory;
