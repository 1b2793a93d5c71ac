pub mod p2p_manager;
pub mod session_events;
