pub mod envelope;
pub mod messenger;
pub mod transport;
