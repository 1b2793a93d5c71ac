//! Utilities for testing code built on top of this crate. They are used for the crate's own
//!  tests, but they are also exported for application testing.

pub mod peers;
pub mod transport;
