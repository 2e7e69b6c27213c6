//! Shared protocol definitions for the `RingChat` wire format.

pub mod codec;
pub mod identity;
pub mod message;
pub mod presence;
