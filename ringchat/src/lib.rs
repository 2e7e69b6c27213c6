//! `RingChat`: group chat over a self-organizing ring of peers.

pub mod config;
pub mod link;
pub mod node;
