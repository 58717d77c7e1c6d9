//! Agent control channel protocol
//!
//! One JSON document per WebSocket text frame:
//! `{"key": <shared secret>, "action": <string>, "data": <object|null>}`.

pub mod models;

pub use models::*;
