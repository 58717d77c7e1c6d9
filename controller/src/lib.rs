//! Spotforge Library
//!
//! Control plane that provisions a spot instance, bootstraps a game server
//! agent on it and supervises the deployment until teardown.

pub mod app;
pub mod channel;
pub mod cloud;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod filesys;
pub mod logs;
pub mod server;
pub mod storage;
pub mod transport;
pub mod utils;
pub mod workers;
