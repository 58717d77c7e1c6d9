//! Cloud capability data model
//!
//! Types exchanged with the cloud provider gateway: instance type quotas,
//! running instance descriptions and login key pairs.

pub mod models;

pub use models::*;
