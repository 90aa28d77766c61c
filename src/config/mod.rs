//! Configuration
//!
//! [`AppConfig`] is persisted as JSON in the data directory by
//! [`ConfigStore`]; command line flags override it at start-up.

mod schema;
pub mod provision;
pub mod store;

pub use provision::{ensure_identity, register_device, Identity};
pub use schema::*;
pub use store::ConfigStore;
