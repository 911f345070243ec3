//! Configuration
//!
//! `AppConfig` is stored as one JSON document in SQLite and cached in memory.

mod schema;
mod store;

pub use schema::*;
pub use store::ConfigStore;
