//! Data layer module
//!
//! Handles all data persistence and caching:
//! - SQLite storage of followed sources and interest followers
//! - Source cache (volatile)

mod cache;
mod database;
mod models;

pub use cache::CachedSourceStorage;
pub use database::{Database, FollowerStorage, SourceStorage};
pub use models::*;
