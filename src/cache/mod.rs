//! Versioned bucket cache for request/response pairs.
//!
//! This module provides:
//! - A storage trait for named buckets keyed by request identity
//! - SQLite (persistent) and in-memory backends
//! - A bucket-bound layer for lookups, bulk pre-caching and background writes

mod layer;
mod storage;
mod traits;

pub use layer::{CacheLayer, PopulateTask};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{ResponseSource, StoredResponse};
