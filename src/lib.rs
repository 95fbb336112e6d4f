//! Offline caching agent for a small static asset bundle.
//!
//! The agent pre-caches a fixed asset list into a versioned bucket on
//! install, drops older buckets on activate, and answers GET requests from
//! the bucket before falling back to the network.

pub mod agent;
pub mod cache;
pub mod config;
pub mod event;
pub mod http;
pub mod net;

pub use agent::{CacheAgent, Policy};
pub use config::Config;
