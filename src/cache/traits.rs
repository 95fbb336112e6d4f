//! Core types for the bucket cache.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// A response stored in a bucket.
#[derive(Debug, Clone)]
pub struct StoredResponse {
  /// The cached response snapshot
  pub response: Response,
  /// When the response was written
  pub cached_at: DateTime<Utc>,
}

impl StoredResponse {
  pub fn new(response: Response) -> Self {
    Self {
      response,
      cached_at: Utc::now(),
    }
  }
}

/// Indicates where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Served from the current bucket without touching the network
  Cache,
  /// Fetched from the network (possibly being cached in the background)
  Network,
  /// Network failed, served the cached root document instead
  OfflineFallback,
  /// Network failed and nothing usable was cached; built locally
  Synthetic,
}

impl std::fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Cache => "cache",
      Self::Network => "network",
      Self::OfflineFallback => "offline-fallback",
      Self::Synthetic => "synthetic",
    };
    f.write_str(s)
  }
}
