//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::StoredResponse;
use crate::http::{RequestKey, Response, ResponseType};

/// Trait for bucket storage backends.
///
/// A backend holds any number of named buckets. Each bucket maps a request
/// identity to one stored response. Writes to the same key replace the
/// previous entry, so concurrent writers resolve as last-writer-wins.
pub trait CacheStorage: Send + Sync {
  /// Open a bucket, creating it if absent.
  fn open(&self, bucket: &str) -> Result<()>;

  /// Whether a bucket exists.
  fn has(&self, bucket: &str) -> Result<bool>;

  /// Bucket names in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a bucket and everything in it. Returns false if it did not exist.
  fn delete(&self, bucket: &str) -> Result<bool>;

  /// Look up a stored response.
  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<StoredResponse>>;

  /// Store a response, creating the bucket if needed.
  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Number of entries in a bucket (0 if it does not exist).
  fn len(&self, bucket: &str) -> Result<usize>;
}

/// Buckets in creation order, each keyed by request hash.
type Buckets = Vec<(String, HashMap<String, StoredResponse>)>;

/// In-memory storage. Used by tests and as a throwaway store.
#[derive(Default)]
pub struct MemoryStorage {
  buckets: Mutex<Buckets>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Buckets>> {
    self
      .buckets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, bucket: &str) -> Result<()> {
    let mut buckets = self.lock()?;
    if !buckets.iter().any(|(name, _)| name == bucket) {
      buckets.push((bucket.to_string(), HashMap::new()));
    }
    Ok(())
  }

  fn has(&self, bucket: &str) -> Result<bool> {
    Ok(self.lock()?.iter().any(|(name, _)| name == bucket))
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.iter().map(|(name, _)| name.clone()).collect())
  }

  fn delete(&self, bucket: &str) -> Result<bool> {
    let mut buckets = self.lock()?;
    let before = buckets.len();
    buckets.retain(|(name, _)| name != bucket);
    Ok(buckets.len() != before)
  }

  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    let buckets = self.lock()?;
    Ok(
      buckets
        .iter()
        .find(|(name, _)| name == bucket)
        .and_then(|(_, entries)| entries.get(&key.cache_hash()))
        .cloned(),
    )
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut buckets = self.lock()?;
    let index = match buckets.iter().position(|(name, _)| name == bucket) {
      Some(index) => index,
      None => {
        buckets.push((bucket.to_string(), HashMap::new()));
        buckets.len() - 1
      }
    };
    buckets[index]
      .1
      .insert(key.cache_hash(), StoredResponse::new(response.clone()));
    Ok(())
  }

  fn len(&self, bucket: &str) -> Result<usize> {
    Ok(
      self
        .lock()?
        .iter()
        .find(|(name, _)| name == bucket)
        .map(|(_, entries)| entries.len())
        .unwrap_or(0),
    )
  }
}

/// SQLite-based bucket storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("asset-agent").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    let version: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

    // Earlier layouts kept the body inside the JSON; cached data is disposable
    if version < SCHEMA_VERSION {
      conn
        .execute_batch("DROP TABLE IF EXISTS entries;")
        .map_err(|e| eyre!("Failed to drop old cache entries: {}", e))?;
    }

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    conn
      .pragma_update(None, "user_version", SCHEMA_VERSION)
      .map_err(|e| eyre!("Failed to set schema version: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Current layout of the cache tables.
const SCHEMA_VERSION: i64 = 2;

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named buckets, ordered by creation
CREATE TABLE IF NOT EXISTS buckets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses: JSON head (status, headers, type) plus raw body
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    head TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_bucket ON entries(bucket);
"#;

impl CacheStorage for SqliteStorage {
  fn open(&self, bucket: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
        params![bucket],
      )
      .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;
    Ok(())
  }

  fn has(&self, bucket: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT id FROM buckets WHERE name = ?",
        params![bucket],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up bucket {}: {}", bucket, e))?;
    Ok(found.is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, bucket: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    let conn = self.lock()?;

    let row: Option<(String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT head, body, cached_at FROM entries WHERE bucket = ? AND key_hash = ?",
        params![bucket, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((head, body, cached_at_str)) => {
        let head: ResponseHead = serde_json::from_str(&head)
          .map_err(|e| eyre!("Failed to deserialize response for {}: {}", key, e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(StoredResponse {
          response: head.into_response(body),
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self.lock()?;
    let head = serde_json::to_string(&ResponseHead::from(response))
      .map_err(|e| eyre!("Failed to serialize response: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries (bucket, key_hash, method, url, status, head, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        bucket,
        key.cache_hash(),
        key.method().as_str(),
        key.url(),
        response.status,
        head,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn len(&self, bucket: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE bucket = ?",
        params![bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", bucket, e))?;
    Ok(count as usize)
  }
}

/// Response metadata stored next to the raw body.
#[derive(Serialize, Deserialize)]
struct ResponseHead {
  status: u16,
  headers: Vec<(String, String)>,
  #[serde(default)]
  response_type: ResponseType,
  #[serde(default)]
  url: Option<String>,
}

impl From<&Response> for ResponseHead {
  fn from(response: &Response) -> Self {
    Self {
      status: response.status,
      headers: response.headers.clone(),
      response_type: response.response_type,
      url: response.url.clone(),
    }
  }
}

impl ResponseHead {
  fn into_response(self, body: Vec<u8>) -> Response {
    Response {
      status: self.status,
      headers: self.headers,
      body,
      response_type: self.response_type,
      url: self.url,
    }
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    RequestKey::get(&Url::parse("http://localhost:8080/").unwrap().join(path).unwrap())
  }

  fn exercise(storage: &dyn CacheStorage) {
    storage.open("v1").unwrap();
    storage.open("v1").unwrap();
    storage.open("v2").unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["v1", "v2"]);
    assert!(storage.has("v1").unwrap());
    assert!(!storage.has("v3").unwrap());

    let page = Response::new(200, "<html></html>").with_header("Content-Type", "text/html");
    storage.put("v1", &key("index.html"), &page).unwrap();
    let hit = storage.match_request("v1", &key("index.html")).unwrap().unwrap();
    assert_eq!(hit.response, page);
    assert!(storage.match_request("v2", &key("index.html")).unwrap().is_none());
    assert_eq!(storage.len("v1").unwrap(), 1);

    // Same key replaces
    let newer = Response::new(200, "<html>new</html>");
    storage.put("v1", &key("index.html"), &newer).unwrap();
    let hit = storage.match_request("v1", &key("index.html")).unwrap().unwrap();
    assert_eq!(hit.response.body, newer.body);
    assert_eq!(storage.len("v1").unwrap(), 1);

    assert!(storage.delete("v1").unwrap());
    assert!(!storage.delete("v1").unwrap());
    assert!(storage.match_request("v1", &key("index.html")).unwrap().is_none());
    assert_eq!(storage.len("v1").unwrap(), 0);
    assert_eq!(storage.keys().unwrap(), vec!["v2"]);

    // Put implicitly creates the bucket
    storage.put("v3", &key("style.css"), &Response::new(200, "body{}")).unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["v2", "v3"]);
  }

  #[test]
  fn test_memory_storage() {
    exercise(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_storage() {
    exercise(&SqliteStorage::open_in_memory().unwrap());
  }

  #[test]
  fn test_sqlite_keeps_response_type_and_headers() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let res = Response::new(200, vec![0u8, 1, 2, 255])
      .with_header("Content-Type", "audio/mpeg")
      .with_type(crate::http::ResponseType::Cors)
      .with_url("https://cdn.example/track.mp3");
    storage.put("v1", &key("track.mp3"), &res).unwrap();

    let hit = storage.match_request("v1", &key("track.mp3")).unwrap().unwrap();
    assert_eq!(hit.response, res);
  }

  #[test]
  fn test_sqlite_body_is_stored_as_raw_blob() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let body: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
    let res = Response::new(200, body.clone()).with_header("Content-Type", "audio/mpeg");
    storage.put("v1", &key("track.mp3"), &res).unwrap();

    {
      let conn = storage.lock().unwrap();
      let (kind, len, head): (String, i64, String) = conn
        .query_row(
          "SELECT typeof(body), length(body), head FROM entries WHERE bucket = 'v1'",
          [],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
      assert_eq!(kind, "blob");
      assert_eq!(len as usize, body.len());
      assert!(!head.contains("body"));
      assert!(head.len() < 256);
    }

    let hit = storage.match_request("v1", &key("track.mp3")).unwrap().unwrap();
    assert_eq!(hit.response.body, body);
  }

  #[test]
  fn test_parse_datetime() {
    let dt = parse_datetime("2024-03-01 12:30:00").unwrap();
    assert_eq!(dt.to_rfc3339(), "2024-03-01T12:30:00+00:00");
    assert!(parse_datetime("yesterday").is_err());
  }
}
