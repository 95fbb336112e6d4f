//! Bucket-bound cache handle used by the agent's handlers.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use super::storage::CacheStorage;
use crate::http::{Request, RequestKey, Response};
use crate::net::Fetcher;

/// Cache layer bound to one bucket of a shared storage backend.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  bucket: String,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  pub fn new(storage: Arc<S>, bucket: impl Into<String>) -> Self {
    Self {
      storage,
      bucket: bucket.into(),
    }
  }

  pub fn bucket(&self) -> &str {
    &self.bucket
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Open the bucket, creating it if absent.
  pub fn open(&self) -> Result<()> {
    self.storage.open(&self.bucket)
  }

  /// Look up a request in the bucket.
  ///
  /// Storage errors are logged and reported as a miss.
  pub fn lookup(&self, request: &Request) -> Option<Response> {
    self.lookup_key(&request.key())
  }

  pub fn lookup_key(&self, key: &RequestKey) -> Option<Response> {
    match self.storage.match_request(&self.bucket, key) {
      Ok(Some(stored)) => {
        debug!(%key, bucket = %self.bucket, "cache hit");
        Some(stored.response)
      }
      Ok(None) => {
        debug!(%key, bucket = %self.bucket, "cache miss");
        None
      }
      Err(e) => {
        warn!(%key, bucket = %self.bucket, "cache lookup failed: {e}");
        None
      }
    }
  }

  /// Write a response into the bucket on a separate task.
  ///
  /// The write outlives the caller: dropping the returned task does not
  /// cancel it. Failures are logged and swallowed.
  pub fn store_in_background(&self, key: RequestKey, response: Response) -> PopulateTask {
    let storage = Arc::clone(&self.storage);
    let bucket = self.bucket.clone();

    let handle = tokio::task::spawn_blocking(move || {
      match storage.put(&bucket, &key, &response) {
        Ok(()) => debug!(%key, %bucket, "cached response"),
        Err(e) => warn!(%key, %bucket, "failed to cache response: {e}"),
      }
    });

    PopulateTask { handle }
  }

  /// Fetch every URL, then store each response under its GET identity.
  ///
  /// All fetches must succeed with a 2xx status before anything is written.
  /// A storage failure part-way through leaves earlier writes in place.
  pub async fn add_all<F: Fetcher + ?Sized>(&self, fetcher: &F, urls: &[Url]) -> Result<()> {
    let requests: Vec<Request> = urls.iter().cloned().map(Request::get).collect();

    let responses = try_join_all(requests.iter().map(|request| async move {
      let response = fetcher.fetch(request).await?;
      if !response.is_ok() {
        return Err(eyre!(
          "Failed to fetch {}: status {}",
          request.url,
          response.status
        ));
      }
      Ok::<Response, color_eyre::Report>(response)
    }))
    .await?;

    self.open()?;
    for (request, response) in requests.iter().zip(responses) {
      self.storage.put(&self.bucket, &request.key(), &response)?;
    }

    Ok(())
  }
}

/// Handle to a background cache write.
#[derive(Debug)]
pub struct PopulateTask {
  handle: JoinHandle<()>,
}

impl PopulateTask {
  /// Wait for the write to finish. Never fails: write errors were already
  /// logged by the task itself.
  pub async fn settled(self) {
    if let Err(e) = self.handle.await {
      warn!("cache population task did not complete: {e}");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use futures::future::BoxFuture;
  use futures::FutureExt;

  struct StaticFetcher;

  impl Fetcher for StaticFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
      async move {
        match request.url.path() {
          "/missing.css" => Ok(Response::new(404, "not found")),
          "/offline.css" => Err(eyre!("connection refused")),
          path => Ok(Response::new(200, path.to_string())),
        }
      }
      .boxed()
    }
  }

  fn urls(paths: &[&str]) -> Vec<Url> {
    let base = Url::parse("http://localhost:8080/").unwrap();
    paths.iter().map(|p| base.join(p).unwrap()).collect()
  }

  #[tokio::test]
  async fn test_add_all_stores_every_url() {
    let layer = CacheLayer::new(Arc::new(MemoryStorage::new()), "v1");
    let list = urls(&["./", "./index.html", "style.css"]);

    layer.add_all(&StaticFetcher, &list).await.unwrap();

    for url in &list {
      let hit = layer.lookup_key(&RequestKey::get(url)).unwrap();
      assert_eq!(hit.text(), url.path());
    }
    assert_eq!(layer.storage().len("v1").unwrap(), 3);
  }

  #[tokio::test]
  async fn test_add_all_fails_on_error_status() {
    let layer = CacheLayer::new(Arc::new(MemoryStorage::new()), "v1");
    let result = layer
      .add_all(&StaticFetcher, &urls(&["index.html", "missing.css"]))
      .await;
    assert!(result.is_err());
    assert_eq!(layer.storage().len("v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_add_all_fails_on_network_error() {
    let layer = CacheLayer::new(Arc::new(MemoryStorage::new()), "v1");
    let result = layer
      .add_all(&StaticFetcher, &urls(&["index.html", "offline.css"]))
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_store_in_background_completes_after_drop() {
    let layer = CacheLayer::new(Arc::new(MemoryStorage::new()), "v1");
    let key = RequestKey::get(&urls(&["a.css"])[0]);

    let task = layer.store_in_background(key.clone(), Response::new(200, "a{}"));
    task.settled().await;
    assert!(layer.lookup_key(&key).is_some());

    let key_b = RequestKey::get(&urls(&["b.css"])[0]);
    drop(layer.store_in_background(key_b.clone(), Response::new(200, "b{}")));
    for _ in 0..100 {
      if layer.lookup_key(&key_b).is_some() {
        return;
      }
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("detached write never landed");
  }
}
