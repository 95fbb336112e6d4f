//! The cache agent: install, activate and fetch-intercept handlers.

use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, ResponseSource};
use crate::config::Config;
use crate::event::{FetchDisposition, Intercepted, LifecycleHandler, WorkerHost};
use crate::http::{Request, RequestKey, Response, ResponseType};
use crate::net::Fetcher;

/// Resolution policy chosen per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
  /// Cache, then network, then an empty 503
  Audio,
  /// Cache, then network (caching only same-origin 200s), then offline fallback
  Default,
}

/// Cache agent bound to one version tag.
pub struct CacheAgent<S: CacheStorage, F: Fetcher> {
  cache: CacheLayer<S>,
  fetcher: Arc<F>,
  assets: Vec<Url>,
  root_document: Url,
  audio_extension: String,
  offline_message: String,
}

impl<S, F> CacheAgent<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher,
{
  pub fn new(config: &Config, storage: Arc<S>, fetcher: Arc<F>) -> Result<Self> {
    Ok(Self {
      cache: CacheLayer::new(storage, config.version.clone()),
      fetcher,
      assets: config.resolve_assets()?,
      root_document: config.root_document_url()?,
      audio_extension: config.audio_extension.clone(),
      offline_message: config.offline_message.clone(),
    })
  }

  /// The current version tag (also the bucket name).
  pub fn version(&self) -> &str {
    self.cache.bucket()
  }

  pub fn assets(&self) -> &[Url] {
    &self.assets
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  /// Pre-cache the static asset list into the current bucket.
  pub async fn precache(&self) -> Result<()> {
    info!(
      bucket = self.version(),
      count = self.assets.len(),
      "pre-caching static assets"
    );
    self.cache.open()?;
    self.cache.add_all(self.fetcher.as_ref(), &self.assets).await
  }

  /// Delete every bucket except the current one. Returns the deleted names.
  ///
  /// Every stale bucket is attempted; the first failure is returned after
  /// the rest have been tried.
  pub fn purge_stale(&self) -> Result<Vec<String>> {
    let storage = self.cache.storage();
    let mut deleted = Vec::new();
    let mut first_error = None;

    for name in storage.keys()? {
      if name == self.version() {
        continue;
      }
      info!(bucket = %name, "deleting stale cache");
      match storage.delete(&name) {
        Ok(true) => deleted.push(name),
        Ok(false) => {}
        Err(e) => {
          warn!(bucket = %name, "failed to delete stale cache: {e}");
          first_error.get_or_insert(e);
        }
      }
    }

    match first_error {
      Some(e) => Err(e),
      None => Ok(deleted),
    }
  }

  /// Pick the resolution policy for a request.
  pub fn policy_for(&self, request: &Request) -> Policy {
    if request.url.path().ends_with(&self.audio_extension) {
      Policy::Audio
    } else {
      Policy::Default
    }
  }

  /// Intercept a request. Only GET requests are answered.
  pub async fn handle_fetch(&self, request: &Request) -> FetchDisposition {
    if request.method != Method::GET {
      debug!(method = %request.method, url = %request.url, "not intercepting");
      return FetchDisposition::Passthrough;
    }

    let intercepted = match self.policy_for(request) {
      Policy::Audio => self.resolve_audio(request).await,
      Policy::Default => self.resolve_default(request).await,
    };

    FetchDisposition::RespondWith(intercepted)
  }

  async fn resolve_audio(&self, request: &Request) -> Intercepted {
    if let Some(cached) = self.cache.lookup(request) {
      return Intercepted::new(cached, ResponseSource::Cache);
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.status == 200 {
          let task = self.cache.store_in_background(request.key(), response.clone());
          Intercepted::new(response, ResponseSource::Network).with_populate(task)
        } else {
          Intercepted::new(response, ResponseSource::Network)
        }
      }
      Err(e) => {
        warn!(url = %request.url, "audio unavailable offline: {e}");
        Intercepted::new(Response::service_unavailable(""), ResponseSource::Synthetic)
      }
    }
  }

  async fn resolve_default(&self, request: &Request) -> Intercepted {
    if let Some(cached) = self.cache.lookup(request) {
      return Intercepted::new(cached, ResponseSource::Cache);
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        // Error pages and cross-origin responses are never cached
        if response.status != 200 || response.response_type != ResponseType::Basic {
          return Intercepted::new(response, ResponseSource::Network);
        }
        let task = self.cache.store_in_background(request.key(), response.clone());
        Intercepted::new(response, ResponseSource::Network).with_populate(task)
      }
      Err(e) => {
        warn!(url = %request.url, "network unavailable: {e}");
        self.offline_fallback(request)
      }
    }
  }

  fn offline_fallback(&self, request: &Request) -> Intercepted {
    if request.is_navigation() {
      if let Some(root) = self.cache.lookup_key(&RequestKey::get(&self.root_document)) {
        return Intercepted::new(root, ResponseSource::OfflineFallback);
      }
    }

    let response = Response::service_unavailable(self.offline_message.as_bytes())
      .with_header("Content-Type", "text/plain; charset=utf-8");
    Intercepted::new(response, ResponseSource::Synthetic)
  }
}

impl<S, F> LifecycleHandler for CacheAgent<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher,
{
  fn install<'a>(&'a self, host: &'a dyn WorkerHost) -> BoxFuture<'a, Result<()>> {
    async move {
      host.skip_waiting();
      if let Err(e) = self.precache().await {
        error!(bucket = self.version(), "failed to pre-cache assets: {e}");
        return Err(e);
      }
      Ok(())
    }
    .boxed()
  }

  fn activate<'a>(&'a self, host: &'a dyn WorkerHost) -> BoxFuture<'a, Result<()>> {
    async move {
      let result = self.purge_stale();
      host.claim_clients();
      result.map(|_| ())
    }
    .boxed()
  }

  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, FetchDisposition> {
    self.handle_fetch(request).boxed()
  }
}
