//! Request and response model shared by the agent, the cache and the network layer.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// How the page issued a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Full-page load of a document
  Navigate,
  /// Same-origin sub-resource
  #[default]
  SameOrigin,
  /// Cross-origin request with CORS
  Cors,
  /// Cross-origin request without CORS (yields opaque responses)
  NoCors,
}

/// An outgoing request seen by the agent.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      mode: RequestMode::default(),
      headers: Vec::new(),
    }
  }

  /// Shorthand for a same-origin GET.
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Identity under which this request is cached.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(self.method.clone(), &self.url)
  }
}

/// Request identity used as the bucket key: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: Method,
  url: String,
}

impl RequestKey {
  pub fn new(method: Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method,
      url: url.into(),
    }
  }

  pub fn get(url: &Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Stable, fixed-length hash for storage.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Classification of a response relative to the agent's origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin response, safe to reuse
  #[default]
  Basic,
  /// Cross-origin response obtained with CORS
  Cors,
  /// Cross-origin response whose contents are hidden
  Opaque,
  /// Network error placeholder
  Error,
  /// Built locally by the agent
  Synthetic,
}

/// A response snapshot. Cloning yields an independent copy of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub response_type: ResponseType,
  /// Final URL the response was served from, if it came from the network
  pub url: Option<String>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      response_type: ResponseType::Basic,
      url: None,
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_type(mut self, response_type: ResponseType) -> Self {
    self.response_type = response_type;
    self
  }

  pub fn with_url(mut self, url: impl Into<String>) -> Self {
    self.url = Some(url.into());
    self
  }

  /// 503 built by the agent when neither cache nor network can answer.
  pub fn service_unavailable(body: impl Into<Vec<u8>>) -> Self {
    Self::new(503, body).with_type(ResponseType::Synthetic)
  }

  /// True for any 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Body as UTF-8 text, lossily.
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}
