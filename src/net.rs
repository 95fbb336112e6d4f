//! Network capability used by the agent.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use url::{Origin, Url};

use crate::http::{Request, RequestMode, Response, ResponseType};

/// Something that can answer a request from the network.
///
/// An `Err` means the request never produced a response (no connectivity,
/// DNS failure, TLS failure...). HTTP error statuses are `Ok` responses.
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;
}

/// Fetcher backed by a reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Origin,
}

impl HttpFetcher {
  /// Create a fetcher whose same-origin checks are made against `scope`.
  pub fn new(scope: &Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("asset-agent/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: scope.origin(),
    })
  }

  async fn send(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let final_url = response.url().clone();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
      response_type: classify(&self.origin, &final_url, request.mode),
      url: Some(final_url.into()),
    })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    self.send(request).boxed()
  }
}

/// Classify a response by where it was finally served from.
pub fn classify(origin: &Origin, url: &Url, mode: RequestMode) -> ResponseType {
  if url.origin() == *origin {
    ResponseType::Basic
  } else if mode == RequestMode::NoCors {
    ResponseType::Opaque
  } else {
    ResponseType::Cors
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classify_same_origin_is_basic() {
    let scope = Url::parse("http://localhost:8080/").unwrap();
    let url = Url::parse("http://localhost:8080/index.html").unwrap();
    assert_eq!(
      classify(&scope.origin(), &url, RequestMode::SameOrigin),
      ResponseType::Basic
    );
    assert_eq!(
      classify(&scope.origin(), &url, RequestMode::Navigate),
      ResponseType::Basic
    );
  }

  #[test]
  fn test_classify_cross_origin() {
    let scope = Url::parse("http://localhost:8080/").unwrap();
    let cdn = Url::parse("https://cdnjs.cloudflare.com/normalize.min.css").unwrap();
    assert_eq!(
      classify(&scope.origin(), &cdn, RequestMode::Cors),
      ResponseType::Cors
    );
    assert_eq!(
      classify(&scope.origin(), &cdn, RequestMode::NoCors),
      ResponseType::Opaque
    );
  }

  #[test]
  fn test_classify_port_matters() {
    let scope = Url::parse("http://localhost:8080/").unwrap();
    let other = Url::parse("http://localhost:9090/index.html").unwrap();
    assert_eq!(
      classify(&scope.origin(), &other, RequestMode::SameOrigin),
      ResponseType::Cors
    );
  }
}
