//! Typed lifecycle events and the host runtime they are dispatched from.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{PopulateTask, ResponseSource};
use crate::http::{Request, Response};

/// Lifecycle events delivered by the host
#[derive(Debug)]
pub enum Event {
  /// A new agent version is being installed
  Install,
  /// The installed version is taking over
  Activate,
  /// A page issued a request
  Fetch(Request),
}

/// Response produced by an intercepted request.
#[derive(Debug)]
pub struct Intercepted {
  pub response: Response,
  pub source: ResponseSource,
  /// Background cache write started for this response, if any
  pub populate: Option<PopulateTask>,
}

impl Intercepted {
  pub fn new(response: Response, source: ResponseSource) -> Self {
    Self {
      response,
      source,
      populate: None,
    }
  }

  pub fn with_populate(mut self, task: PopulateTask) -> Self {
    self.populate = Some(task);
    self
  }

  /// Wait for any background cache write to finish.
  pub async fn settled(mut self) -> Self {
    if let Some(task) = self.populate.take() {
      task.settled().await;
    }
    self
  }
}

/// What the agent decided to do with a request.
#[derive(Debug)]
pub enum FetchDisposition {
  /// The agent answers the request
  RespondWith(Intercepted),
  /// The agent does not intercept; the host sends the request itself
  Passthrough,
}

impl FetchDisposition {
  pub fn is_passthrough(&self) -> bool {
    matches!(self, Self::Passthrough)
  }

  pub fn into_intercepted(self) -> Option<Intercepted> {
    match self {
      Self::RespondWith(intercepted) => Some(intercepted),
      Self::Passthrough => None,
    }
  }
}

/// Result of dispatching one event.
#[derive(Debug)]
pub enum EventOutcome {
  Installed,
  Activated,
  Fetch(FetchDisposition),
}

/// Capabilities the host runtime offers to handlers.
pub trait WorkerHost: Send + Sync {
  /// Leave the waiting stage as soon as install completes.
  fn skip_waiting(&self);

  /// Take control of every open client without a reload.
  fn claim_clients(&self);
}

/// Handlers for the three lifecycle events.
///
/// The returned futures are the "extend lifetime" work: the host keeps the
/// agent alive until they resolve.
pub trait LifecycleHandler: Send + Sync {
  fn install<'a>(&'a self, host: &'a dyn WorkerHost) -> BoxFuture<'a, Result<()>>;

  fn activate<'a>(&'a self, host: &'a dyn WorkerHost) -> BoxFuture<'a, Result<()>>;

  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, FetchDisposition>;
}

/// Route an event to its handler.
pub async fn dispatch<H>(handler: &H, host: &dyn WorkerHost, event: Event) -> Result<EventOutcome>
where
  H: LifecycleHandler + ?Sized,
{
  match event {
    Event::Install => {
      handler.install(host).await?;
      Ok(EventOutcome::Installed)
    }
    Event::Activate => {
      handler.activate(host).await?;
      Ok(EventOutcome::Activated)
    }
    Event::Fetch(request) => Ok(EventOutcome::Fetch(handler.fetch(&request).await)),
  }
}

/// Lifecycle stage of an agent version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  /// Installed; waiting for old clients to close unless waiting was skipped
  Installed,
  Activating,
  Activated,
  /// Install failed; this version will never activate
  Redundant,
}

/// A host that tracks one agent version through its lifecycle.
pub struct Registration {
  state: Mutex<WorkerState>,
  skipped_waiting: AtomicBool,
  clients_claimed: AtomicBool,
}

impl Default for Registration {
  fn default() -> Self {
    Self::new()
  }
}

impl Registration {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(WorkerState::Parsed),
      skipped_waiting: AtomicBool::new(false),
      clients_claimed: AtomicBool::new(false),
    }
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    debug!(?state, "worker state");
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  pub fn skipped_waiting(&self) -> bool {
    self.skipped_waiting.load(Ordering::SeqCst)
  }

  pub fn clients_claimed(&self) -> bool {
    self.clients_claimed.load(Ordering::SeqCst)
  }

  /// Installed but held back until existing clients close.
  pub fn is_waiting(&self) -> bool {
    self.state() == WorkerState::Installed && !self.skipped_waiting()
  }

  /// Dispatch an event, updating the lifecycle stage around it.
  ///
  /// A failed install marks the version redundant, and a redundant version
  /// refuses to activate. Activation completes even if its cleanup failed;
  /// the error is still returned.
  pub async fn run<H>(&self, handler: &H, event: Event) -> Result<EventOutcome>
  where
    H: LifecycleHandler + ?Sized,
  {
    match event {
      Event::Install => {
        self.set_state(WorkerState::Installing);
        let result = dispatch(handler, self, Event::Install).await;
        self.set_state(if result.is_ok() {
          WorkerState::Installed
        } else {
          WorkerState::Redundant
        });
        result
      }
      Event::Activate => {
        if self.state() == WorkerState::Redundant {
          return Err(eyre!("Cannot activate a version whose install failed"));
        }
        self.set_state(WorkerState::Activating);
        let result = dispatch(handler, self, Event::Activate).await;
        self.set_state(WorkerState::Activated);
        result
      }
      event @ Event::Fetch(_) => dispatch(handler, self, event).await,
    }
  }
}

impl WorkerHost for Registration {
  fn skip_waiting(&self) {
    info!("skipping waiting stage");
    self.skipped_waiting.store(true, Ordering::SeqCst);
  }

  fn claim_clients(&self) {
    if self.clients_claimed.swap(true, Ordering::SeqCst) {
      warn!("clients already claimed");
    } else {
      info!("claimed open clients");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::FutureExt;
  use reqwest::Method;
  use url::Url;

  struct Stub {
    fail_install: bool,
  }

  impl LifecycleHandler for Stub {
    fn install<'a>(&'a self, host: &'a dyn WorkerHost) -> BoxFuture<'a, Result<()>> {
      async move {
        host.skip_waiting();
        if self.fail_install {
          Err(eyre!("asset unavailable"))
        } else {
          Ok(())
        }
      }
      .boxed()
    }

    fn activate<'a>(&'a self, host: &'a dyn WorkerHost) -> BoxFuture<'a, Result<()>> {
      async move {
        host.claim_clients();
        Ok(())
      }
      .boxed()
    }

    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, FetchDisposition> {
      async move {
        if request.method != Method::GET {
          return FetchDisposition::Passthrough;
        }
        FetchDisposition::RespondWith(Intercepted::new(
          Response::new(200, "ok"),
          ResponseSource::Cache,
        ))
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_lifecycle_states() {
    let reg = Registration::new();
    let stub = Stub {
      fail_install: false,
    };
    assert_eq!(reg.state(), WorkerState::Parsed);

    let outcome = reg.run(&stub, Event::Install).await.unwrap();
    assert!(matches!(outcome, EventOutcome::Installed));
    assert_eq!(reg.state(), WorkerState::Installed);
    assert!(reg.skipped_waiting());
    assert!(!reg.is_waiting());

    reg.run(&stub, Event::Activate).await.unwrap();
    assert_eq!(reg.state(), WorkerState::Activated);
    assert!(reg.clients_claimed());
  }

  #[tokio::test]
  async fn test_failed_install_is_redundant() {
    let reg = Registration::new();
    let stub = Stub { fail_install: true };
    assert!(reg.run(&stub, Event::Install).await.is_err());
    assert_eq!(reg.state(), WorkerState::Redundant);
  }

  #[tokio::test]
  async fn test_redundant_version_never_activates() {
    let reg = Registration::new();
    let stub = Stub { fail_install: true };
    assert!(reg.run(&stub, Event::Install).await.is_err());

    assert!(reg.run(&stub, Event::Activate).await.is_err());
    assert_eq!(reg.state(), WorkerState::Redundant);
    assert!(!reg.clients_claimed());
  }

  #[tokio::test]
  async fn test_dispatch_fetch() {
    let reg = Registration::new();
    let stub = Stub {
      fail_install: false,
    };
    let url = Url::parse("http://localhost:8080/").unwrap();

    let get = dispatch(&stub, &reg, Event::Fetch(Request::get(url.clone())))
      .await
      .unwrap();
    match get {
      EventOutcome::Fetch(disposition) => {
        let intercepted = disposition.into_intercepted().unwrap();
        assert_eq!(intercepted.source, ResponseSource::Cache);
      }
      other => panic!("unexpected outcome {:?}", other),
    }

    let post = dispatch(&stub, &reg, Event::Fetch(Request::new(Method::POST, url)))
      .await
      .unwrap();
    assert!(matches!(post, EventOutcome::Fetch(FetchDisposition::Passthrough)));
  }
}
