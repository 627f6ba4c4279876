//! One-shot async lookups with a closed view state.
//!
//! A `Query<T>` wraps a fetcher closure and tracks its outcome as a
//! [`ViewState`]. Fetchers return `Ok(None)` for "nothing there", which is
//! reported as [`ViewState::Empty`] rather than as an error.
//!
//! ```ignore
//! let store = store.clone();
//! let mut detail = Query::new(move || {
//!   let store = store.clone();
//!   async move { store.get_by_id(id).map_err(|e| e.to_string()) }
//! });
//!
//! detail.fetch();
//! let state = detail.settle().await;
//! match state {
//!   ViewState::Idle | ViewState::Loading => {}
//!   ViewState::Success(movie) => print_movie(movie),
//!   ViewState::Empty => println!("not found"),
//!   ViewState::Error(e) => eprintln!("{e}"),
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// What a consumer shows for a piece of data
#[derive(Debug, Clone, PartialEq)]
pub enum ViewState<T> {
  /// Nothing requested yet
  Idle,
  Loading,
  Success(T),
  /// Request succeeded but there is nothing to show
  Empty,
  Error(String),
}

impl<T> ViewState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, ViewState::Loading)
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      ViewState::Success(data) => Some(data),
      ViewState::Idle | ViewState::Loading | ViewState::Empty | ViewState::Error(_) => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      ViewState::Error(e) => Some(e),
      ViewState::Idle | ViewState::Loading | ViewState::Success(_) | ViewState::Empty => None,
    }
  }

  /// `Success` for `Some`, `Empty` for `None`.
  pub fn from_option(value: Option<T>) -> Self {
    value.map_or(ViewState::Empty, ViewState::Success)
  }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<Option<T>, String>> + Send>>;

type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

pub struct Query<T> {
  state: ViewState<T>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<Result<Option<T>, String>>>,
}

impl<T: Send + 'static> Query<T> {
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<T>, String>> + Send + 'static,
  {
    Self {
      state: ViewState::Idle,
      fetcher: Box::new(move || Box::pin(fetcher())),
      receiver: None,
    }
  }

  pub fn state(&self) -> &ViewState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  /// Start fetching unless a fetch is already pending.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Start over, abandoning any pending fetch.
  pub fn refetch(&mut self) {
    self.receiver = None;
    self.start_fetch();
  }

  /// Pick up a finished fetch without waiting. Returns true if the state changed.
  pub fn poll(&mut self) -> bool {
    let Some(receiver) = &mut self.receiver else {
      return false;
    };

    match receiver.try_recv() {
      Ok(result) => {
        self.apply(result);
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.apply(Err("Query was cancelled".to_string()));
        true
      }
    }
  }

  /// Wait for the pending fetch, if any, and return the resulting state.
  pub async fn settle(&mut self) -> &ViewState<T> {
    if let Some(receiver) = &mut self.receiver {
      let result = receiver
        .recv()
        .await
        .unwrap_or_else(|| Err("Query was cancelled".to_string()));
      self.apply(result);
    }
    &self.state
  }

  fn apply(&mut self, result: Result<Option<T>, String>) {
    self.receiver = None;
    self.state = match result {
      Ok(value) => ViewState::from_option(value),
      Err(e) => ViewState::Error(e),
    };
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = ViewState::Loading;

    let future = (self.fetcher)();
    tokio::spawn(async move {
      // Receiver may be gone after a refetch
      let _ = tx.send(future.await);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}
