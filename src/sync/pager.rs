//! Consumer-facing cursor over one category.
//!
//! The pager exposes a growing window over the stored category order and only
//! goes to the network, through its [`SyncMediator`], when the store cannot
//! fill the next window. Every change is published as a [`PagerSnapshot`] on a
//! watch channel.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::mediator::{LoadError, LoadType, MediatorResult, SyncMediator};
use crate::cache::RecordStore;
use crate::catalog::{Category, MovieRecord};
use crate::config::PagingConfig;

/// Progress of one boundary (refresh or append)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LoadState {
  #[default]
  Idle,
  Loading,
  Error(LoadError),
}

impl LoadState {
  pub fn is_loading(&self) -> bool {
    matches!(self, LoadState::Loading)
  }

  pub fn error(&self) -> Option<&LoadError> {
    match self {
      LoadState::Error(e) => Some(e),
      LoadState::Idle | LoadState::Loading => None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PagerSnapshot {
  pub items: Vec<MovieRecord>,
  pub refresh: LoadState,
  pub append: LoadState,
  pub end_of_pagination: bool,
}

pub struct Pager {
  mediator: Arc<SyncMediator>,
  store: Arc<dyn RecordStore>,
  config: PagingConfig,
  /// Number of stored rows currently exposed
  window: usize,
  last_failed: Option<LoadType>,
  started: bool,
  tx: watch::Sender<PagerSnapshot>,
}

impl Pager {
  pub fn new(mediator: Arc<SyncMediator>, store: Arc<dyn RecordStore>, config: PagingConfig) -> Self {
    let (tx, _) = watch::channel(PagerSnapshot::default());
    Self {
      mediator,
      store,
      config,
      window: 0,
      last_failed: None,
      started: false,
      tx,
    }
  }

  pub fn category(&self) -> Category {
    self.mediator.category()
  }

  pub fn subscribe(&self) -> watch::Receiver<PagerSnapshot> {
    self.tx.subscribe()
  }

  pub fn snapshot(&self) -> PagerSnapshot {
    self.tx.borrow().clone()
  }

  pub fn len(&self) -> usize {
    self.tx.borrow().items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Reload the category from page 1.
  ///
  /// On failure the items already shown stay in place and the refresh
  /// boundary carries the error.
  pub async fn refresh(&mut self) -> LoadState {
    let boundary = BoundaryGuard::begin(&self.tx, LoadType::Refresh);
    let result = self.mediator.load(LoadType::Refresh).await;
    boundary.finish();

    let state = match result {
      MediatorResult::Success { end_of_pagination } => {
        self.window = self.config.initial_load_size;
        match self.reload() {
          Ok(items) => {
            self.started = true;
            self.last_failed = None;
            self.tx.send_modify(|s| {
              s.items = items;
              s.end_of_pagination = end_of_pagination;
              s.append = LoadState::Idle;
            });
            LoadState::Idle
          }
          Err(e) => self.fail(LoadType::Refresh, e),
        }
      }
      MediatorResult::Error(e) => self.fail(LoadType::Refresh, e),
    };

    self.tx.send_modify(|s| s.refresh = state.clone());
    state
  }

  /// Extend the window by one page, fetching only if the store runs out.
  ///
  /// Until a refresh has succeeded this refreshes instead.
  pub async fn load_more(&mut self) -> LoadState {
    if !self.started {
      return self.refresh().await;
    }

    let stored = match self.store.count_category(self.category()) {
      Ok(count) => count,
      Err(e) => return self.fail_append(e.into()),
    };

    if self.window < stored {
      debug!(category = %self.category(), window = self.window, stored, "Extending window from cache");
      self.window = (self.window + self.config.page_size).min(stored);
      return match self.reload() {
        Ok(items) => {
          self.tx.send_modify(|s| s.items = items);
          LoadState::Idle
        }
        Err(e) => self.fail_append(e),
      };
    }

    if self.tx.borrow().end_of_pagination {
      return LoadState::Idle;
    }

    let boundary = BoundaryGuard::begin(&self.tx, LoadType::Append);
    let result = self.mediator.load(LoadType::Append).await;
    boundary.finish();

    match result {
      MediatorResult::Success { end_of_pagination } => {
        self.window += self.config.page_size;
        match self.reload() {
          Ok(items) => {
            self.window = items.len();
            self.last_failed = None;
            self.tx.send_modify(|s| {
              s.items = items;
              s.end_of_pagination = end_of_pagination;
              s.refresh = LoadState::Idle;
              s.append = LoadState::Idle;
            });
            LoadState::Idle
          }
          Err(e) => self.fail_append(e),
        }
      }
      MediatorResult::Error(e) => self.fail_append(e),
    }
  }

  /// Tell the pager the consumer has reached `index`. Loads more when within
  /// the prefetch distance of the end, unless the append boundary is in error.
  pub async fn on_item_visible(&mut self, index: usize) -> bool {
    let (shown, blocked) = {
      let snapshot = self.tx.borrow();
      (
        snapshot.items.len(),
        snapshot.append.error().is_some() || snapshot.end_of_pagination,
      )
    };

    if blocked || index + self.config.prefetch_distance < shown {
      return false;
    }
    self.load_more().await;
    true
  }

  /// Re-issue the last failed request, if any.
  pub async fn retry(&mut self) -> Option<LoadState> {
    match self.last_failed.take()? {
      LoadType::Refresh => Some(self.refresh().await),
      LoadType::Append | LoadType::Prepend => Some(self.load_more().await),
    }
  }

  fn reload(&self) -> Result<Vec<MovieRecord>, LoadError> {
    Ok(self.store.get_page(self.category(), 0, self.window)?)
  }

  fn fail(&mut self, load_type: LoadType, error: LoadError) -> LoadState {
    self.last_failed = Some(load_type);
    LoadState::Error(error)
  }

  fn fail_append(&mut self, error: LoadError) -> LoadState {
    let state = self.fail(LoadType::Append, error);
    self.tx.send_modify(|s| s.append = state.clone());
    state
  }
}

/// Publishes `Loading` on one boundary; resets it to `Idle` if the load is
/// abandoned before finishing.
struct BoundaryGuard<'a> {
  tx: &'a watch::Sender<PagerSnapshot>,
  load_type: LoadType,
  finished: bool,
}

impl<'a> BoundaryGuard<'a> {
  fn begin(tx: &'a watch::Sender<PagerSnapshot>, load_type: LoadType) -> Self {
    set_boundary(tx, load_type, LoadState::Loading);
    Self {
      tx,
      load_type,
      finished: false,
    }
  }

  fn finish(mut self) {
    self.finished = true;
  }
}

impl Drop for BoundaryGuard<'_> {
  fn drop(&mut self) {
    if !self.finished {
      set_boundary(self.tx, self.load_type, LoadState::Idle);
    }
  }
}

fn set_boundary(tx: &watch::Sender<PagerSnapshot>, load_type: LoadType, state: LoadState) {
  tx.send_modify(|s| match load_type {
    LoadType::Refresh => s.refresh = state,
    LoadType::Append | LoadType::Prepend => s.append = state,
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStore;
  use crate::catalog::remote::fake::{movie, page, Call, FakeRemote};
  use std::time::Duration;

  const CAT: Category = Category::NowPlaying;

  const SMALL: PagingConfig = PagingConfig {
    page_size: 2,
    initial_load_size: 2,
    prefetch_distance: 1,
  };

  fn three_pages() -> FakeRemote {
    FakeRemote::new()
      .with_feed_page(CAT, page(1, 3, vec![movie(1, "a", 9.0), movie(2, "b", 8.0)]))
      .with_feed_page(CAT, page(2, 3, vec![movie(3, "c", 7.0), movie(4, "d", 6.0)]))
      .with_feed_page(CAT, page(3, 3, vec![movie(5, "e", 5.0)]))
  }

  fn pager(remote: &Arc<FakeRemote>, store: &Arc<SqliteStore>) -> Pager {
    let mediator = Arc::new(SyncMediator::new(CAT, remote.clone(), store.clone()));
    Pager::new(mediator, store.clone(), SMALL)
  }

  fn setup() -> (Arc<FakeRemote>, Arc<SqliteStore>, Pager) {
    let remote = Arc::new(three_pages());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let pager = pager(&remote, &store);
    (remote, store, pager)
  }

  fn ids(pager: &Pager) -> Vec<i64> {
    pager.snapshot().items.iter().map(|m| m.id).collect()
  }

  #[tokio::test]
  async fn test_first_load_refreshes() {
    let (remote, _store, mut pager) = setup();
    assert!(pager.is_empty());

    assert_eq!(pager.load_more().await, LoadState::Idle);
    assert_eq!(ids(&pager), vec![1, 2]);
    assert_eq!(remote.calls(), vec![Call::Feed(CAT, 1)]);
    assert!(!pager.snapshot().end_of_pagination);
  }

  #[tokio::test]
  async fn test_pages_through_to_end() {
    let (remote, _store, mut pager) = setup();
    pager.refresh().await;
    pager.load_more().await;
    pager.load_more().await;

    assert_eq!(ids(&pager), vec![1, 2, 3, 4, 5]);
    assert!(pager.snapshot().end_of_pagination);

    pager.load_more().await;
    assert_eq!(remote.calls().len(), 3);
  }

  #[tokio::test]
  async fn test_prefetch_distance() {
    let (remote, _store, mut pager) = setup();
    pager.refresh().await;

    // Two items shown, distance one: index 0 is not close enough
    assert!(!pager.on_item_visible(0).await);
    assert!(pager.on_item_visible(1).await);
    assert_eq!(ids(&pager), vec![1, 2, 3, 4]);
    assert_eq!(remote.calls().len(), 2);
  }

  #[tokio::test]
  async fn test_failed_append_keeps_items_and_retry_fetches_only_that_page() {
    let (remote, _store, mut pager) = setup();
    pager.refresh().await;

    remote.set_offline(true);
    let state = pager.load_more().await;
    assert!(matches!(state, LoadState::Error(LoadError::Fetch(_))));
    assert_eq!(ids(&pager), vec![1, 2]);
    assert!(pager.snapshot().append.error().is_some());
    assert_eq!(pager.snapshot().refresh, LoadState::Idle);

    // Errored boundary does not auto-load
    assert!(!pager.on_item_visible(1).await);

    remote.set_offline(false);
    assert_eq!(pager.retry().await, Some(LoadState::Idle));
    assert_eq!(ids(&pager), vec![1, 2, 3, 4]);
    assert_eq!(
      remote.calls(),
      vec![Call::Feed(CAT, 1), Call::Feed(CAT, 2), Call::Feed(CAT, 2)]
    );

    // Nothing left to retry
    assert_eq!(pager.retry().await, None);
  }

  #[tokio::test]
  async fn test_refresh_error_on_empty_cache_then_retry() {
    let (remote, _store, mut pager) = setup();
    remote.set_offline(true);

    assert!(matches!(pager.refresh().await, LoadState::Error(_)));
    assert!(pager.snapshot().refresh.error().is_some());
    assert!(pager.is_empty());

    remote.set_offline(false);
    assert_eq!(pager.retry().await, Some(LoadState::Idle));
    assert_eq!(ids(&pager), vec![1, 2]);
    assert_eq!(pager.snapshot().refresh, LoadState::Idle);
  }

  #[tokio::test]
  async fn test_load_more_after_failed_first_refresh_refreshes() {
    let (remote, store, mut pager) = setup();
    remote.set_offline(true);
    assert!(matches!(pager.refresh().await, LoadState::Error(_)));

    remote.set_offline(false);
    assert_eq!(pager.load_more().await, LoadState::Idle);

    let snapshot = pager.snapshot();
    assert_eq!(ids(&pager), vec![1, 2]);
    assert_eq!(snapshot.refresh, LoadState::Idle);
    assert_eq!(snapshot.append, LoadState::Idle);
    assert_eq!(remote.calls(), vec![Call::Feed(CAT, 1), Call::Feed(CAT, 1)]);
    // Committed as a refresh, not as an append of page 1
    assert!(store.sync_state(CAT).unwrap().unwrap().refreshed_at.is_some());

    // Paging now continues with page 2, not a second page 1
    pager.load_more().await;
    assert_eq!(ids(&pager), vec![1, 2, 3, 4]);
    assert_eq!(remote.calls().last(), Some(&Call::Feed(CAT, 2)));
  }

  #[tokio::test]
  async fn test_stale_refresh_pages_from_cache_without_network() {
    let (remote, store, mut first) = setup();
    first.refresh().await;
    first.load_more().await;
    first.load_more().await;
    assert_eq!(remote.calls().len(), 3);

    remote.set_offline(true);
    let mut second = pager(&remote, &store);
    assert_eq!(second.refresh().await, LoadState::Idle);
    assert_eq!(ids(&second), vec![1, 2]);

    second.load_more().await;
    second.load_more().await;
    assert_eq!(ids(&second), vec![1, 2, 3, 4, 5]);
    // One failed refresh, no appends: the rest came from the store
    assert_eq!(remote.calls().len(), 4);

    // Persisted progress says the feed is exhausted
    assert_eq!(second.load_more().await, LoadState::Idle);
    assert_eq!(remote.calls().len(), 4);
  }

  #[tokio::test]
  async fn test_subscribers_observe_updates() {
    let (_remote, _store, mut pager) = setup();
    let mut rx = pager.subscribe();

    pager.refresh().await;
    assert!(rx.has_changed().unwrap());
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.items.len(), 2);
    assert_eq!(snapshot.refresh, LoadState::Idle);
  }

  #[tokio::test]
  async fn test_abandoned_load_leaves_items_and_idle_boundary() {
    let remote = Arc::new(three_pages().with_latency(Duration::from_millis(200)));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut pager = pager(&remote, &store);

    let abandoned = tokio::time::timeout(Duration::from_millis(20), pager.refresh()).await;
    assert!(abandoned.is_err());

    let snapshot = pager.snapshot();
    assert_eq!(snapshot.refresh, LoadState::Idle);
    assert!(snapshot.items.is_empty());
    assert_eq!(store.count_category(CAT).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_bookmark_visible_after_refresh() {
    let (_remote, store, mut pager) = setup();
    pager.refresh().await;
    store.toggle_bookmark(1).unwrap();

    pager.refresh().await;
    let items = pager.snapshot().items;
    assert!(items[0].bookmarked);
    assert!(!items[1].bookmarked);
  }
}
