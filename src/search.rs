//! Debounced, last-query-wins title search.
//!
//! Each query change bumps a generation counter and cancels the previous
//! search's token, which also stops its debounce timer and any page fetch of
//! the old query. Store writes and session updates happen under the session
//! lock after checking the generation, so a superseded search writes nothing. Online searches go to the remote
//! search endpoint and keep the results as orphaned records; offline searches
//! read stored titles instead.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{merge, OrderUpdate, PageCommit, RecordStore};
use crate::catalog::{MovieRecord, PageResponse, RemoteSource};
use crate::connectivity::Connectivity;
use crate::query::ViewState;
use crate::sync::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
  Remote,
  /// Stored titles, used while offline
  Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResults {
  pub query: String,
  pub items: Vec<MovieRecord>,
  pub source: ResultSource,
  pub end_of_pagination: bool,
}

/// Remote paging progress of the current query
#[derive(Debug, Clone)]
struct Session {
  generation: u64,
  query: String,
  last_page: u32,
  end_of_pagination: bool,
  /// Fires when the query is superseded
  cancel: CancellationToken,
}

struct Shared {
  remote: Arc<dyn RemoteSource>,
  store: Arc<dyn RecordStore>,
  connectivity: Connectivity,
  debounce: Duration,
  generation: AtomicU64,
  /// Guards the generation bump and everything that checks it before writing
  session: Mutex<Option<Session>>,
  /// One `load_more` at a time
  paging: tokio::sync::Mutex<()>,
  tx: watch::Sender<ViewState<SearchResults>>,
}

struct ActiveSearch {
  cancel: CancellationToken,
  handle: Option<JoinHandle<()>>,
}

pub struct SearchCoordinator {
  shared: Arc<Shared>,
  active: Mutex<Option<ActiveSearch>>,
}

impl SearchCoordinator {
  pub fn new(
    remote: Arc<dyn RemoteSource>,
    store: Arc<dyn RecordStore>,
    connectivity: Connectivity,
    debounce: Duration,
  ) -> Self {
    let (tx, _) = watch::channel(ViewState::Idle);
    Self {
      shared: Arc::new(Shared {
        remote,
        store,
        connectivity,
        debounce,
        generation: AtomicU64::new(0),
        session: Mutex::new(None),
        paging: tokio::sync::Mutex::new(()),
        tx,
      }),
      active: Mutex::new(None),
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<ViewState<SearchResults>> {
    self.shared.tx.subscribe()
  }

  pub fn state(&self) -> ViewState<SearchResults> {
    self.shared.tx.borrow().clone()
  }

  /// Supersede the current search with `query`.
  ///
  /// Must be called from within a tokio runtime. A blank query clears the
  /// results immediately.
  pub fn on_query_changed(&self, query: &str) {
    let generation = {
      let mut session = self.shared.session.lock();
      *session = None;
      self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1
    };
    let mut active = self.active.lock();
    if let Some(previous) = active.take() {
      previous.cancel.cancel();
    }

    let query = query.trim().to_string();
    if query.is_empty() {
      self.shared.publish(generation, ViewState::Idle);
      return;
    }

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_search(
      self.shared.clone(),
      generation,
      query,
      cancel.clone(),
    ));
    *active = Some(ActiveSearch {
      cancel,
      handle: Some(handle),
    });
  }

  /// Wait for the current search to finish and return its state.
  pub async fn settled(&self) -> ViewState<SearchResults> {
    let handle = self.active.lock().as_mut().and_then(|a| a.handle.take());
    if let Some(handle) = handle {
      if let Err(e) = handle.await {
        warn!(error = %e, "Search task failed");
      }
    }
    self.state()
  }

  /// Fetch the next remote page of the current query and add it to the
  /// results. Returns false when there is nothing more to load.
  ///
  /// A newer query abandons the fetch and nothing of the old page is stored.
  pub async fn load_more(&self) -> Result<bool, LoadError> {
    let _paging = self.shared.paging.lock().await;

    let Some(session) = self.shared.session.lock().clone() else {
      return Ok(false);
    };
    if session.end_of_pagination || self.shared.connectivity.is_offline() {
      return Ok(false);
    }

    let page = session.last_page + 1;
    info!(query = %session.query, page, "Loading more search results");
    let fetched = tokio::select! {
      _ = session.cancel.cancelled() => {
        debug!(query = %session.query, page, "Query superseded, abandoning page");
        return Ok(false);
      }
      fetched = self.shared.remote.search_page(&session.query, page) => fetched,
    };
    let response = fetched?;
    let end_of_pagination = page >= response.total_pages || response.results.is_empty();
    let generation = session.generation;

    let records = {
      let mut current = self.shared.session.lock();
      if !self.shared.is_current(generation) {
        debug!(query = %session.query, page, "Query superseded, dropping page");
        return Ok(false);
      }
      let records = self.shared.commit(&response, page)?;
      *current = Some(Session {
        last_page: page,
        end_of_pagination,
        ..session
      });
      records
    };

    self.shared.tx.send_if_modified(|state| match state {
      ViewState::Success(results) if self.shared.is_current(generation) => {
        let seen: HashSet<i64> = results.items.iter().map(|m| m.id).collect();
        results
          .items
          .extend(records.into_iter().filter(|m| !seen.contains(&m.id)));
        results.end_of_pagination = end_of_pagination;
        true
      }
      ViewState::Idle
      | ViewState::Loading
      | ViewState::Success(_)
      | ViewState::Empty
      | ViewState::Error(_) => false,
    });
    Ok(true)
  }
}

impl Drop for SearchCoordinator {
  fn drop(&mut self) {
    if let Some(active) = self.active.lock().take() {
      active.cancel.cancel();
    }
  }
}

impl Shared {
  fn is_current(&self, generation: u64) -> bool {
    self.generation.load(Ordering::SeqCst) == generation
  }

  fn publish(&self, generation: u64, state: ViewState<SearchResults>) {
    let _session = self.session.lock();
    if self.is_current(generation) {
      self.tx.send_replace(state);
    }
  }

  fn commit(&self, response: &PageResponse, page: u32) -> Result<Vec<MovieRecord>, LoadError> {
    let ids: Vec<i64> = response.results.iter().map(|m| m.id).collect();
    Ok(self.store.commit_page(PageCommit {
      ids: &ids,
      order: OrderUpdate::Orphaned,
      page,
      total_pages: response.total_pages,
      merge: &|flags| merge::reconcile(&response.results, flags),
    })?)
  }

  fn search_offline(&self, query: &str) -> ViewState<SearchResults> {
    match self.store.search_by_title_substring(query) {
      Ok(items) if items.is_empty() => ViewState::Empty,
      Ok(items) => ViewState::Success(SearchResults {
        query: query.to_string(),
        items,
        source: ResultSource::Local,
        end_of_pagination: true,
      }),
      Err(e) => ViewState::Error(format!("Could not search: {}", e)),
    }
  }

  async fn search_online(&self, generation: u64, query: &str, cancel: &CancellationToken) -> Option<ViewState<SearchResults>> {
    let fetched = tokio::select! {
      _ = cancel.cancelled() => return None,
      fetched = self.remote.search_page(query, 1) => fetched,
    };

    let response = match fetched {
      Ok(response) => response,
      Err(e) => return Some(search_failed(query, e.into())),
    };
    let end_of_pagination = response.total_pages <= 1;

    let items = {
      let mut session = self.session.lock();
      if !self.is_current(generation) {
        return None;
      }
      let items = match self.commit(&response, 1) {
        Ok(items) => items,
        Err(e) => return Some(search_failed(query, e)),
      };
      if !items.is_empty() {
        *session = Some(Session {
          generation,
          query: query.to_string(),
          last_page: 1,
          end_of_pagination,
          cancel: cancel.clone(),
        });
      }
      items
    };

    Some(if items.is_empty() {
      ViewState::Empty
    } else {
      ViewState::Success(SearchResults {
        query: query.to_string(),
        items,
        source: ResultSource::Remote,
        end_of_pagination,
      })
    })
  }
}

fn search_failed(query: &str, error: LoadError) -> ViewState<SearchResults> {
  warn!(query, error = %error, "Search failed");
  ViewState::Error(format!("Could not search: {}", error))
}

async fn run_search(shared: Arc<Shared>, generation: u64, query: String, cancel: CancellationToken) {
  tokio::select! {
    _ = cancel.cancelled() => return,
    _ = tokio::time::sleep(shared.debounce) => {}
  }

  if shared.connectivity.is_offline() {
    debug!(query = %query, "Offline, searching stored titles");
    let state = shared.search_offline(&query);
    shared.publish(generation, state);
    return;
  }

  info!(query = %query, "Searching");
  shared.publish(generation, ViewState::Loading);
  match shared.search_online(generation, &query, &cancel).await {
    Some(state) => shared.publish(generation, state),
    None => debug!(query = %query, "Search superseded"),
  }
}
