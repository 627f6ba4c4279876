//! Per-category fetch-then-merge state machine.
//!
//! A [`SyncMediator`] decides which remote page a load request maps to, commits
//! the fetched page through the merge step, and applies the fallback policy:
//! - A failed refresh over a non-empty cache reports success and serves the
//!   stale order
//! - A failed refresh over an empty cache, and any failed append, is an error
//! - At most one fetch per category is outstanding; later requests queue

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{merge, OrderUpdate, PageCommit, RecordStore};
use crate::catalog::{Category, FetchError, PageResponse, RemoteSource};

/// Boundary a load request is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
  Refresh,
  Prepend,
  Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Fetching { page: u32 },
  Settled {
    last_loaded_page: u32,
    end_of_pagination: bool,
  },
}

/// Why a load could not be satisfied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
  #[error(transparent)]
  Fetch(#[from] FetchError),
  #[error("cache storage failed: {0}")]
  Storage(String),
}

impl From<color_eyre::Report> for LoadError {
  fn from(e: color_eyre::Report) -> Self {
    LoadError::Storage(e.to_string())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediatorResult {
  Success { end_of_pagination: bool },
  Error(LoadError),
}

/// Keeps one category of the record store in step with its remote feed.
pub struct SyncMediator {
  category: Category,
  remote: Arc<dyn RemoteSource>,
  store: Arc<dyn RecordStore>,
  state: Mutex<SyncState>,
  /// Held for the whole of a load, so requests for this category run one at a time
  flight: tokio::sync::Mutex<()>,
}

impl SyncMediator {
  pub fn new(category: Category, remote: Arc<dyn RemoteSource>, store: Arc<dyn RecordStore>) -> Self {
    Self {
      category,
      remote,
      store,
      state: Mutex::new(SyncState::Idle),
      flight: tokio::sync::Mutex::new(()),
    }
  }

  pub fn category(&self) -> Category {
    self.category
  }

  pub fn state(&self) -> SyncState {
    *self.state.lock()
  }

  /// Load the page that `load_type` calls for.
  ///
  /// Dropping the returned future abandons the fetch; nothing is written and
  /// the mediator returns to its previous state.
  pub async fn load(&self, load_type: LoadType) -> MediatorResult {
    // Feeds only ever page forward from page 1
    if load_type == LoadType::Prepend {
      return MediatorResult::Success {
        end_of_pagination: true,
      };
    }

    let _flight = self.flight.lock().await;

    let page = match load_type {
      LoadType::Append => match self.next_append_page() {
        Ok(Some(page)) => page,
        Ok(None) => {
          debug!(category = %self.category, "Append after last page, nothing to fetch");
          return MediatorResult::Success {
            end_of_pagination: true,
          };
        }
        Err(e) => return MediatorResult::Error(e),
      },
      LoadType::Refresh | LoadType::Prepend => 1,
    };

    let guard = FetchGuard::begin(&self.state, page);
    info!(category = %self.category, page, ?load_type, "Fetching page");

    let fetched = self.remote.fetch_page(self.category, page).await;

    match fetched {
      Ok(response) => match self.commit(load_type, page, &response) {
        Ok(()) => {
          let end_of_pagination = page >= response.total_pages;
          guard.settle(page, end_of_pagination);
          MediatorResult::Success { end_of_pagination }
        }
        Err(e) => {
          warn!(category = %self.category, page, error = %e, "Failed to commit page");
          MediatorResult::Error(e.into())
        }
      },
      Err(err) if load_type == LoadType::Refresh => self.fall_back_to_cache(guard, err),
      Err(err) => {
        warn!(category = %self.category, page, error = %err, "Append failed");
        MediatorResult::Error(err.into())
      }
    }
  }

  /// Next page for an append, or `None` once the feed is exhausted.
  fn next_append_page(&self) -> Result<Option<u32>, LoadError> {
    let cursor = match self.state() {
      SyncState::Settled {
        last_loaded_page,
        end_of_pagination,
      } => Some((last_loaded_page, end_of_pagination)),
      // Nothing loaded in this process yet: resume from the persisted progress
      SyncState::Idle | SyncState::Fetching { .. } => self
        .store
        .sync_state(self.category)?
        .map(|s| (s.last_page, s.end_of_pagination())),
    };

    Ok(match cursor {
      Some((_, true)) => None,
      Some((last_loaded_page, false)) => Some(last_loaded_page + 1),
      None => Some(1),
    })
  }

  fn commit(&self, load_type: LoadType, page: u32, response: &PageResponse) -> color_eyre::Result<()> {
    let ids: Vec<i64> = response.results.iter().map(|m| m.id).collect();
    let order = match load_type {
      LoadType::Refresh => OrderUpdate::Replace(self.category),
      LoadType::Append | LoadType::Prepend => OrderUpdate::Append(self.category),
    };

    let written = self.store.commit_page(PageCommit {
      ids: &ids,
      order,
      page,
      total_pages: response.total_pages,
      merge: &|flags| merge::reconcile(&response.results, flags),
    })?;

    debug!(
      category = %self.category,
      page,
      count = written.len(),
      total_pages = response.total_pages,
      "Committed page"
    );
    Ok(())
  }

  /// Refresh failed: serve what is cached if there is anything.
  fn fall_back_to_cache(&self, guard: FetchGuard<'_>, err: FetchError) -> MediatorResult {
    let cached = match self.store.count_category(self.category) {
      Ok(count) => count,
      Err(e) => return MediatorResult::Error(e.into()),
    };

    if cached == 0 {
      warn!(category = %self.category, error = %err, "Refresh failed with nothing cached");
      return MediatorResult::Error(err.into());
    }

    warn!(
      category = %self.category,
      cached,
      error = %err,
      "Refresh failed, serving cached items"
    );

    let (last_loaded_page, end_of_pagination) = match guard.previous() {
      SyncState::Settled {
        last_loaded_page,
        end_of_pagination,
      } => (last_loaded_page, end_of_pagination),
      SyncState::Idle | SyncState::Fetching { .. } => match self.store.sync_state(self.category) {
        Ok(Some(sync)) => (sync.last_page, sync.end_of_pagination()),
        Ok(None) | Err(_) => (1, false),
      },
    };
    guard.settle(last_loaded_page, end_of_pagination);

    MediatorResult::Success {
      end_of_pagination: false,
    }
  }
}

/// Marks the mediator as fetching. Unless settled, puts the previous state back
/// when dropped, which covers failures and abandoned fetches alike.
struct FetchGuard<'a> {
  state: &'a Mutex<SyncState>,
  previous: SyncState,
  settled: bool,
}

impl<'a> FetchGuard<'a> {
  fn begin(state: &'a Mutex<SyncState>, page: u32) -> Self {
    let previous = std::mem::replace(&mut *state.lock(), SyncState::Fetching { page });
    Self {
      state,
      previous,
      settled: false,
    }
  }

  fn previous(&self) -> SyncState {
    self.previous
  }

  fn settle(mut self, last_loaded_page: u32, end_of_pagination: bool) {
    *self.state.lock() = SyncState::Settled {
      last_loaded_page,
      end_of_pagination,
    };
    self.settled = true;
  }
}

impl Drop for FetchGuard<'_> {
  fn drop(&mut self) {
    if !self.settled {
      *self.state.lock() = self.previous;
    }
  }
}
