//! Remote catalog contract consumed by the sync engine.

use futures::future::BoxFuture;
use thiserror::Error;

use super::api_types::PageResponse;
use super::types::Category;

/// Failure to obtain a page from the remote catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// Host unreachable, connection reset, timeout
  #[error("network unavailable: {0}")]
  Transport(String),
  /// The service answered, but not with a usable page
  #[error("remote returned {status}: {message}")]
  Remote { status: u16, message: String },
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Source of catalog pages. Pages are 1-based.
pub trait RemoteSource: Send + Sync {
  /// Fetch one page of a category feed.
  fn fetch_page(&self, category: Category, page: u32) -> BoxFuture<'_, FetchResult<PageResponse>>;

  /// Fetch one page of title search results.
  fn search_page<'a>(&'a self, query: &'a str, page: u32)
    -> BoxFuture<'a, FetchResult<PageResponse>>;
}
