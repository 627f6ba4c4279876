//! Offline-tolerant cache and paging engine for a movie catalog.
//!
//! Category feeds are fetched page by page from the remote catalog, merged
//! into a SQLite cache without losing bookmarks, and served back through a
//! [`sync::Pager`]. Title search runs through a debounced
//! [`search::SearchCoordinator`] that falls back to stored titles offline.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod query;
pub mod search;
pub mod sync;
