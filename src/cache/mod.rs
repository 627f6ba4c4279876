//! Durable movie cache.
//!
//! This module holds the record store and the merge step that sits in front of
//! it:
//! - Movie records keyed by id, shared by every feed and by search
//! - Per-category order, replaced wholesale on refresh and extended on append
//! - Paging progress per category so paging resumes after a restart
//! - Bookmark flags that only the user writes

pub mod merge;
mod storage;

pub use storage::{CategorySync, OrderUpdate, PageCommit, RecordStore, SqliteStore};
