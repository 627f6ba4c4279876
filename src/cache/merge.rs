//! Reconciliation of fetched movies with locally owned state.
//!
//! The server owns every field except the bookmark flag, which only the user
//! sets. A refresh therefore takes all other fields from the fetch and carries
//! the flag forward from the stored record, so re-fetching a feed can never
//! clear a bookmark.

use std::collections::HashMap;

use crate::catalog::{MovieDto, MovieRecord};

/// Build records from `fetched`, keeping the bookmark flag stored for each id
/// in `stored` (false for ids seen for the first time). Order is preserved.
pub fn reconcile(fetched: &[MovieDto], stored: &HashMap<i64, bool>) -> Vec<MovieRecord> {
  fetched
    .iter()
    .map(|dto| dto.to_record(stored.get(&dto.id).copied().unwrap_or(false)))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{OrderUpdate, PageCommit, RecordStore, SqliteStore};
  use crate::catalog::Category;

  fn dto(id: i64, title: &str) -> MovieDto {
    MovieDto {
      id,
      title: Some(title.to_string()),
      vote_average: Some(7.1),
      ..MovieDto::default()
    }
  }

  #[test]
  fn test_new_ids_are_not_bookmarked() {
    let records = reconcile(&[dto(1, "a"), dto(2, "b")], &HashMap::new());
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|m| !m.bookmarked));
  }

  #[test]
  fn test_stored_flag_survives_field_update() {
    let stored = HashMap::from([(1, true), (2, false)]);
    let records = reconcile(&[dto(2, "b"), dto(1, "a (remastered)")], &stored);

    assert_eq!(records[0].id, 2);
    assert!(!records[0].bookmarked);
    assert_eq!(records[1].title, "a (remastered)");
    assert_eq!(records[1].vote_average, 7.1);
    assert!(records[1].bookmarked);
  }

  #[test]
  fn test_refresh_through_store_keeps_bookmarks() {
    let store = SqliteStore::open_in_memory().unwrap();
    let first = [dto(1, "a"), dto(2, "b"), dto(3, "c")];
    let commit = |fetched: &[MovieDto], ids: &[i64]| {
      store
        .commit_page(PageCommit {
          ids,
          order: OrderUpdate::Replace(Category::Trending),
          page: 1,
          total_pages: 1,
          merge: &|flags| reconcile(fetched, flags),
        })
        .unwrap()
    };

    commit(&first, &[1, 2, 3]);
    store.set_bookmark(2, true).unwrap();

    let second = [dto(3, "c"), dto(2, "b (new cut)"), dto(4, "d")];
    commit(&second, &[3, 2, 4]);

    let two = store.get_by_id(2).unwrap().unwrap();
    assert!(two.bookmarked);
    assert_eq!(two.title, "b (new cut)");
    assert!(!store.get_by_id(4).unwrap().unwrap().bookmarked);
    // Dropped from the feed, but never deleted
    assert!(store.get_by_id(1).unwrap().is_some());
  }
}
