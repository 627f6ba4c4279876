//! Record store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::catalog::{Category, MovieRecord};

/// Paging progress for a category, written with every committed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategorySync {
  pub last_page: u32,
  pub total_pages: u32,
  /// Time of the last successful refresh; `None` if only appends were committed
  pub refreshed_at: Option<DateTime<Utc>>,
}

impl CategorySync {
  pub fn end_of_pagination(&self) -> bool {
    self.last_page >= self.total_pages
  }
}

/// How a committed page affects category membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderUpdate {
  /// Drop the category's order and start again from position 0
  Replace(Category),
  /// Continue after the category's current last position
  Append(Category),
  /// Records only; used for search results
  Orphaned,
}

/// One fetched page, merged and written inside a single transaction.
pub struct PageCommit<'a> {
  /// Ids in response order
  pub ids: &'a [i64],
  pub order: OrderUpdate,
  pub page: u32,
  pub total_pages: u32,
  /// Builds the records to write from the bookmark flags stored for `ids`
  pub merge: &'a dyn Fn(&HashMap<i64, bool>) -> Vec<MovieRecord>,
}

/// Durable storage for movie records and per-category order.
///
/// Every method is atomic on its own. Readers never observe a partially
/// written page or order.
pub trait RecordStore: Send + Sync {
  /// Insert or replace records by id, including their bookmark flag.
  fn upsert_items(&self, items: &[MovieRecord]) -> Result<()>;

  /// Replace the order of `category` with `ordered_ids` at positions `0..n`.
  fn replace_category_order(&self, category: Category, ordered_ids: &[i64]) -> Result<()>;

  /// Add ids after the current last position, skipping ids already present.
  /// Returns how many were added.
  fn append_category_order(&self, category: Category, ids: &[i64]) -> Result<usize>;

  /// Records of `category` ordered by position.
  fn get_page(&self, category: Category, offset: usize, limit: usize) -> Result<Vec<MovieRecord>>;

  fn count_category(&self, category: Category) -> Result<usize>;

  fn get_by_id(&self, id: i64) -> Result<Option<MovieRecord>>;

  /// Stored bookmark flags; unknown ids are absent from the map.
  fn get_bookmark_flags(&self, ids: &[i64]) -> Result<HashMap<i64, bool>>;

  /// Case-insensitive title match across all records, most popular first.
  fn search_by_title_substring(&self, text: &str) -> Result<Vec<MovieRecord>>;

  /// Bookmarked records, most popular first.
  fn get_bookmarked(&self) -> Result<Vec<MovieRecord>>;

  /// Write only the bookmark flag. Returns false if the id is unknown.
  fn set_bookmark(&self, id: i64, bookmarked: bool) -> Result<bool>;

  /// Flip the bookmark flag, returning the new value.
  fn toggle_bookmark(&self, id: i64) -> Result<Option<bool>>;

  /// Read bookmark flags, merge, upsert and update order as one transaction.
  /// Returns the records as written.
  fn commit_page(&self, commit: PageCommit<'_>) -> Result<Vec<MovieRecord>>;

  fn sync_state(&self, category: Category) -> Result<Option<CategorySync>>;
}

/// SQLite-based record store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Store that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    // Dropping an uncommitted transaction rolls it back
    let value = f(&tx)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(value)
  }

  fn query_records(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<MovieRecord>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare_cached(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let records = stmt
      .query_map(params, row_to_record)
      .map_err(|e| eyre!("Failed to query movies: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read movie row: {}", e))?;

    Ok(records)
  }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS movies (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    overview TEXT NOT NULL DEFAULT '',
    release_date TEXT NOT NULL DEFAULT '',
    poster_path TEXT NOT NULL DEFAULT '',
    backdrop_path TEXT NOT NULL DEFAULT '',
    vote_average REAL NOT NULL DEFAULT 0,
    vote_count INTEGER NOT NULL DEFAULT 0,
    popularity REAL NOT NULL DEFAULT 0,
    bookmarked INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_movies_popularity ON movies(popularity DESC);

-- Category order (positions dense from 0 per category)
CREATE TABLE IF NOT EXISTS category_members (
    category TEXT NOT NULL,
    movie_id INTEGER NOT NULL REFERENCES movies(id),
    position INTEGER NOT NULL,
    PRIMARY KEY (category, movie_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_category_members_position
    ON category_members(category, position);

-- Paging progress per category
CREATE TABLE IF NOT EXISTS category_sync (
    category TEXT PRIMARY KEY,
    last_page INTEGER NOT NULL,
    total_pages INTEGER NOT NULL,
    refreshed_at TEXT
);
"#;

const MOVIE_COLUMNS: &str = "m.id, m.title, m.overview, m.release_date, m.poster_path, \
   m.backdrop_path, m.vote_average, m.vote_count, m.popularity, m.bookmarked";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MovieRecord> {
  Ok(MovieRecord {
    id: row.get(0)?,
    title: row.get(1)?,
    overview: row.get(2)?,
    release_date: row.get(3)?,
    poster_path: row.get(4)?,
    backdrop_path: row.get(5)?,
    vote_average: row.get(6)?,
    vote_count: row.get(7)?,
    popularity: row.get(8)?,
    bookmarked: row.get(9)?,
  })
}

// ============================================================================
// Statements shared by single operations and page commits
// ============================================================================

fn upsert_rows(conn: &Connection, items: &[MovieRecord]) -> Result<()> {
  let mut stmt = conn
    .prepare_cached(
      "INSERT INTO movies (id, title, overview, release_date, poster_path, backdrop_path,
                           vote_average, vote_count, popularity, bookmarked)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
       ON CONFLICT(id) DO UPDATE SET
         title = excluded.title,
         overview = excluded.overview,
         release_date = excluded.release_date,
         poster_path = excluded.poster_path,
         backdrop_path = excluded.backdrop_path,
         vote_average = excluded.vote_average,
         vote_count = excluded.vote_count,
         popularity = excluded.popularity,
         bookmarked = excluded.bookmarked",
    )
    .map_err(|e| eyre!("Failed to prepare upsert: {}", e))?;

  for item in items {
    stmt
      .execute(params![
        item.id,
        item.title,
        item.overview,
        item.release_date,
        item.poster_path,
        item.backdrop_path,
        item.vote_average,
        item.vote_count,
        item.popularity,
        item.bookmarked,
      ])
      .map_err(|e| eyre!("Failed to store movie {}: {}", item.id, e))?;
  }

  Ok(())
}

fn clear_category(conn: &Connection, category: Category) -> Result<usize> {
  conn
    .execute(
      "DELETE FROM category_members WHERE category = ?",
      params![category.as_str()],
    )
    .map_err(|e| eyre!("Failed to clear {}: {}", category, e))
}

fn append_order(conn: &Connection, category: Category, ids: &[i64]) -> Result<usize> {
  let mut position: i64 = conn
    .query_row(
      "SELECT COALESCE(MAX(position) + 1, 0) FROM category_members WHERE category = ?",
      params![category.as_str()],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to read last position of {}: {}", category, e))?;

  let mut stmt = conn
    .prepare_cached(
      "INSERT OR IGNORE INTO category_members (category, movie_id, position) VALUES (?, ?, ?)",
    )
    .map_err(|e| eyre!("Failed to prepare order insert: {}", e))?;

  let mut added = 0;
  for id in ids {
    let inserted = stmt
      .execute(params![category.as_str(), id, position])
      .map_err(|e| eyre!("Failed to store position of {} in {}: {}", id, category, e))?;
    // An id already in the category keeps its place and does not use up a position
    if inserted > 0 {
      position += 1;
      added += 1;
    }
  }

  Ok(added)
}

fn replace_order(conn: &Connection, category: Category, ordered_ids: &[i64]) -> Result<()> {
  clear_category(conn, category)?;
  append_order(conn, category, ordered_ids)?;
  Ok(())
}

fn bookmark_flags(conn: &Connection, ids: &[i64]) -> Result<HashMap<i64, bool>> {
  if ids.is_empty() {
    return Ok(HashMap::new());
  }

  let placeholders = vec!["?"; ids.len()].join(", ");
  let sql = format!(
    "SELECT id, bookmarked FROM movies WHERE id IN ({})",
    placeholders
  );
  let mut stmt = conn
    .prepare(&sql)
    .map_err(|e| eyre!("Failed to prepare bookmark lookup: {}", e))?;

  let flags = stmt
    .query_map(params_from_iter(ids.iter()), |row| {
      Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?))
    })
    .map_err(|e| eyre!("Failed to query bookmarks: {}", e))?
    .collect::<rusqlite::Result<HashMap<_, _>>>()
    .map_err(|e| eyre!("Failed to read bookmark row: {}", e))?;

  Ok(flags)
}

fn write_sync(
  conn: &Connection,
  category: Category,
  page: u32,
  total_pages: u32,
  refreshed: bool,
) -> Result<()> {
  let sql = if refreshed {
    "INSERT INTO category_sync (category, last_page, total_pages, refreshed_at)
     VALUES (?, ?, ?, datetime('now'))
     ON CONFLICT(category) DO UPDATE SET
       last_page = excluded.last_page,
       total_pages = excluded.total_pages,
       refreshed_at = excluded.refreshed_at"
  } else {
    "INSERT INTO category_sync (category, last_page, total_pages, refreshed_at)
     VALUES (?, ?, ?, NULL)
     ON CONFLICT(category) DO UPDATE SET
       last_page = excluded.last_page,
       total_pages = excluded.total_pages"
  };

  conn
    .execute(sql, params![category.as_str(), page, total_pages])
    .map_err(|e| eyre!("Failed to record sync state of {}: {}", category, e))?;

  Ok(())
}

/// LIKE pattern matching `text` anywhere, with wildcards in `text` escaped.
fn like_pattern(text: &str) -> String {
  // SQLite's LOWER only folds ASCII, so fold the needle the same way
  let escaped = text
    .to_ascii_lowercase()
    .replace('\\', "\\\\")
    .replace('%', "\\%")
    .replace('_', "\\_");
  format!("%{}%", escaped)
}

impl RecordStore for SqliteStore {
  fn upsert_items(&self, items: &[MovieRecord]) -> Result<()> {
    self.transaction(|conn| upsert_rows(conn, items))
  }

  fn replace_category_order(&self, category: Category, ordered_ids: &[i64]) -> Result<()> {
    self.transaction(|conn| replace_order(conn, category, ordered_ids))
  }

  fn append_category_order(&self, category: Category, ids: &[i64]) -> Result<usize> {
    self.transaction(|conn| append_order(conn, category, ids))
  }

  fn get_page(&self, category: Category, offset: usize, limit: usize) -> Result<Vec<MovieRecord>> {
    let sql = format!(
      "SELECT {} FROM movies m
       INNER JOIN category_members c ON c.movie_id = m.id
       WHERE c.category = ?
       ORDER BY c.position ASC
       LIMIT ? OFFSET ?",
      MOVIE_COLUMNS
    );
    self.query_records(
      &sql,
      params![category.as_str(), limit as i64, offset as i64],
    )
  }

  fn count_category(&self, category: Category) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM category_members WHERE category = ?",
        params![category.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count {}: {}", category, e))?;

    Ok(count as usize)
  }

  fn get_by_id(&self, id: i64) -> Result<Option<MovieRecord>> {
    let sql = format!("SELECT {} FROM movies m WHERE m.id = ?", MOVIE_COLUMNS);
    let conn = self.conn()?;

    conn
      .query_row(&sql, params![id], row_to_record)
      .optional()
      .map_err(|e| eyre!("Failed to get movie {}: {}", id, e))
  }

  fn get_bookmark_flags(&self, ids: &[i64]) -> Result<HashMap<i64, bool>> {
    let conn = self.conn()?;
    bookmark_flags(&conn, ids)
  }

  fn search_by_title_substring(&self, text: &str) -> Result<Vec<MovieRecord>> {
    let sql = format!(
      "SELECT {} FROM movies m
       WHERE LOWER(m.title) LIKE ? ESCAPE '\\'
       ORDER BY m.popularity DESC, m.id ASC",
      MOVIE_COLUMNS
    );
    self.query_records(&sql, params![like_pattern(text)])
  }

  fn get_bookmarked(&self) -> Result<Vec<MovieRecord>> {
    let sql = format!(
      "SELECT {} FROM movies m
       WHERE m.bookmarked = 1
       ORDER BY m.popularity DESC, m.id ASC",
      MOVIE_COLUMNS
    );
    self.query_records(&sql, params![])
  }

  fn set_bookmark(&self, id: i64, bookmarked: bool) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn
      .execute(
        "UPDATE movies SET bookmarked = ? WHERE id = ?",
        params![bookmarked, id],
      )
      .map_err(|e| eyre!("Failed to update bookmark of {}: {}", id, e))?;

    Ok(changed > 0)
  }

  fn toggle_bookmark(&self, id: i64) -> Result<Option<bool>> {
    self.transaction(|conn| {
      conn
        .execute(
          "UPDATE movies SET bookmarked = NOT bookmarked WHERE id = ?",
          params![id],
        )
        .map_err(|e| eyre!("Failed to toggle bookmark of {}: {}", id, e))?;

      conn
        .query_row(
          "SELECT bookmarked FROM movies WHERE id = ?",
          params![id],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read bookmark of {}: {}", id, e))
    })
  }

  fn commit_page(&self, commit: PageCommit<'_>) -> Result<Vec<MovieRecord>> {
    self.transaction(|conn| {
      let flags = bookmark_flags(conn, commit.ids)?;
      let records = (commit.merge)(&flags);
      upsert_rows(conn, &records)?;

      match commit.order {
        OrderUpdate::Replace(category) => {
          replace_order(conn, category, commit.ids)?;
          write_sync(conn, category, commit.page, commit.total_pages, true)?;
        }
        OrderUpdate::Append(category) => {
          append_order(conn, category, commit.ids)?;
          write_sync(conn, category, commit.page, commit.total_pages, false)?;
        }
        OrderUpdate::Orphaned => {}
      }

      Ok(records)
    })
  }

  fn sync_state(&self, category: Category) -> Result<Option<CategorySync>> {
    let conn = self.conn()?;
    let row: Option<(u32, u32, Option<String>)> = conn
      .query_row(
        "SELECT last_page, total_pages, refreshed_at FROM category_sync WHERE category = ?",
        params![category.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read sync state of {}: {}", category, e))?;

    match row {
      Some((last_page, total_pages, refreshed_at)) => Ok(Some(CategorySync {
        last_page,
        total_pages,
        refreshed_at: refreshed_at.as_deref().map(parse_datetime).transpose()?,
      })),
      None => Ok(None),
    }
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn movie(id: i64, title: &str, popularity: f64) -> MovieRecord {
    MovieRecord {
      id,
      title: title.to_string(),
      overview: String::new(),
      release_date: "2008-07-18".to_string(),
      poster_path: format!("/{}.jpg", id),
      backdrop_path: String::new(),
      vote_average: 8.5,
      vote_count: 100,
      popularity,
      bookmarked: false,
    }
  }

  fn positions(store: &SqliteStore, category: Category) -> Vec<(i64, i64)> {
    let conn = store.conn().unwrap();
    let mut stmt = conn
      .prepare("SELECT movie_id, position FROM category_members WHERE category = ? ORDER BY position")
      .unwrap();
    stmt
      .query_map(params![category.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))
      .unwrap()
      .collect::<rusqlite::Result<Vec<_>>>()
      .unwrap()
  }

  fn ids(records: &[MovieRecord]) -> Vec<i64> {
    records.iter().map(|m| m.id).collect()
  }

  #[test]
  fn test_upsert_overwrites_by_id() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.upsert_items(&[movie(1, "Old title", 1.0)]).unwrap();
    store.upsert_items(&[movie(1, "New title", 2.0)]).unwrap();

    let stored = store.get_by_id(1).unwrap().unwrap();
    assert_eq!(stored.title, "New title");
    assert_eq!(stored.popularity, 2.0);
    assert_eq!(store.get_by_id(2).unwrap(), None);
  }

  #[test]
  fn test_replace_order_assigns_dense_positions() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert_items(&[movie(1, "a", 1.0), movie(2, "b", 1.0), movie(3, "c", 1.0)])
      .unwrap();

    store
      .replace_category_order(Category::Trending, &[3, 1, 2])
      .unwrap();
    store
      .replace_category_order(Category::Trending, &[1, 2, 3])
      .unwrap();

    assert_eq!(
      positions(&store, Category::Trending),
      vec![(1, 0), (2, 1), (3, 2)]
    );
  }

  #[test]
  fn test_replace_order_skips_duplicate_ids() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert_items(&[movie(1, "a", 1.0), movie(2, "b", 1.0)])
      .unwrap();

    store
      .replace_category_order(Category::Trending, &[1, 2, 1])
      .unwrap();

    assert_eq!(positions(&store, Category::Trending), vec![(1, 0), (2, 1)]);
  }

  #[test]
  fn test_append_continues_after_last_position() {
    let store = SqliteStore::open_in_memory().unwrap();
    let movies: Vec<_> = (1..=5).map(|id| movie(id, "m", 1.0)).collect();
    store.upsert_items(&movies).unwrap();

    store
      .replace_category_order(Category::NowPlaying, &[1, 2])
      .unwrap();
    let added = store
      .append_category_order(Category::NowPlaying, &[2, 3, 4])
      .unwrap();

    assert_eq!(added, 2);
    assert_eq!(
      positions(&store, Category::NowPlaying),
      vec![(1, 0), (2, 1), (3, 2), (4, 3)]
    );
  }

  #[test]
  fn test_categories_are_independent() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert_items(&[movie(1, "a", 1.0), movie(2, "b", 1.0)])
      .unwrap();

    store
      .replace_category_order(Category::Trending, &[1, 2])
      .unwrap();
    store
      .replace_category_order(Category::NowPlaying, &[2])
      .unwrap();

    assert_eq!(store.count_category(Category::Trending).unwrap(), 2);
    assert_eq!(store.count_category(Category::NowPlaying).unwrap(), 1);
  }

  #[test]
  fn test_get_page_windows_and_tail() {
    let store = SqliteStore::open_in_memory().unwrap();
    let movies: Vec<_> = (1..=5).map(|id| movie(id, "m", id as f64)).collect();
    store.upsert_items(&movies).unwrap();
    store
      .replace_category_order(Category::Trending, &[5, 4, 3, 2, 1])
      .unwrap();

    assert_eq!(
      ids(&store.get_page(Category::Trending, 0, 2).unwrap()),
      vec![5, 4]
    );
    assert_eq!(
      ids(&store.get_page(Category::Trending, 2, 2).unwrap()),
      vec![3, 2]
    );
    assert_eq!(
      ids(&store.get_page(Category::Trending, 4, 2).unwrap()),
      vec![1]
    );
    assert!(store.get_page(Category::Trending, 10, 2).unwrap().is_empty());
  }

  #[test]
  fn test_search_matches_orphans_case_insensitively() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert_items(&[
        movie(1, "Batman Begins", 50.0),
        movie(2, "The Batman", 90.0),
        movie(3, "Heat", 70.0),
      ])
      .unwrap();
    // Only one of them has any category membership
    store
      .replace_category_order(Category::Trending, &[3])
      .unwrap();

    let found = store.search_by_title_substring("BATMAN").unwrap();
    assert_eq!(ids(&found), vec![2, 1]);
  }

  #[test]
  fn test_search_treats_wildcards_literally() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert_items(&[movie(1, "100% Wolf", 1.0), movie(2, "100 Wolves", 2.0)])
      .unwrap();

    assert_eq!(ids(&store.search_by_title_substring("0%").unwrap()), vec![1]);
    assert!(store.search_by_title_substring("w_lf").unwrap().is_empty());
  }

  #[test]
  fn test_bookmarked_sorted_by_popularity() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert_items(&[movie(1, "a", 10.0), movie(2, "b", 30.0), movie(3, "c", 20.0)])
      .unwrap();

    assert!(store.set_bookmark(1, true).unwrap());
    assert!(store.set_bookmark(2, true).unwrap());
    assert!(!store.set_bookmark(99, true).unwrap());

    assert_eq!(ids(&store.get_bookmarked().unwrap()), vec![2, 1]);
    let flags = store.get_bookmark_flags(&[1, 3, 99]).unwrap();
    assert_eq!(flags.get(&1), Some(&true));
    assert_eq!(flags.get(&3), Some(&false));
    assert_eq!(flags.get(&99), None);
  }

  #[test]
  fn test_toggle_twice_is_durable_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.upsert_items(&[movie(7, "Se7en", 1.0)]).unwrap();
      assert_eq!(store.toggle_bookmark(7).unwrap(), Some(true));
    }
    {
      let store = SqliteStore::open(&path).unwrap();
      assert!(store.get_by_id(7).unwrap().unwrap().bookmarked);
      assert_eq!(store.toggle_bookmark(7).unwrap(), Some(false));
    }

    let store = SqliteStore::open(&path).unwrap();
    assert!(!store.get_by_id(7).unwrap().unwrap().bookmarked);
    assert_eq!(store.toggle_bookmark(404).unwrap(), None);
  }

  #[test]
  fn test_commit_page_merges_with_stored_flags() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.upsert_items(&[movie(1, "a", 1.0)]).unwrap();
    store.set_bookmark(1, true).unwrap();

    let written = store
      .commit_page(PageCommit {
        ids: &[1, 2],
        order: OrderUpdate::Replace(Category::Trending),
        page: 1,
        total_pages: 4,
        merge: &|flags| {
          vec![
            MovieRecord {
              bookmarked: flags.get(&1).copied().unwrap_or(false),
              ..movie(1, "a (updated)", 5.0)
            },
            MovieRecord {
              bookmarked: flags.get(&2).copied().unwrap_or(false),
              ..movie(2, "b", 3.0)
            },
          ]
        },
      })
      .unwrap();

    assert!(written[0].bookmarked);
    assert!(!written[1].bookmarked);
    assert_eq!(store.get_by_id(1).unwrap().unwrap().title, "a (updated)");
    assert_eq!(positions(&store, Category::Trending), vec![(1, 0), (2, 1)]);

    let sync = store.sync_state(Category::Trending).unwrap().unwrap();
    assert_eq!(sync.last_page, 1);
    assert_eq!(sync.total_pages, 4);
    assert!(!sync.end_of_pagination());
    assert!(sync.refreshed_at.is_some());
    assert_eq!(store.sync_state(Category::NowPlaying).unwrap(), None);
  }

  fn commit(store: &SqliteStore, ids: &[i64], order: OrderUpdate, page: u32) {
    store
      .commit_page(PageCommit {
        ids,
        order,
        page,
        total_pages: 3,
        merge: &|_| ids.iter().map(|&id| movie(id, "m", 1.0)).collect(),
      })
      .unwrap();
  }

  #[test]
  fn test_append_without_refresh_has_no_refresh_time() {
    let store = SqliteStore::open_in_memory().unwrap();
    commit(&store, &[1, 2], OrderUpdate::Append(Category::Trending), 1);

    let sync = store.sync_state(Category::Trending).unwrap().unwrap();
    assert_eq!(sync.last_page, 1);
    assert_eq!(sync.refreshed_at, None);

    commit(&store, &[1, 2], OrderUpdate::Replace(Category::Trending), 1);
    let refreshed = store.sync_state(Category::Trending).unwrap().unwrap().refreshed_at;
    assert!(refreshed.is_some());

    // Later appends keep the refresh time
    commit(&store, &[3], OrderUpdate::Append(Category::Trending), 2);
    let sync = store.sync_state(Category::Trending).unwrap().unwrap();
    assert_eq!(sync.last_page, 2);
    assert_eq!(sync.refreshed_at, refreshed);
  }

  #[test]
  fn test_readers_never_see_partial_refresh() {
    let store = SqliteStore::open_in_memory().unwrap();
    let long: Vec<i64> = (1..=400).collect();
    let short: Vec<i64> = (1000..1150).collect();
    commit(&store, &long, OrderUpdate::Replace(Category::Trending), 1);

    let done = std::sync::atomic::AtomicBool::new(false);
    std::thread::scope(|scope| {
      scope.spawn(|| {
        for round in 0..30 {
          let ids = if round % 2 == 0 { &short } else { &long };
          commit(&store, ids, OrderUpdate::Replace(Category::Trending), 1);
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);
      });

      let mut reads = 0;
      while !done.load(std::sync::atomic::Ordering::SeqCst) || reads == 0 {
        let count = store.count_category(Category::Trending).unwrap();
        assert!(count == long.len() || count == short.len(), "partial count {}", count);

        let page = ids(&store.get_page(Category::Trending, 0, 1000).unwrap());
        assert!(page == long || page == short, "partial order of {} ids", page.len());
        reads += 1;
      }
    });
  }

  #[test]
  fn test_orphaned_commit_leaves_order_untouched() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .commit_page(PageCommit {
        ids: &[9],
        order: OrderUpdate::Orphaned,
        page: 1,
        total_pages: 1,
        merge: &|_| vec![movie(9, "Nine", 1.0)],
      })
      .unwrap();

    assert!(store.get_by_id(9).unwrap().is_some());
    for category in Category::ALL {
      assert_eq!(store.count_category(category).unwrap(), 0);
      assert_eq!(store.sync_state(category).unwrap(), None);
    }
  }
}
