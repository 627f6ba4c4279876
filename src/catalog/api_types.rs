//! Serde-deserializable types matching catalog API responses.
//!
//! Only the fields consumed by the merge logic are modelled. Every field apart
//! from `id` is optional on the wire and defaults to empty/zero.

use serde::Deserialize;

use super::types::MovieRecord;

// ============================================================================
// Page responses (category feeds and search share one shape)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MovieDto {
  pub id: i64,
  pub title: Option<String>,
  pub overview: Option<String>,
  pub release_date: Option<String>,
  pub poster_path: Option<String>,
  pub backdrop_path: Option<String>,
  pub vote_average: Option<f64>,
  pub vote_count: Option<i64>,
  pub popularity: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageResponse {
  #[serde(default)]
  pub page: u32,
  #[serde(default)]
  pub results: Vec<MovieDto>,
  #[serde(default)]
  pub total_pages: u32,
  #[serde(default)]
  pub total_results: u64,
}

// ============================================================================
// Error body returned alongside non-2xx statuses
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiErrorResponse {
  pub status_message: Option<String>,
  pub status_code: Option<i64>,
}

// ============================================================================
// Conversions to domain types
// ============================================================================

impl MovieDto {
  /// Build a record from the server-owned fields, taking the bookmark flag
  /// from the caller.
  pub fn to_record(&self, bookmarked: bool) -> MovieRecord {
    MovieRecord {
      id: self.id,
      title: self.title.clone().unwrap_or_default(),
      overview: self.overview.clone().unwrap_or_default(),
      release_date: self.release_date.clone().unwrap_or_default(),
      poster_path: self.poster_path.clone().unwrap_or_default(),
      backdrop_path: self.backdrop_path.clone().unwrap_or_default(),
      vote_average: self.vote_average.unwrap_or_default(),
      vote_count: self.vote_count.unwrap_or_default(),
      popularity: self.popularity.unwrap_or_default(),
      bookmarked,
    }
  }
}
