use std::fmt;
use std::str::FromStr;

/// Feed whose display order is persisted as category membership.
///
/// Search results are deliberately not a category: they are stored as
/// orphaned records and re-queried by title instead of by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
  Trending,
  NowPlaying,
}

impl Category {
  pub const ALL: [Category; 2] = [Category::Trending, Category::NowPlaying];

  /// Tag stored in the membership table
  pub fn as_str(&self) -> &'static str {
    match self {
      Category::Trending => "TRENDING",
      Category::NowPlaying => "NOW_PLAYING",
    }
  }

  /// Remote endpoint path, relative to the API base URL
  pub fn endpoint(&self) -> &'static str {
    match self {
      Category::Trending => "movie/popular",
      Category::NowPlaying => "movie/now_playing",
    }
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Category {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace('-', "_").as_str() {
      "trending" | "popular" => Ok(Category::Trending),
      "now_playing" | "nowplaying" => Ok(Category::NowPlaying),
      other => Err(format!(
        "Unknown category '{}' (expected trending or now-playing)",
        other
      )),
    }
  }
}

/// A cached movie, as held by the record store
#[derive(Debug, Clone, PartialEq)]
pub struct MovieRecord {
  pub id: i64,
  pub title: String,
  pub overview: String,
  pub release_date: String,
  pub poster_path: String,
  pub backdrop_path: String,
  pub vote_average: f64,
  pub vote_count: i64,
  pub popularity: f64,
  /// Client-owned; never overwritten by a fetch
  pub bookmarked: bool,
}

impl MovieRecord {
  /// Release year for list display, if the date is present
  pub fn release_year(&self) -> Option<&str> {
    self.release_date.get(..4).filter(|y| y.len() == 4)
  }

  pub fn link(&self) -> String {
    format!("{}{}", MOVIE_LINK_PREFIX, self.id)
  }

  /// Message for sharing the movie with someone else
  pub fn share_text(&self) -> String {
    format!(
      "Hey, I found this great movie on InJoy:\n\n {}\nCheck out here: {}\n",
      self.title,
      self.link()
    )
  }
}

const MOVIE_LINK_PREFIX: &str = "injoy://movie/";

/// Movie id from either a bare id or an `injoy://movie/{id}` link.
pub fn parse_movie_ref(s: &str) -> Result<i64, String> {
  let s = s.trim();
  let id = s.strip_prefix(MOVIE_LINK_PREFIX).unwrap_or(s);
  id.trim_end_matches('/')
    .parse()
    .map_err(|_| format!("'{}' is neither a movie id nor an injoy://movie/ link", s))
}
