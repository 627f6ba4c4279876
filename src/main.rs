use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use injoy::cache::{RecordStore, SqliteStore};
use injoy::catalog::{parse_movie_ref, Category, MovieRecord, TmdbClient};
use injoy::config::Config;
use injoy::connectivity::{self, Connectivity};
use injoy::query::{Query, ViewState};
use injoy::search::{ResultSource, SearchCoordinator};
use injoy::sync::{Pager, SyncMediator};

#[derive(Parser, Debug)]
#[command(name = "injoy")]
#[command(about = "Browse trending and now-playing movies, online or from the local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/injoy/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Log to stderr instead of the log file
  #[arg(long, global = true)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List a category feed
  Feed {
    /// trending or now-playing
    category: Category,

    /// Number of pages to show
    #[arg(short, long, default_value_t = 1)]
    pages: usize,

    /// Fetch from the network even if the feed is cached
    #[arg(short, long)]
    refresh: bool,
  },

  /// Search movie titles
  Search {
    query: String,

    /// Search stored titles only
    #[arg(long)]
    offline: bool,
  },

  /// List bookmarked movies
  Saved,

  /// Show one cached movie, by id or injoy://movie/ link
  Show {
    #[arg(value_parser = parse_movie_ref)]
    movie: i64,
  },

  /// Print a shareable link for a cached movie
  Share {
    #[arg(value_parser = parse_movie_ref)]
    movie: i64,
  },

  /// Toggle the bookmark on a cached movie
  Bookmark { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose, args.log_stderr)?;

  let config = Config::load(args.config.as_deref())?;
  let db_path = config.database_path()?;
  info!(path = %db_path.display(), "Opening cache");
  let store = Arc::new(SqliteStore::open(&db_path)?);

  match args.command {
    Command::Feed {
      category,
      pages,
      refresh,
    } => feed(&config, store, category, pages.max(1), refresh).await,
    Command::Search { query, offline } => search(&config, store, &query, offline).await,
    Command::Saved => {
      let saved = store.get_bookmarked()?;
      if saved.is_empty() {
        println!("No saved movies");
      } else {
        print_movies(&saved);
      }
      Ok(())
    }
    Command::Show { movie } => show(store, movie).await,
    Command::Share { movie } => match store.get_by_id(movie)? {
      Some(record) => {
        print!("{}", record.share_text());
        Ok(())
      }
      None => Err(eyre!("Movie {} is not in the cache", movie)),
    },
    Command::Bookmark { id } => match store.toggle_bookmark(id)? {
      Some(true) => {
        println!("Saved {}", id);
        Ok(())
      }
      Some(false) => {
        println!("Removed {} from saved", id);
        Ok(())
      }
      None => Err(eyre!("Movie {} is not in the cache", id)),
    },
  }
}

/// Logs go to a file in the data directory unless `to_stderr` is set, so they
/// stay out of command output.
fn init_logging(verbose: bool, to_stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter = if verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
  };

  if to_stderr {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  }

  let dir = Config::data_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", dir.display(), e))?;
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, "injoy.log"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(Some(guard))
}

async fn feed(
  config: &Config,
  store: Arc<SqliteStore>,
  category: Category,
  pages: usize,
  refresh: bool,
) -> Result<()> {
  let limit = pages * config.paging.page_size;

  if !refresh && store.count_category(category)? > 0 {
    print_movies(&store.get_page(category, 0, limit)?);
    print_refreshed_at(store.as_ref(), category)?;
    return Ok(());
  }

  let remote = Arc::new(TmdbClient::new(&config.tmdb)?);
  let mediator = Arc::new(SyncMediator::new(category, remote, store.clone()));
  let mut pager = Pager::new(mediator, store.clone(), config.paging);

  pager.refresh().await;
  while pager.len() < limit {
    let snapshot = pager.snapshot();
    if snapshot.end_of_pagination || snapshot.refresh.error().is_some() || snapshot.append.error().is_some() {
      break;
    }
    pager.load_more().await;
  }

  let snapshot = pager.snapshot();
  if let Some(e) = snapshot.refresh.error() {
    return Err(eyre!("Could not load {}: {}", category, e));
  }
  print_movies(&snapshot.items);
  if let Some(e) = snapshot.append.error() {
    eprintln!("Stopped after {} movies: {}", snapshot.items.len(), e);
  }
  print_refreshed_at(store.as_ref(), category)?;
  Ok(())
}

async fn search(config: &Config, store: Arc<SqliteStore>, query: &str, offline: bool) -> Result<()> {
  let online = !offline && connectivity::probe(&config.connectivity).await;
  let token = if online {
    Config::get_api_token()?
  } else {
    Config::get_api_token().unwrap_or_default()
  };
  let remote = Arc::new(TmdbClient::with_token(&config.tmdb, token)?);

  let coordinator = SearchCoordinator::new(
    remote,
    store,
    Connectivity::fixed(online),
    config.search.debounce(),
  );
  coordinator.on_query_changed(query);

  match coordinator.settled().await {
    ViewState::Idle | ViewState::Loading => Ok(()),
    ViewState::Empty => {
      println!("No results for \"{}\"", query.trim());
      Ok(())
    }
    ViewState::Success(results) => {
      print_movies(&results.items);
      if results.source == ResultSource::Local {
        println!("(offline: matched stored titles)");
      } else if !results.end_of_pagination {
        println!("(more results available)");
      }
      Ok(())
    }
    ViewState::Error(e) => Err(eyre!(e)),
  }
}

async fn show(store: Arc<SqliteStore>, id: i64) -> Result<()> {
  let mut detail = Query::new(move || {
    let store = store.clone();
    async move { store.get_by_id(id).map_err(|e| e.to_string()) }
  });
  detail.fetch();

  match detail.settle().await {
    ViewState::Idle | ViewState::Loading => Ok(()),
    ViewState::Success(movie) => {
      print_detail(movie);
      Ok(())
    }
    ViewState::Empty => Err(eyre!("Movie {} is not in the cache", id)),
    ViewState::Error(e) => Err(eyre!("Could not load movie {}: {}", id, e)),
  }
}

fn print_movies(items: &[MovieRecord]) {
  for (index, movie) in items.iter().enumerate() {
    println!(
      "{:>3}. {} {:<8} {} ({}) {:.1}",
      index + 1,
      if movie.bookmarked { "*" } else { " " },
      movie.id,
      movie.title,
      movie.release_year().unwrap_or("----"),
      movie.vote_average,
    );
  }
}

fn print_detail(movie: &MovieRecord) {
  println!("{} ({})", movie.title, movie.release_year().unwrap_or("----"));
  println!("id {}  rating {:.1} ({} votes)", movie.id, movie.vote_average, movie.vote_count);
  if movie.bookmarked {
    println!("saved");
  }
  println!("{}", movie.link());
  if !movie.overview.is_empty() {
    println!();
    println!("{}", movie.overview);
  }
}

fn print_refreshed_at(store: &dyn RecordStore, category: Category) -> Result<()> {
  if let Some(refreshed_at) = store.sync_state(category)?.and_then(|s| s.refreshed_at) {
    println!("{} refreshed {}", category, refreshed_at.format("%Y-%m-%d %H:%M UTC"));
  }
  Ok(())
}
