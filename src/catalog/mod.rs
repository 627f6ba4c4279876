//! Movie catalog: domain types, wire types and the remote source.

pub mod api_types;
pub mod client;
pub mod remote;
pub mod types;

pub use api_types::{MovieDto, PageResponse};
pub use client::TmdbClient;
pub use remote::{FetchError, FetchResult, RemoteSource};
pub use types::{parse_movie_ref, Category, MovieRecord};
