use crate::catalog::api_types::{ApiErrorResponse, PageResponse};
use crate::catalog::remote::{FetchError, FetchResult, RemoteSource};
use crate::catalog::types::Category;
use crate::config::{Config, TmdbConfig};
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// HTTP client for the movie catalog API
#[derive(Clone)]
pub struct TmdbClient {
  http: reqwest::Client,
  base_url: Url,
  token: String,
  language: String,
  include_adult: bool,
}

impl TmdbClient {
  pub fn new(config: &TmdbConfig) -> Result<Self> {
    let token = Config::get_api_token()?;
    Self::with_token(config, token)
  }

  pub fn with_token(config: &TmdbConfig, token: String) -> Result<Self> {
    // Url::join drops the last path segment unless the base ends in '/'
    let mut base = config.base_url.clone();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url =
      Url::parse(&base).map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      token,
      language: config.language.clone(),
      include_adult: config.include_adult,
    })
  }

  fn endpoint(&self, path: &str) -> FetchResult<Url> {
    self
      .base_url
      .join(path)
      .map_err(|e| FetchError::Transport(format!("Invalid endpoint {}: {}", path, e)))
  }

  /// GET one page and decode it
  async fn get_page(&self, path: &str, params: Vec<(&str, String)>) -> FetchResult<PageResponse> {
    let url = self.endpoint(path)?;
    debug!(%url, ?params, "Requesting catalog page");

    let response = self
      .http
      .get(url)
      .bearer_auth(&self.token)
      .query(&params)
      .send()
      .await
      .map_err(classify)?;

    let status = response.status();
    let body = response.bytes().await.map_err(classify)?;

    if !status.is_success() {
      let message = serde_json::from_slice::<ApiErrorResponse>(&body)
        .ok()
        .and_then(|e| e.status_message)
        .unwrap_or_else(|| {
          status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
        });
      return Err(FetchError::Remote {
        status: status.as_u16(),
        message,
      });
    }

    serde_json::from_slice(&body).map_err(|e| FetchError::Remote {
      status: status.as_u16(),
      message: format!("Failed to parse page: {}", e),
    })
  }
}

impl RemoteSource for TmdbClient {
  fn fetch_page(&self, category: Category, page: u32) -> BoxFuture<'_, FetchResult<PageResponse>> {
    let params = vec![
      ("language", self.language.clone()),
      ("page", page.to_string()),
    ];
    self.get_page(category.endpoint(), params).boxed()
  }

  fn search_page<'a>(
    &'a self,
    query: &'a str,
    page: u32,
  ) -> BoxFuture<'a, FetchResult<PageResponse>> {
    let params = vec![
      ("query", query.to_string()),
      ("include_adult", self.include_adult.to_string()),
      ("language", self.language.clone()),
      ("page", page.to_string()),
    ];
    self.get_page("search/movie", params).boxed()
  }
}

/// Map a reqwest failure onto the transport/remote split
fn classify(e: reqwest::Error) -> FetchError {
  match e.status() {
    Some(status) => FetchError::Remote {
      status: status.as_u16(),
      message: e.to_string(),
    },
    None => FetchError::Transport(e.to_string()),
  }
}
