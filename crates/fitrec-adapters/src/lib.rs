//! External search provider contract + concrete adapters.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fitrec_core::SearchResult;
use fitrec_storage::{FetchError, HttpClientConfig, HttpFetcher};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "fitrec-adapters";

/// Largest page the Custom Search JSON API will return.
pub const MAX_RESULTS_PER_QUERY: u8 = 10;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding search response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    /// Free-text search returning at most `max_results` hits.
    async fn search(&self, query: &str, max_results: u8) -> Result<Vec<SearchResult>, SearchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    CustomSearch,
    Fixture,
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "custom-search" | "google" => Ok(Self::CustomSearch),
            "fixture" => Ok(Self::Fixture),
            other => anyhow::bail!("unknown search provider {other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchAdapterConfig {
    pub kind: ProviderKind,
    pub endpoint: String,
    pub api_key: String,
    pub engine_id: String,
    pub fixture_path: PathBuf,
    pub http: HttpClientConfig,
}

pub fn provider_from_config(config: &SearchAdapterConfig) -> Result<Arc<dyn SearchProvider>> {
    match config.kind {
        ProviderKind::CustomSearch => {
            let http = HttpFetcher::new(config.http.clone())?;
            let provider = CustomSearchProvider::new(
                http,
                &config.endpoint,
                config.api_key.clone(),
                config.engine_id.clone(),
            )?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Fixture => Ok(Arc::new(FixtureSearchProvider::from_file(&config.fixture_path)?)),
    }
}

/// Google Programmable Search (Custom Search JSON API) adapter.
#[derive(Debug, Clone)]
pub struct CustomSearchProvider {
    http: HttpFetcher,
    endpoint: Url,
    api_key: String,
    engine_id: String,
}

impl CustomSearchProvider {
    pub fn new(http: HttpFetcher, endpoint: &str, api_key: String, engine_id: String) -> Result<Self> {
        if api_key.is_empty() || engine_id.is_empty() {
            anyhow::bail!("custom search provider needs an API key and an engine id");
        }
        let endpoint = Url::parse(endpoint).with_context(|| format!("parsing search endpoint {endpoint}"))?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            engine_id,
        })
    }

    fn request_url(&self, query: &str, max_results: u8) -> Url {
        let num = max_results.clamp(1, MAX_RESULTS_PER_QUERY).to_string();
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("key", &self.api_key)
            .append_pair("cx", &self.engine_id)
            .append_pair("q", query)
            .append_pair("num", &num);
        url
    }
}

#[async_trait]
impl SearchProvider for CustomSearchProvider {
    fn provider_id(&self) -> &'static str {
        "custom-search"
    }

    async fn search(&self, query: &str, max_results: u8) -> Result<Vec<SearchResult>, SearchError> {
        let url = self.request_url(query, max_results);
        let body = self.http.get_body(self.provider_id(), url).await?;
        let mut results = parse_custom_search_response(&body)?;
        results.truncate(max_results as usize);
        debug!(query, results = results.len(), "custom search completed");
        Ok(results)
    }
}

#[derive(Debug, Deserialize)]
struct CustomSearchResponse {
    #[serde(default)]
    items: Vec<CustomSearchItem>,
}

#[derive(Debug, Deserialize)]
struct CustomSearchItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    link: Option<String>,
}

/// A response without `items` means zero hits, not a malformed body.
pub fn parse_custom_search_response(body: &[u8]) -> Result<Vec<SearchResult>, SearchError> {
    let parsed: CustomSearchResponse = serde_json::from_slice(body)?;
    Ok(parsed
        .items
        .into_iter()
        .filter_map(|item| {
            let snippet = item.snippet?.trim().to_string();
            if snippet.is_empty() {
                return None;
            }
            Some(SearchResult {
                title: item.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
                snippet,
                url: item.link.filter(|l| !l.is_empty()),
            })
        })
        .collect())
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    queries: HashMap<String, Vec<SearchResult>>,
}

/// Offline adapter answering from a JSON file of canned query results.
#[derive(Debug, Clone, Default)]
pub struct FixtureSearchProvider {
    queries: HashMap<String, Vec<SearchResult>>,
}

impl FixtureSearchProvider {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: FixtureFile =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self {
            queries: file.queries,
        })
    }

    pub fn with_results(mut self, query: &str, results: Vec<SearchResult>) -> Self {
        self.queries.insert(query.to_string(), results);
        self
    }
}

#[async_trait]
impl SearchProvider for FixtureSearchProvider {
    fn provider_id(&self) -> &'static str {
        "fixture"
    }

    async fn search(&self, query: &str, max_results: u8) -> Result<Vec<SearchResult>, SearchError> {
        let mut results = self.queries.get(query).cloned().unwrap_or_default();
        results.truncate(max_results as usize);
        Ok(results)
    }
}

/// Display source for a snippet: the result host without `www.`, else `fallback`.
pub fn source_name_for(url: Option<&str>, fallback: &str) -> String {
    url.and_then(|u| Url::parse(u).ok())
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
