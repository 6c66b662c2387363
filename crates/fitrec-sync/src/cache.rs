//! Review cache service and freshness policy.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fitrec_core::{CachedReviewSnippet, NewSnippet, ProductId, ReviewCacheEntry, SearchResult};
use fitrec_adapters::source_name_for;
use fitrec_storage::{ReviewCacheStore, StoreResult};
use serde::Serialize;
use tracing::{info, warn};

pub const DEFAULT_STALENESS_DAYS: i64 = 7;

/// Source label for results that arrive through `store_reviews` without a provider.
pub const EXTERNAL_SOURCE: &str = "external";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Absent,
    Fresh,
    Expired,
}

impl CacheState {
    pub fn needs_refresh(self) -> bool {
        !matches!(self, CacheState::Fresh)
    }
}

/// Pure function of wall-clock time against the stored `stale_after`.
pub fn classify(entry: Option<&ReviewCacheEntry>, now: DateTime<Utc>) -> CacheState {
    match entry {
        None => CacheState::Absent,
        Some(entry) if now < entry.stale_after => CacheState::Fresh,
        Some(_) => CacheState::Expired,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    pub staleness_window: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::with_days(DEFAULT_STALENESS_DAYS)
    }
}

impl FreshnessPolicy {
    pub fn with_days(days: i64) -> Self {
        Self {
            staleness_window: Duration::days(days.max(0)),
        }
    }

    pub fn stale_after(&self, fetched_at: DateTime<Utc>) -> DateTime<Utc> {
        fetched_at + self.staleness_window
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedReviews {
    pub entry: ReviewCacheEntry,
    pub snippets: Vec<CachedReviewSnippet>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub product_id: ProductId,
    pub state: CacheState,
    pub entry: Option<ReviewCacheEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreOutcome {
    pub entry: ReviewCacheEntry,
    pub inserted_snippets: usize,
}

#[derive(Clone)]
pub struct ReviewCache {
    store: Arc<dyn ReviewCacheStore>,
    policy: FreshnessPolicy,
}

impl ReviewCache {
    pub fn new(store: Arc<dyn ReviewCacheStore>, policy: FreshnessPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn ReviewCacheStore> {
        &self.store
    }

    pub async fn status(&self, product_id: ProductId) -> StoreResult<CacheStatus> {
        self.status_at(product_id, Utc::now()).await
    }

    pub async fn status_at(&self, product_id: ProductId, now: DateTime<Utc>) -> StoreResult<CacheStatus> {
        let entry = self.store.get_entry(product_id).await?;
        Ok(CacheStatus {
            product_id,
            state: classify(entry.as_ref(), now),
            entry,
        })
    }

    /// Fresh snippets, or `None` when the caller should fetch live. Store failures are
    /// logged and reported as `None` too.
    pub async fn get_cached_reviews(&self, product_id: ProductId) -> Option<CachedReviews> {
        match self.try_get_cached_reviews_at(product_id, Utc::now()).await {
            Ok(cached) => cached,
            Err(err) => {
                warn!(product_id, error = %err, "review cache read failed; treating as absent");
                None
            }
        }
    }

    pub async fn try_get_cached_reviews_at(
        &self,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<CachedReviews>> {
        let Some(entry) = self.store.get_entry(product_id).await? else {
            return Ok(None);
        };
        if classify(Some(&entry), now) != CacheState::Fresh {
            return Ok(None);
        }
        let snippets = self.store.get_current_snippets(product_id).await?;
        Ok(Some(CachedReviews { entry, snippets }))
    }

    pub async fn store_reviews(
        &self,
        product_id: ProductId,
        query: &str,
        results: &[SearchResult],
    ) -> StoreResult<StoreOutcome> {
        self.store_reviews_at(product_id, query, results, EXTERNAL_SOURCE, Utc::now())
            .await
    }

    /// Writes the entry first, then the snippets under the entry's new refresh generation,
    /// so a reader never sees snippets without an entry and earlier batches drop out of reads.
    pub async fn store_reviews_at(
        &self,
        product_id: ProductId,
        query: &str,
        results: &[SearchResult],
        provider: &str,
        fetched_at: DateTime<Utc>,
    ) -> StoreResult<StoreOutcome> {
        let snippets = to_snippets(results, provider, fetched_at);
        let result_count = u32::try_from(snippets.len()).unwrap_or(u32::MAX);

        let entry = self
            .store
            .upsert_entry(
                product_id,
                query,
                result_count,
                fetched_at,
                self.policy.stale_after(fetched_at),
            )
            .await?;
        let inserted_snippets = self
            .store
            .upsert_snippets(product_id, entry.refresh_generation, &snippets)
            .await?;

        info!(
            product_id,
            result_count,
            inserted_snippets,
            stale_after = %entry.stale_after,
            "stored review snippets"
        );
        Ok(StoreOutcome {
            entry,
            inserted_snippets,
        })
    }

    pub async fn clear(&self, product_id: ProductId) -> StoreResult<bool> {
        let removed = self.store.clear_entry(product_id).await?;
        info!(product_id, removed, "cleared review cache");
        Ok(removed)
    }
}

/// Drops repeats within one batch: by source URL, or by text for URL-less results.
fn to_snippets(results: &[SearchResult], provider: &str, fetched_at: DateTime<Utc>) -> Vec<NewSnippet> {
    let mut seen_urls = HashSet::new();
    let mut seen_texts = HashSet::new();
    results
        .iter()
        .filter(|r| match r.url.as_deref() {
            Some(url) => seen_urls.insert(url),
            None => seen_texts.insert(r.snippet.as_str()),
        })
        .map(|r| NewSnippet {
            source_name: source_name_for(r.url.as_deref(), provider),
            source_url: r.url.clone(),
            snippet: r.snippet.clone(),
            title: r.title.clone(),
            fetched_at,
        })
        .collect()
}
