//! Sequential, rate-limited refresh of expired review cache entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fitrec_adapters::{SearchError, SearchProvider, MAX_RESULTS_PER_QUERY};
use fitrec_core::{ProductId, SearchResult};
use fitrec_storage::{CatalogStore, StoreError, StoreResult};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::ReviewCache;

/// Hard cap on external queries issued for one product in one cycle.
pub const MAX_QUERIES_PER_PRODUCT: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct RefreshConfig {
    /// Pause between two queries for the same product.
    pub query_delay: Duration,
    /// Pause between two products.
    pub product_delay: Duration,
    /// Upper bound on one search call, retries included.
    pub search_timeout: Duration,
    pub results_per_query: u8,
    pub max_queries_per_product: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            query_delay: Duration::from_secs(1),
            product_delay: Duration::from_secs(2),
            search_timeout: Duration::from_secs(15),
            results_per_query: 5,
            max_queries_per_product: MAX_QUERIES_PER_PRODUCT,
        }
    }
}

impl RefreshConfig {
    /// No pauses; used by tests and manual one-product refreshes.
    pub fn immediate() -> Self {
        Self {
            query_delay: Duration::ZERO,
            product_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Query set for one product, capped at the per-product policy.
pub fn build_queries(brand: &str, product: &str, max_queries: usize) -> Vec<String> {
    let subject = format!("{} {}", brand.trim(), product.trim()).trim().to_string();
    [
        format!("{subject} review sizing fit"),
        format!("{subject} reddit fit"),
    ]
    .into_iter()
    .take(max_queries.min(MAX_QUERIES_PER_PRODUCT))
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Refreshed { results: usize, failed_queries: usize },
    /// Every query answered but none returned anything. A zero-count entry was still written.
    Empty,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("product {0} not found")]
    ProductNotFound(ProductId),
    #[error("brand {brand_id} of product {product_id} not found")]
    BrandNotFound { product_id: ProductId, brand_id: i64 },
    #[error("{failed} of {attempted} search queries failed: {last}")]
    SearchFailed {
        attempted: usize,
        failed: usize,
        last: SearchError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub refreshed: usize,
    pub errored: usize,
    /// Due products left untouched because the sweep was asked to stop.
    pub skipped: usize,
    pub aborted: bool,
}

pub struct RefreshScheduler {
    cache: ReviewCache,
    catalog: Arc<dyn CatalogStore>,
    search: Arc<dyn SearchProvider>,
    config: RefreshConfig,
}

impl RefreshScheduler {
    pub fn new(
        cache: ReviewCache,
        catalog: Arc<dyn CatalogStore>,
        search: Arc<dyn SearchProvider>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            cache,
            catalog,
            search,
            config,
        }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Previously cached products whose entry has expired. Never-cached products are
    /// picked up on first access instead.
    pub async fn list_due_products(&self) -> StoreResult<Vec<ProductId>> {
        self.list_due_products_at(Utc::now()).await
    }

    pub async fn list_due_products_at(&self, now: DateTime<Utc>) -> StoreResult<Vec<ProductId>> {
        self.cache.store().list_expired(now).await
    }

    pub async fn refresh_product(&self, product_id: ProductId) -> Result<RefreshOutcome, RefreshError> {
        self.refresh_product_inner(product_id)
            .instrument(info_span!("refresh_product", product_id))
            .await
    }

    async fn refresh_product_inner(&self, product_id: ProductId) -> Result<RefreshOutcome, RefreshError> {
        let product = self
            .catalog
            .get_product(product_id)
            .await?
            .ok_or(RefreshError::ProductNotFound(product_id))?;
        let brand = self
            .catalog
            .get_brand(product.brand_id)
            .await?
            .ok_or(RefreshError::BrandNotFound {
                product_id,
                brand_id: product.brand_id,
            })?;

        let queries = build_queries(&brand.name, &product.name, self.config.max_queries_per_product);
        let per_query = self.config.results_per_query.clamp(1, MAX_RESULTS_PER_QUERY);

        let mut results: Vec<SearchResult> = Vec::new();
        let mut failed = 0usize;
        let mut last_error = None;
        for (idx, query) in queries.iter().enumerate() {
            if idx > 0 {
                pause(self.config.query_delay).await;
            }
            match self.search_bounded(query, per_query).await {
                Ok(mut hits) => results.append(&mut hits),
                Err(err) => {
                    warn!(query = %query, error = %err, "review search failed");
                    failed += 1;
                    last_error = Some(err);
                }
            }
        }

        if results.is_empty() {
            if let Some(last) = last_error {
                // Nothing written: the entry stays expired and the next sweep retries.
                return Err(RefreshError::SearchFailed {
                    attempted: queries.len(),
                    failed,
                    last,
                });
            }
        }

        let outcome = self
            .cache
            .store_reviews_at(
                product_id,
                &queries.join(" | "),
                &results,
                self.search.provider_id(),
                Utc::now(),
            )
            .await?;

        if outcome.entry.result_count == 0 {
            warn!("no review results; zero-count entry written");
            return Ok(RefreshOutcome::Empty);
        }
        Ok(RefreshOutcome::Refreshed {
            results: outcome.entry.result_count as usize,
            failed_queries: failed,
        })
    }

    async fn search_bounded(&self, query: &str, max_results: u8) -> Result<Vec<SearchResult>, SearchError> {
        match tokio::time::timeout(self.config.search_timeout, self.search.search(query, max_results)).await {
            Ok(result) => result,
            Err(_) => Err(SearchError::Timeout(self.config.search_timeout)),
        }
    }

    pub async fn run_sweep(&self) -> StoreResult<SweepSummary> {
        self.run_sweep_until(None).await
    }

    /// Like [`run_sweep`](Self::run_sweep), but stops between products once `shutdown`
    /// reads `true`.
    pub async fn run_sweep_with_shutdown(&self, shutdown: watch::Receiver<bool>) -> StoreResult<SweepSummary> {
        self.run_sweep_until(Some(shutdown)).await
    }

    async fn run_sweep_until(&self, shutdown: Option<watch::Receiver<bool>>) -> StoreResult<SweepSummary> {
        let run_id = Uuid::new_v4();
        self.sweep(run_id, shutdown)
            .instrument(info_span!("review_sweep", %run_id))
            .await
    }

    async fn sweep(&self, run_id: Uuid, shutdown: Option<watch::Receiver<bool>>) -> StoreResult<SweepSummary> {
        let started_at = Utc::now();
        let due = self.list_due_products_at(started_at).await?;
        info!(due = due.len(), "starting review sweep");

        let mut refreshed = 0usize;
        let mut errored = 0usize;
        let mut processed = 0usize;
        let mut aborted = false;

        for (idx, product_id) in due.iter().copied().enumerate() {
            if idx > 0 {
                pause(self.config.product_delay).await;
            }
            if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                warn!(remaining = due.len() - idx, "sweep stopped by shutdown signal");
                aborted = true;
                break;
            }

            processed += 1;
            match self.refresh_product(product_id).await {
                Ok(RefreshOutcome::Refreshed { .. }) => refreshed += 1,
                Ok(RefreshOutcome::Empty) => errored += 1,
                Err(err) => {
                    warn!(product_id, error = %err, "product refresh failed");
                    errored += 1;
                }
            }
        }

        let summary = SweepSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total: due.len(),
            refreshed,
            errored,
            skipped: due.len() - processed,
            aborted,
        };
        info!(
            total = summary.total,
            refreshed = summary.refreshed,
            errored = summary.errored,
            skipped = summary.skipped,
            "review sweep finished"
        );
        Ok(summary)
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_respect_the_two_query_policy() {
        let queries = build_queries("Nike", "Air Max 270", 5);
        assert_eq!(
            queries,
            vec![
                "Nike Air Max 270 review sizing fit".to_string(),
                "Nike Air Max 270 reddit fit".to_string(),
            ]
        );
        assert_eq!(build_queries("Nike", "Air Max 270", 1).len(), 1);
        assert!(build_queries("Nike", "Air Max 270", 0).is_empty());
    }

    #[test]
    fn immediate_config_has_no_pauses() {
        let config = RefreshConfig::immediate();
        assert!(config.query_delay.is_zero());
        assert!(config.product_delay.is_zero());
        assert_eq!(config.max_queries_per_product, MAX_QUERIES_PER_PRODUCT);
    }
}
