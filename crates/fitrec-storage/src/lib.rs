//! Relational store contracts + HTTP fetch utilities for FitRec.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fitrec_core::{
    Brand, BrandId, CachedReviewSnippet, NewSnippet, Product, ProductId, ReviewCacheEntry,
};
use thiserror::Error;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    is_retryable_error, is_retryable_status, FetchError, HttpClientConfig, HttpFetcher, RetryPolicy,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "fitrec-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persisted review cache: one entry per product plus its fetched snippets.
#[async_trait]
pub trait ReviewCacheStore: Send + Sync {
    /// `None` when the product was never cached.
    async fn get_entry(&self, product_id: ProductId) -> StoreResult<Option<ReviewCacheEntry>>;

    /// Every stored snippet, newest first; empty when nothing was stored.
    async fn get_snippets(&self, product_id: ProductId) -> StoreResult<Vec<CachedReviewSnippet>>;

    /// Only the snippets of the entry's current refresh generation, newest first.
    async fn get_current_snippets(
        &self,
        product_id: ProductId,
    ) -> StoreResult<Vec<CachedReviewSnippet>>;

    /// Creates or overwrites the single entry for `product_id` and bumps its refresh generation.
    async fn upsert_entry(
        &self,
        product_id: ProductId,
        search_query: &str,
        result_count: u32,
        fetched_at: DateTime<Utc>,
        stale_after: DateTime<Utc>,
    ) -> StoreResult<ReviewCacheEntry>;

    /// Inserts snippets stamped with `refresh_generation`. A snippet already stored under the
    /// same `(product_id, source_url)`, or the same text when it has no URL, is not inserted
    /// again; it is only moved into the given generation. Returns how many rows were new.
    async fn upsert_snippets(
        &self,
        product_id: ProductId,
        refresh_generation: i64,
        snippets: &[NewSnippet],
    ) -> StoreResult<usize>;

    /// Products whose entry has `stale_after <= now`, stalest first.
    async fn list_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<ProductId>>;

    /// Drops the entry and its snippets. Returns whether an entry existed.
    async fn clear_entry(&self, product_id: ProductId) -> StoreResult<bool>;
}

/// Brand-scoped product catalog and the references pointing into it.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_product(&self, product_id: ProductId) -> StoreResult<Option<Product>>;
    async fn get_brand(&self, brand_id: BrandId) -> StoreResult<Option<Brand>>;
    async fn list_products(&self) -> StoreResult<Vec<Product>>;
    async fn count_references(&self, product_id: ProductId) -> StoreResult<u64>;

    /// Repoints every reference from `delete_id` to `keep_id`, then deletes `delete_id`,
    /// as one transaction. Returns the number of repointed references. Equal ids are a
    /// `Conflict`.
    async fn merge_products(&self, keep_id: ProductId, delete_id: ProductId) -> StoreResult<u64>;
}
