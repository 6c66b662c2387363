//! In-memory implementation of the catalog and review cache stores.
//!
//! Not durable: state is lost on restart, so this backs tests and local experiments only.
//! Every mutation takes the single write lock, which makes merges all-or-nothing the same
//! way the Postgres transaction does. Cache rows go away with their product, as the SQL
//! cascade does.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fitrec_core::{
    normalize_name, Brand, BrandId, CachedReviewSnippet, NewSnippet, Product, ProductId,
    Recommendation, ReviewCacheEntry,
};
use tokio::sync::RwLock;

use crate::{CatalogStore, ReviewCacheStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    brands: BTreeMap<BrandId, Brand>,
    products: BTreeMap<ProductId, Product>,
    recommendations: BTreeMap<i64, Recommendation>,
    entries: HashMap<ProductId, ReviewCacheEntry>,
    snippets: Vec<CachedReviewSnippet>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Newest first, matching the Postgres ordering.
    fn snippets_matching(
        &self,
        keep: impl Fn(&CachedReviewSnippet) -> bool,
    ) -> Vec<CachedReviewSnippet> {
        let mut snippets = self
            .snippets
            .iter()
            .filter(|s| keep(s))
            .cloned()
            .collect::<Vec<_>>();
        snippets.sort_by(|a, b| b.fetched_at.cmp(&a.fetched_at).then(b.id.cmp(&a.id)));
        snippets
    }

    fn require_product(&self, product_id: ProductId) -> StoreResult<()> {
        if self.products.contains_key(&product_id) {
            Ok(())
        } else {
            Err(StoreError::Conflict(format!(
                "product {product_id} does not exist"
            )))
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_brand(&self, name: &str) -> Brand {
        let mut state = self.state.write().await;
        let brand = Brand {
            id: state.allocate_id(),
            name: name.to_string(),
        };
        state.brands.insert(brand.id, brand.clone());
        brand
    }

    /// Adds a product with its canonical key precomputed.
    pub async fn add_product(
        &self,
        brand_id: BrandId,
        name: &str,
        created_at: DateTime<Utc>,
    ) -> StoreResult<Product> {
        let mut state = self.state.write().await;
        if !state.brands.contains_key(&brand_id) {
            return Err(StoreError::Conflict(format!("brand {brand_id} does not exist")));
        }
        let product = Product {
            id: state.allocate_id(),
            brand_id,
            name: name.to_string(),
            normalized_name: Some(normalize_name(name)),
            url: None,
            created_at,
        };
        state.products.insert(product.id, product.clone());
        Ok(product)
    }

    /// Inserts a fully specified product, e.g. a legacy row without a stored canonical key.
    pub async fn insert_product(&self, product: Product) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.products.contains_key(&product.id) {
            return Err(StoreError::Conflict(format!("product {} already exists", product.id)));
        }
        state.next_id = state.next_id.max(product.id);
        state.products.insert(product.id, product);
        Ok(())
    }

    pub async fn add_recommendation(
        &self,
        product_id: ProductId,
        body: &str,
    ) -> StoreResult<Recommendation> {
        let mut state = self.state.write().await;
        state.require_product(product_id)?;
        let recommendation = Recommendation {
            id: state.allocate_id(),
            product_id,
            body: body.to_string(),
            created_at: Utc::now(),
        };
        state
            .recommendations
            .insert(recommendation.id, recommendation.clone());
        Ok(recommendation)
    }

    pub async fn recommendations_for(&self, product_id: ProductId) -> Vec<Recommendation> {
        let state = self.state.read().await;
        state
            .recommendations
            .values()
            .filter(|r| r.product_id == product_id)
            .cloned()
            .collect()
    }

    pub async fn snippet_count(&self, product_id: ProductId) -> usize {
        let state = self.state.read().await;
        state
            .snippets
            .iter()
            .filter(|s| s.product_id == product_id)
            .count()
    }
}

#[async_trait]
impl ReviewCacheStore for MemoryStore {
    async fn get_entry(&self, product_id: ProductId) -> StoreResult<Option<ReviewCacheEntry>> {
        let state = self.state.read().await;
        Ok(state.entries.get(&product_id).cloned())
    }

    async fn get_snippets(&self, product_id: ProductId) -> StoreResult<Vec<CachedReviewSnippet>> {
        let state = self.state.read().await;
        Ok(state.snippets_matching(|s| s.product_id == product_id))
    }

    async fn get_current_snippets(
        &self,
        product_id: ProductId,
    ) -> StoreResult<Vec<CachedReviewSnippet>> {
        let state = self.state.read().await;
        let Some(generation) = state.entries.get(&product_id).map(|e| e.refresh_generation) else {
            return Ok(Vec::new());
        };
        Ok(state.snippets_matching(|s| {
            s.product_id == product_id && s.refresh_generation == generation
        }))
    }

    async fn upsert_entry(
        &self,
        product_id: ProductId,
        search_query: &str,
        result_count: u32,
        fetched_at: DateTime<Utc>,
        stale_after: DateTime<Utc>,
    ) -> StoreResult<ReviewCacheEntry> {
        let mut state = self.state.write().await;
        state.require_product(product_id)?;
        let now = Utc::now();
        let (created_at, refresh_generation) = state
            .entries
            .get(&product_id)
            .map(|existing| (existing.created_at, existing.refresh_generation + 1))
            .unwrap_or((now, 1));
        let entry = ReviewCacheEntry {
            product_id,
            search_query: search_query.to_string(),
            result_count,
            last_searched_at: fetched_at,
            stale_after,
            refresh_generation,
            created_at,
            updated_at: now,
        };
        state.entries.insert(product_id, entry.clone());
        Ok(entry)
    }

    async fn upsert_snippets(
        &self,
        product_id: ProductId,
        refresh_generation: i64,
        snippets: &[NewSnippet],
    ) -> StoreResult<usize> {
        let mut state = self.state.write().await;
        state.require_product(product_id)?;
        let mut inserted = 0usize;
        for snippet in snippets {
            let existing = state.snippets.iter_mut().find(|s| {
                s.product_id == product_id
                    && match snippet.source_url.as_deref() {
                        Some(url) => s.source_url.as_deref() == Some(url),
                        None => s.source_url.is_none() && s.snippet == snippet.snippet,
                    }
            });
            if let Some(existing) = existing {
                existing.refresh_generation = existing.refresh_generation.max(refresh_generation);
                continue;
            }
            let id = state.allocate_id();
            state.snippets.push(CachedReviewSnippet {
                id,
                product_id,
                source_name: snippet.source_name.clone(),
                source_url: snippet.source_url.clone(),
                snippet: snippet.snippet.clone(),
                title: snippet.title.clone(),
                fetched_at: snippet.fetched_at,
                refresh_generation,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<ProductId>> {
        let state = self.state.read().await;
        let mut expired = state
            .entries
            .values()
            .filter(|e| e.stale_after <= now)
            .map(|e| (e.stale_after, e.product_id))
            .collect::<Vec<_>>();
        expired.sort();
        Ok(expired.into_iter().map(|(_, id)| id).collect())
    }

    async fn clear_entry(&self, product_id: ProductId) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        state.snippets.retain(|s| s.product_id != product_id);
        Ok(state.entries.remove(&product_id).is_some())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn get_product(&self, product_id: ProductId) -> StoreResult<Option<Product>> {
        let state = self.state.read().await;
        Ok(state.products.get(&product_id).cloned())
    }

    async fn get_brand(&self, brand_id: BrandId) -> StoreResult<Option<Brand>> {
        let state = self.state.read().await;
        Ok(state.brands.get(&brand_id).cloned())
    }

    async fn list_products(&self) -> StoreResult<Vec<Product>> {
        let state = self.state.read().await;
        let mut products = state.products.values().cloned().collect::<Vec<_>>();
        products.sort_by_key(|p| (p.brand_id, p.id));
        Ok(products)
    }

    async fn count_references(&self, product_id: ProductId) -> StoreResult<u64> {
        let state = self.state.read().await;
        Ok(state
            .recommendations
            .values()
            .filter(|r| r.product_id == product_id)
            .count() as u64)
    }

    async fn merge_products(&self, keep_id: ProductId, delete_id: ProductId) -> StoreResult<u64> {
        if keep_id == delete_id {
            return Err(StoreError::Conflict(format!(
                "cannot merge product {keep_id} into itself"
            )));
        }
        let mut state = self.state.write().await;
        for id in [keep_id, delete_id] {
            if !state.products.contains_key(&id) {
                return Err(StoreError::NotFound(format!("product {id}")));
            }
        }

        let mut repointed = 0u64;
        for recommendation in state.recommendations.values_mut() {
            if recommendation.product_id == delete_id {
                recommendation.product_id = keep_id;
                repointed += 1;
            }
        }

        state.products.remove(&delete_id);
        state.entries.remove(&delete_id);
        state.snippets.retain(|s| s.product_id != delete_id);
        Ok(repointed)
    }
}
