//! Entity merge: repoint references to the survivor, then drop the duplicate.

use std::sync::Arc;

use fitrec_core::ProductId;
use fitrec_storage::{CatalogStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("cannot merge product {0} into itself")]
    SameProduct(ProductId),
    #[error("product {0} not found")]
    ProductNotFound(ProductId),
    #[error("merge failed in store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub keep_id: ProductId,
    pub delete_id: ProductId,
    pub repointed: u64,
}

/// Which side survives is the caller's decision; see [`crate::dedup::choose_survivor`]
/// for the keep-oldest rule.
#[derive(Clone)]
pub struct MergeService {
    catalog: Arc<dyn CatalogStore>,
}

impl MergeService {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    pub async fn merge_products(&self, keep_id: ProductId, delete_id: ProductId) -> Result<MergeReport, MergeError> {
        if keep_id == delete_id {
            return Err(MergeError::SameProduct(keep_id));
        }
        for id in [keep_id, delete_id] {
            if self.catalog.get_product(id).await?.is_none() {
                return Err(MergeError::ProductNotFound(id));
            }
        }

        match self.catalog.merge_products(keep_id, delete_id).await {
            Ok(repointed) => {
                info!(keep_id, delete_id, repointed, "merged duplicate product");
                Ok(MergeReport {
                    keep_id,
                    delete_id,
                    repointed,
                })
            }
            Err(err) => {
                warn!(keep_id, delete_id, error = %err, "product merge rolled back");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use fitrec_core::{Brand, BrandId, Product};
    use fitrec_storage::{MemoryStore, StoreResult};

    async fn seeded() -> (Arc<MemoryStore>, ProductId, ProductId) {
        let store = Arc::new(MemoryStore::new());
        let brand = store.add_brand("Nike").await;
        let keep = store.add_product(brand.id, "Nike Air Max 270", Utc::now()).await.expect("keep");
        let dup = store.add_product(brand.id, "nike air max 270", Utc::now()).await.expect("dup");
        (store, keep.id, dup.id)
    }

    #[tokio::test]
    async fn merge_repoints_all_references_then_deletes() {
        let (store, keep, dup) = seeded().await;
        for body in ["runs small", "size up", "narrow"] {
            store.add_recommendation(dup, body).await.expect("rec");
        }

        let merge = MergeService::new(store.clone());
        let report = merge.merge_products(keep, dup).await.expect("merge");

        assert_eq!(report.repointed, 3);
        assert_eq!(store.count_references(dup).await.expect("count"), 0);
        assert_eq!(store.count_references(keep).await.expect("count"), 3);
        assert!(store.get_product(dup).await.expect("get").is_none());
        assert!(store.get_product(keep).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn same_ids_are_rejected_without_mutation() {
        let (store, keep, _dup) = seeded().await;
        store.add_recommendation(keep, "fits well").await.expect("rec");

        let merge = MergeService::new(store.clone());
        assert!(matches!(merge.merge_products(keep, keep).await, Err(MergeError::SameProduct(id)) if id == keep));
        assert!(store.get_product(keep).await.expect("get").is_some());
        assert_eq!(store.count_references(keep).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected() {
        let (store, keep, dup) = seeded().await;
        let merge = MergeService::new(store.clone());
        assert!(matches!(merge.merge_products(keep, 999).await, Err(MergeError::ProductNotFound(999))));
        assert!(matches!(merge.merge_products(999, dup).await, Err(MergeError::ProductNotFound(999))));
        assert!(store.get_product(dup).await.expect("get").is_some());
    }

    /// Delegates reads to a real store but fails the transactional merge.
    struct FailingMergeStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl CatalogStore for FailingMergeStore {
        async fn get_product(&self, product_id: ProductId) -> StoreResult<Option<Product>> {
            self.inner.get_product(product_id).await
        }

        async fn get_brand(&self, brand_id: BrandId) -> StoreResult<Option<Brand>> {
            self.inner.get_brand(brand_id).await
        }

        async fn list_products(&self) -> StoreResult<Vec<Product>> {
            self.inner.list_products().await
        }

        async fn count_references(&self, product_id: ProductId) -> StoreResult<u64> {
            self.inner.count_references(product_id).await
        }

        async fn merge_products(&self, _keep_id: ProductId, _delete_id: ProductId) -> StoreResult<u64> {
            Err(StoreError::Conflict("repoint rejected".into()))
        }
    }

    #[tokio::test]
    async fn store_failure_leaves_duplicate_intact() {
        let (store, keep, dup) = seeded().await;
        store.add_recommendation(dup, "runs small").await.expect("rec");

        let merge = MergeService::new(Arc::new(FailingMergeStore { inner: store.clone() }));
        let err = merge.merge_products(keep, dup).await.expect_err("merge must fail");

        assert!(matches!(err, MergeError::Store(StoreError::Conflict(_))));
        assert!(store.get_product(dup).await.expect("get").is_some());
        assert_eq!(store.count_references(dup).await.expect("count"), 1);
    }
}
