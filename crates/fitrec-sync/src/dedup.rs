//! Brand-scoped duplicate product detection.

use std::collections::BTreeMap;

use fitrec_core::{model_numbers, similarity, BrandId, DuplicateCandidatePair, Product, ProductId};
use fitrec_storage::{CatalogStore, StoreResult};
use tracing::info;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub threshold: f64,
    /// Never pair names whose digit tokens differ ("air max 270" vs "air max 90").
    pub require_matching_model_numbers: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            require_matching_model_numbers: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> DedupConfig {
        self.config
    }

    /// Every unordered same-brand pair scoring at or above the threshold. O(n^2) per brand;
    /// meant for offline admin runs. Output order is unspecified.
    pub fn find_candidates(&self, products: &[Product]) -> Vec<DuplicateCandidatePair> {
        let mut by_brand: BTreeMap<BrandId, Vec<(ProductId, String)>> = BTreeMap::new();
        for product in products {
            by_brand
                .entry(product.brand_id)
                .or_default()
                .push((product.id, product.canonical_key()));
        }

        let mut pairs = Vec::new();
        for (brand_id, group) in &by_brand {
            for i in 0..group.len() {
                for j in (i + 1)..group.len() {
                    let (id_a, key_a) = &group[i];
                    let (id_b, key_b) = &group[j];
                    if self.config.require_matching_model_numbers
                        && model_numbers(key_a) != model_numbers(key_b)
                    {
                        continue;
                    }
                    let score = similarity(key_a, key_b);
                    if score >= self.config.threshold {
                        pairs.push(DuplicateCandidatePair {
                            brand_id: *brand_id,
                            product_a: *id_a,
                            product_b: *id_b,
                            score,
                        });
                    }
                }
            }
        }
        pairs
    }

    pub async fn find_duplicates(&self, catalog: &dyn CatalogStore) -> StoreResult<Vec<DuplicateCandidatePair>> {
        let products = catalog.list_products().await?;
        let pairs = self.find_candidates(&products);
        info!(products = products.len(), candidates = pairs.len(), "duplicate scan finished");
        Ok(pairs)
    }
}

/// Keep-oldest rule for callers that merge automatically: the earlier-created product
/// survives, lower id on ties. Returns `(keep, delete)`.
pub fn choose_survivor(a: &Product, b: &Product) -> (ProductId, ProductId) {
    if (a.created_at, a.id) <= (b.created_at, b.id) {
        (a.id, b.id)
    } else {
        (b.id, a.id)
    }
}
