//! PostgreSQL store. Rows are mapped to typed records before leaving this module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fitrec_core::{
    Brand, BrandId, CachedReviewSnippet, NewSnippet, Product, ProductId, ReviewCacheEntry,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::{CatalogStore, ReviewCacheStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn entry_from_row(row: &PgRow) -> Result<ReviewCacheEntry, sqlx::Error> {
    let result_count: i32 = row.try_get("result_count")?;
    Ok(ReviewCacheEntry {
        product_id: row.try_get("product_id")?,
        search_query: row.try_get("search_query")?,
        result_count: result_count.max(0) as u32,
        last_searched_at: row.try_get("last_searched_at")?,
        stale_after: row.try_get("stale_after")?,
        refresh_generation: row.try_get("refresh_generation")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn snippet_from_row(row: &PgRow) -> Result<CachedReviewSnippet, sqlx::Error> {
    Ok(CachedReviewSnippet {
        id: row.try_get("id")?,
        product_id: row.try_get("product_id")?,
        source_name: row.try_get("source_name")?,
        source_url: row.try_get("source_url")?,
        snippet: row.try_get("snippet")?,
        title: row.try_get("title")?,
        fetched_at: row.try_get("fetched_at")?,
        refresh_generation: row.try_get("refresh_generation")?,
    })
}

fn product_from_row(row: &PgRow) -> Result<Product, sqlx::Error> {
    Ok(Product {
        id: row.try_get("id")?,
        brand_id: row.try_get("brand_id")?,
        name: row.try_get("name")?,
        normalized_name: row.try_get("normalized_name")?,
        url: row.try_get("url")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ReviewCacheStore for PgStore {
    async fn get_entry(&self, product_id: ProductId) -> StoreResult<Option<ReviewCacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT product_id, search_query, result_count, last_searched_at,
                   stale_after, refresh_generation, created_at, updated_at
              FROM review_cache
             WHERE product_id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(entry_from_row).transpose()?)
    }

    async fn get_snippets(&self, product_id: ProductId) -> StoreResult<Vec<CachedReviewSnippet>> {
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, source_name, source_url, snippet, title, fetched_at,
                   refresh_generation
              FROM cached_reviews
             WHERE product_id = $1
             ORDER BY fetched_at DESC, id DESC
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(snippet_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_current_snippets(
        &self,
        product_id: ProductId,
    ) -> StoreResult<Vec<CachedReviewSnippet>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.product_id, c.source_name, c.source_url, c.snippet, c.title,
                   c.fetched_at, c.refresh_generation
              FROM cached_reviews c
              JOIN review_cache e
                ON e.product_id = c.product_id
               AND e.refresh_generation = c.refresh_generation
             WHERE c.product_id = $1
             ORDER BY c.fetched_at DESC, c.id DESC
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(snippet_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn upsert_entry(
        &self,
        product_id: ProductId,
        search_query: &str,
        result_count: u32,
        fetched_at: DateTime<Utc>,
        stale_after: DateTime<Utc>,
    ) -> StoreResult<ReviewCacheEntry> {
        let row = sqlx::query(
            r#"
            INSERT INTO review_cache
                (product_id, search_query, result_count, last_searched_at, stale_after)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (product_id) DO UPDATE
               SET search_query = EXCLUDED.search_query,
                   result_count = EXCLUDED.result_count,
                   last_searched_at = EXCLUDED.last_searched_at,
                   stale_after = EXCLUDED.stale_after,
                   refresh_generation = review_cache.refresh_generation + 1,
                   updated_at = NOW()
            RETURNING product_id, search_query, result_count, last_searched_at,
                      stale_after, refresh_generation, created_at, updated_at
            "#,
        )
        .bind(product_id)
        .bind(search_query)
        .bind(i32::try_from(result_count).unwrap_or(i32::MAX))
        .bind(fetched_at)
        .bind(stale_after)
        .fetch_one(&self.pool)
        .await?;

        Ok(entry_from_row(&row)?)
    }

    async fn upsert_snippets(
        &self,
        product_id: ProductId,
        refresh_generation: i64,
        snippets: &[NewSnippet],
    ) -> StoreResult<usize> {
        if snippets.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for snippet in snippets {
            // An existing row keeps its text and fetch time; it only joins the newer generation.
            // `xmax = 0` holds for freshly inserted tuples.
            let sql = if snippet.source_url.is_some() {
                r#"
                INSERT INTO cached_reviews
                    (product_id, source_name, source_url, snippet, title, fetched_at,
                     refresh_generation)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (product_id, source_url) WHERE source_url IS NOT NULL DO UPDATE
                   SET refresh_generation =
                       GREATEST(cached_reviews.refresh_generation, EXCLUDED.refresh_generation)
                RETURNING (xmax = 0) AS inserted
                "#
            } else {
                r#"
                INSERT INTO cached_reviews
                    (product_id, source_name, source_url, snippet, title, fetched_at,
                     refresh_generation)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (product_id, md5(snippet)) WHERE source_url IS NULL DO UPDATE
                   SET refresh_generation =
                       GREATEST(cached_reviews.refresh_generation, EXCLUDED.refresh_generation)
                RETURNING (xmax = 0) AS inserted
                "#
            };
            let was_inserted: bool = sqlx::query_scalar(sql)
                .bind(product_id)
                .bind(&snippet.source_name)
                .bind(snippet.source_url.as_deref())
                .bind(&snippet.snippet)
                .bind(snippet.title.as_deref())
                .bind(snippet.fetched_at)
                .bind(refresh_generation)
                .fetch_one(&mut *tx)
                .await?;
            if was_inserted {
                inserted += 1;
            }
        }
        tx.commit().await?;

        Ok(inserted)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<ProductId>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT product_id
              FROM review_cache
             WHERE stale_after <= $1
             ORDER BY stale_after ASC, product_id ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn clear_entry(&self, product_id: ProductId) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM cached_reviews WHERE product_id = $1")
            .bind(product_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM review_cache WHERE product_id = $1")
            .bind(product_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn get_product(&self, product_id: ProductId) -> StoreResult<Option<Product>> {
        let row = sqlx::query(
            r#"
            SELECT id, brand_id, name, normalized_name, url, created_at
              FROM products
             WHERE id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(product_from_row).transpose()?)
    }

    async fn get_brand(&self, brand_id: BrandId) -> StoreResult<Option<Brand>> {
        let row = sqlx::query("SELECT id, name FROM brands WHERE id = $1")
            .bind(brand_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Brand {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            })),
            None => Ok(None),
        }
    }

    async fn list_products(&self) -> StoreResult<Vec<Product>> {
        let rows = sqlx::query(
            r#"
            SELECT id, brand_id, name, normalized_name, url, created_at
              FROM products
             ORDER BY brand_id, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(product_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn count_references(&self, product_id: ProductId) -> StoreResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM recommendations WHERE product_id = $1")
                .bind(product_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn merge_products(&self, keep_id: ProductId, delete_id: ProductId) -> StoreResult<u64> {
        if keep_id == delete_id {
            return Err(StoreError::Conflict(format!(
                "cannot merge product {keep_id} into itself"
            )));
        }

        // Dropping `tx` on any early return rolls the whole merge back.
        let mut tx = self.pool.begin().await?;

        let locked: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM products WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(vec![keep_id, delete_id])
        .fetch_all(&mut *tx)
        .await?;
        for id in [keep_id, delete_id] {
            if !locked.contains(&id) {
                return Err(StoreError::NotFound(format!("product {id}")));
            }
        }

        let repointed = sqlx::query("UPDATE recommendations SET product_id = $1 WHERE product_id = $2")
            .bind(keep_id)
            .bind(delete_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let deleted = sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(delete_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted != 1 {
            return Err(StoreError::Conflict(format!(
                "product {delete_id} disappeared during merge"
            )));
        }

        tx.commit().await?;
        Ok(repointed)
    }
}
