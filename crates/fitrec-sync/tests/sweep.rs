use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use fitrec_adapters::{SearchError, SearchProvider};
use fitrec_core::{ProductId, SearchResult};
use fitrec_storage::{MemoryStore, ReviewCacheStore};
use fitrec_sync::{CacheState, Engine, EngineSettings, RefreshConfig, RefreshOutcome};
use tokio::sync::watch;

/// Answers every query with one hit unless the query names a product listed in
/// `hang` (never answers) or `empty` (answers with nothing).
#[derive(Default)]
struct ScriptedProvider {
    hang: Vec<String>,
    empty: Vec<String>,
    calls: AtomicUsize,
    stop_after_first: Mutex<Option<watch::Sender<bool>>>,
}

#[async_trait]
impl SearchProvider for ScriptedProvider {
    fn provider_id(&self) -> &'static str {
        "scripted"
    }

    async fn search(&self, query: &str, _max_results: u8) -> Result<Vec<SearchResult>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.stop_after_first.lock().expect("lock").take() {
            let _ = tx.send(true);
        }
        if self.hang.iter().any(|name| query.contains(name.as_str())) {
            std::future::pending::<()>().await;
        }
        if self.empty.iter().any(|name| query.contains(name.as_str())) {
            return Ok(Vec::new());
        }
        Ok(vec![SearchResult {
            title: Some(format!("About {query}")),
            snippet: format!("fit notes for {query}"),
            url: Some(format!("https://reviews.example/{}", query.replace(' ', "-"))),
        }])
    }
}

fn settings(refresh: RefreshConfig) -> EngineSettings {
    EngineSettings {
        refresh,
        ..EngineSettings::default()
    }
}

/// Products named "Model A".."Model E", each cached long enough ago to be expired,
/// stalest first in name order.
async fn seed_expired(store: &Arc<MemoryStore>, engine: &Engine, count: usize) -> Vec<ProductId> {
    let brand = store.add_brand("Acme").await;
    let mut ids = Vec::new();
    for idx in 0..count {
        let name = format!("Model {}", (b'A' + idx as u8) as char);
        let product = store.add_product(brand.id, &name, Utc::now()).await.expect("product");
        let fetched_at = Utc::now() - ChronoDuration::days(30 - idx as i64);
        engine
            .cache()
            .store_reviews_at(product.id, "seed", &[], "seed", fetched_at)
            .await
            .expect("seed entry");
        ids.push(product.id);
    }
    ids
}

#[tokio::test(start_paused = true)]
async fn sweep_survives_a_timed_out_product() {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(ScriptedProvider {
        hang: vec!["Model C".into()],
        ..Default::default()
    });
    let refresh = RefreshConfig {
        search_timeout: Duration::from_secs(5),
        ..RefreshConfig::immediate()
    };
    let engine = Engine::with_store(store.clone(), provider.clone(), settings(refresh));
    let ids = seed_expired(&store, &engine, 5).await;

    assert_eq!(engine.scheduler().list_due_products().await.expect("due"), ids);

    let summary = engine.run_sweep().await.expect("sweep");
    assert_eq!(summary.total, 5);
    assert_eq!(summary.refreshed, 4);
    assert_eq!(summary.errored, 1);
    assert!(!summary.aborted);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 10);

    // Only the failed product is still due; it keeps its old entry for the next sweep.
    assert_eq!(engine.scheduler().list_due_products().await.expect("due"), vec![ids[2]]);
    let entry = store.get_entry(ids[2]).await.expect("entry").expect("still cached");
    assert_eq!(entry.search_query, "seed");

    let refreshed = engine.get_cached_reviews(ids[0]).await.expect("fresh");
    assert_eq!(refreshed.entry.result_count, 2);
    assert_eq!(refreshed.snippets.len(), 2);
}

#[tokio::test]
async fn zero_results_are_written_but_counted_as_errors() {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(ScriptedProvider {
        empty: vec!["Model B".into()],
        ..Default::default()
    });
    let engine = Engine::with_store(store.clone(), provider, settings(RefreshConfig::immediate()));
    let ids = seed_expired(&store, &engine, 2).await;

    let summary = engine.run_sweep().await.expect("sweep");
    assert_eq!((summary.total, summary.refreshed, summary.errored), (2, 1, 1));

    let status = engine.cache().status(ids[1]).await.expect("status");
    assert_eq!(status.state, CacheState::Fresh);
    assert_eq!(status.entry.expect("entry").result_count, 0);
    assert!(engine.scheduler().list_due_products().await.expect("due").is_empty());
}

#[tokio::test]
async fn recently_refreshed_and_never_cached_products_are_not_due() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::with_store(
        store.clone(),
        Arc::new(ScriptedProvider::default()),
        settings(RefreshConfig::immediate()),
    );
    let brand = store.add_brand("Acme").await;
    let fresh = store.add_product(brand.id, "Fresh Tee", Utc::now()).await.expect("p");
    let never = store.add_product(brand.id, "Never Tee", Utc::now()).await.expect("p");
    engine
        .cache()
        .store_reviews_at(fresh.id, "q", &[], "seed", Utc::now() - ChronoDuration::days(6))
        .await
        .expect("seed");

    let due = engine.scheduler().list_due_products().await.expect("due");
    assert!(due.is_empty());
    assert!(engine.get_cached_reviews(never.id).await.is_none());
}

#[tokio::test]
async fn refresh_product_caps_queries_per_product() {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(ScriptedProvider::default());
    let refresh = RefreshConfig {
        max_queries_per_product: 9,
        ..RefreshConfig::immediate()
    };
    let engine = Engine::with_store(store.clone(), provider.clone(), settings(refresh));
    let ids = seed_expired(&store, &engine, 1).await;

    let outcome = engine.scheduler().refresh_product(ids[0]).await.expect("refresh");
    assert_eq!(outcome, RefreshOutcome::Refreshed { results: 2, failed_queries: 0 });
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

    let entry = store.get_entry(ids[0]).await.expect("entry").expect("entry");
    assert_eq!(entry.search_query, "Acme Model A review sizing fit | Acme Model A reddit fit");
}

#[tokio::test(start_paused = true)]
async fn sweep_paces_queries_and_products() {
    let store = Arc::new(MemoryStore::new());
    let refresh = RefreshConfig {
        query_delay: Duration::from_secs(1),
        product_delay: Duration::from_secs(2),
        ..RefreshConfig::default()
    };
    let engine = Engine::with_store(store.clone(), Arc::new(ScriptedProvider::default()), settings(refresh));
    seed_expired(&store, &engine, 2).await;

    let started = tokio::time::Instant::now();
    let summary = engine.run_sweep().await.expect("sweep");
    let elapsed = started.elapsed();

    assert_eq!(summary.refreshed, 2);
    // Two intra-product pauses plus one inter-product pause.
    assert!(elapsed >= Duration::from_secs(4), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn shutdown_stops_the_sweep_between_products() {
    let store = Arc::new(MemoryStore::new());
    let (tx, rx) = watch::channel(false);
    let provider = Arc::new(ScriptedProvider {
        stop_after_first: Mutex::new(Some(tx)),
        ..Default::default()
    });
    let engine = Engine::with_store(store.clone(), provider, settings(RefreshConfig::immediate()));
    let ids = seed_expired(&store, &engine, 4).await;

    let summary = engine
        .scheduler()
        .run_sweep_with_shutdown(rx)
        .await
        .expect("sweep");

    assert!(summary.aborted);
    assert_eq!(summary.total, 4);
    assert_eq!(summary.refreshed, 1);
    assert_eq!(summary.skipped, 3);
    assert_eq!(engine.scheduler().list_due_products().await.expect("due"), ids[1..].to_vec());
}
