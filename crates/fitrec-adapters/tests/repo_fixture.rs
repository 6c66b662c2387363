use fitrec_adapters::{FixtureSearchProvider, SearchProvider};

#[tokio::test]
async fn repo_search_fixture_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/search.json");
    let provider = FixtureSearchProvider::from_file(&path).expect("fixture loads");

    let hits = provider
        .search("Nike Air Max 270 review sizing fit", 5)
        .await
        .expect("search");
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.url.is_some()));
}
