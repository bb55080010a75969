use nrega_core::FiscalMonth;
use nrega_feed::{FeedCell, FeedClient, FixtureFeedClient};
use uuid::Uuid;

fn fixture_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/feed/sample_records.json")
}

#[tokio::test]
async fn sample_fixture_splits_into_grid_cells() {
    let client = FixtureFeedClient::from_file(fixture_path()).expect("fixture loads");
    assert_eq!(client.len(), 6);

    let apr_23 = client
        .fetch(Uuid::new_v4(), &FeedCell::new("2023-2024", FiscalMonth::Apr))
        .await
        .unwrap();
    let districts: Vec<_> = apr_23
        .iter()
        .filter_map(|r| r.district_name.as_deref())
        .collect();
    assert_eq!(districts, vec!["AGRA", "Varanasi"]);

    let apr_24 = client
        .fetch(Uuid::new_v4(), &FeedCell::new("2024-2025", FiscalMonth::Apr))
        .await
        .unwrap();
    assert_eq!(apr_24.len(), 3);

    let dec_23 = client
        .fetch(Uuid::new_v4(), &FeedCell::new("2023-2024", FiscalMonth::Dec))
        .await
        .unwrap();
    assert!(dec_23.is_empty());
}
