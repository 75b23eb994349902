//! Integration tests for bulk lookups against a mock HTTP server

use crate::{http_dispatcher, json_response};
use futures::StreamExt;
use quota_harvester::bulk::{
    ArtifactStore, BulkFetcher, BulkOptions, FetchOutcome, FileArtifactStore, LookupKind,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn create_test_options(batch_size: usize) -> BulkOptions {
    BulkOptions {
        batch_size,
        parallelism: 2,
        update: false,
        retry_failed: false,
    }
}

fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|id| id.to_string()).collect()
}

async fn collect_sorted(fetcher: &BulkFetcher, kind: LookupKind, raw: &[&str]) -> Vec<FetchOutcome> {
    let mut outcomes: Vec<FetchOutcome> = fetcher.fetch(kind, ids(raw)).collect().await;
    outcomes.sort_by(|a, b| a.id().cmp(b.id()));
    outcomes
}

#[tokio::test]
async fn test_tweets_are_cached_and_never_refetched() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().expect("Failed to create temp dir");

    Mock::given(method("GET"))
        .and(path("/1.1/statuses/lookup.json"))
        .and(query_param("id", "1,2"))
        .and(query_param("map", "true"))
        .respond_with(json_response(json!({
            "id": {"1": {"id": 1, "text": "first"}, "2": null}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/1.1/statuses/lookup.json"))
        .and(query_param("id", "3"))
        .respond_with(json_response(json!({"id": {"3": {"id": 3, "text": "third"}}})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = Arc::new(FileArtifactStore::new(dir.path()));
    let fetcher = BulkFetcher::new(
        http_dispatcher(&mock_server.uri(), &["alice", "bob"]),
        store.clone(),
        create_test_options(2),
    );

    let outcomes = collect_sorted(&fetcher, LookupKind::Tweets, &["1", "2", "3"]).await;
    assert!(matches!(&outcomes[0], FetchOutcome::Found { id, item } if id == "1" && item["text"] == "first"));
    assert_eq!(outcomes[1], FetchOutcome::Missing { id: "2".to_string() });
    assert!(matches!(&outcomes[2], FetchOutcome::Found { id, .. } if id == "3"));

    assert!(dir.path().join("1.json").is_file());
    assert!(dir.path().join("failed").join("2.failed").is_file());
    assert_eq!(store.read("3").unwrap()["text"], "third");

    // Second pass is served entirely from the folder; the mocks expect one call each
    let again = collect_sorted(&fetcher, LookupKind::Tweets, &["1", "2", "3"]).await;
    assert!(again.iter().all(|o| matches!(o, FetchOutcome::Skipped { .. })));
    assert_eq!(again.len(), 3);
}

#[tokio::test]
async fn test_failed_batch_does_not_stop_the_others() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/1.1/users/lookup.json"))
        .and(query_param("user_id", "10,11"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal error"))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/1.1/users/lookup.json"))
        .and(query_param("user_id", "12"))
        .respond_with(json_response(json!([{"id": 12, "screen_name": "c"}])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = Arc::new(FileArtifactStore::new(dir.path()));
    let fetcher = BulkFetcher::new(
        http_dispatcher(&mock_server.uri(), &["alice"]),
        store.clone(),
        create_test_options(2),
    );

    let outcomes = collect_sorted(&fetcher, LookupKind::UserIds, &["10", "11", "12"]).await;
    assert!(matches!(&outcomes[0], FetchOutcome::Error { id, message } if id == "10" && message.contains("500")));
    assert!(matches!(&outcomes[1], FetchOutcome::Error { id, .. } if id == "11"));
    assert!(matches!(&outcomes[2], FetchOutcome::Found { id, .. } if id == "12"));

    // Errors leave no marker, so those ids are fetched again next time
    assert!(!store.is_failed("10"));
    assert!(!store.is_cached("10"));
}

#[tokio::test]
async fn test_unknown_users_are_marked_and_retried_on_request() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/1.1/users/lookup.json"))
        .respond_with(
            ResponseTemplate::new(404).set_body_string("No user matches for specified terms."),
        )
        .expect(2)
        .mount(&mock_server)
        .await;

    let dispatcher = http_dispatcher(&mock_server.uri(), &["alice"]);
    let store: Arc<FileArtifactStore> = Arc::new(FileArtifactStore::new(dir.path()));

    let fetcher = BulkFetcher::new(Arc::clone(&dispatcher), store.clone(), create_test_options(100));
    let outcomes = collect_sorted(&fetcher, LookupKind::ScreenNames, &["@Ghost", "nobody"]).await;
    assert!(outcomes.iter().all(|o| matches!(o, FetchOutcome::Missing { .. })));
    assert!(store.is_failed("@Ghost"));
    assert!(store.is_failed("nobody"));

    // Marked ids are skipped unless failures are retried
    let skipped = collect_sorted(&fetcher, LookupKind::ScreenNames, &["@Ghost", "nobody"]).await;
    assert!(skipped.iter().all(|o| matches!(o, FetchOutcome::Skipped { .. })));

    let mut options = create_test_options(100);
    options.retry_failed = true;
    let retrying = BulkFetcher::new(dispatcher, store, options);
    let retried = collect_sorted(&retrying, LookupKind::ScreenNames, &["@Ghost", "nobody"]).await;
    assert!(retried.iter().all(|o| matches!(o, FetchOutcome::Missing { .. })));
}
