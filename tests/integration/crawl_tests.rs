//! Integration tests for the follower crawl
//!
//! Each test runs the engine against a fresh database in a temporary
//! directory, either over HTTP through wiremock or over a closure transport.

use crate::{http_dispatcher, json_response, shared_dispatcher};
use quota_harvester::api::{ClosureTransport, TransportError};
use quota_harvester::crawl::{CrawlEngine, CrawlOptions};
use quota_harvester::shutdown::ShutdownSignal;
use quota_harvester::storage::{RunStatus, SqliteStorage, Storage, UserRecord};
use quota_harvester::{ApiResponse, CallArgs, Endpoint, EntryState, HarvestError};
use reqwest::header::HeaderMap;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer};

fn create_test_options(consumers: usize) -> CrawlOptions {
    CrawlOptions {
        consumers,
        max_followers: 50_000,
        max_auth_attempts: 3,
        poll_interval: Duration::from_millis(10),
        recursive: false,
        recursive_frontier_cap: None,
    }
}

fn add_user(storage: &mut SqliteStorage, id: i64, followers_count: i64) {
    let record = UserRecord::from_json(&json!({
        "id": id,
        "screen_name": format!("user{}", id),
        "followers_count": followers_count,
    }))
    .expect("Invalid user");
    storage.upsert_user(&record).expect("Failed to store user");
    storage.enqueue_user(id).expect("Failed to queue user");
}

fn cursor_of(args: &CallArgs) -> i64 {
    args.get("cursor")
        .and_then(|c| c.parse().ok())
        .expect("Missing cursor")
}

fn user_of(args: &CallArgs) -> i64 {
    args.get("user_id")
        .and_then(|c| c.parse().ok())
        .expect("Missing user_id")
}

#[tokio::test]
async fn test_full_extraction_over_http() {
    let mock_server = MockServer::start().await;
    let dir = TempDir::new().expect("Failed to create temp dir");

    Mock::given(method("GET"))
        .and(path("/1.1/users/lookup.json"))
        .and(query_param("screen_name", "jack"))
        .respond_with(json_response(json!([
            {"id": 12, "screen_name": "jack", "followers_count": 3}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/1.1/followers/ids.json"))
        .and(query_param("user_id", "12"))
        .and(query_param("cursor", "-1"))
        .respond_with(json_response(json!({"ids": [101, 102], "next_cursor": 5})))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/1.1/followers/ids.json"))
        .and(query_param("user_id", "12"))
        .and(query_param("cursor", "5"))
        .respond_with(json_response(json!({"ids": [103], "next_cursor": 0})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dispatcher = http_dispatcher(&mock_server.uri(), &["alice", "bob"]);
    let engine = CrawlEngine::new(
        dispatcher,
        dir.path().join("crawl.db"),
        create_test_options(2),
        ShutdownSignal::shared(),
    );

    assert_eq!(engine.seed(&["@jack".to_string()]).await.unwrap(), 1);
    let report = engine.run("test-config").await.expect("Run failed");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.collected, 1);
    assert_eq!(report.stats.edges, 3);

    let storage = engine.open_storage().unwrap();
    assert_eq!(storage.count_edges(Some(12)).unwrap(), 3);
    let entry = storage.get_entry_for_user(12).unwrap().unwrap();
    assert_eq!(entry.state(), EntryState::Done);
    assert_eq!(entry.cursor, 0);

    let run = storage.get_latest_run().unwrap().unwrap();
    assert_eq!(run.id, report.run_id);
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn test_concurrent_consumers_download_each_user_once() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    // Two pages of 50 followers per user
    let transport = Arc::new(ClosureTransport::new(move |_: &Endpoint, args: &CallArgs| {
        counter.fetch_add(1, Ordering::SeqCst);
        let base = user_of(args) * 1000;
        let body = match cursor_of(args) {
            -1 => json!({"ids": (base..base + 50).collect::<Vec<_>>(), "next_cursor": 2}),
            2 => json!({"ids": (base + 50..base + 100).collect::<Vec<_>>(), "next_cursor": 0}),
            other => panic!("unexpected cursor {}", other),
        };
        Ok(ApiResponse::with_full_quota(body))
    }));

    let engine = CrawlEngine::new(
        shared_dispatcher(transport, 4),
        dir.path().join("crawl.db"),
        create_test_options(8),
        ShutdownSignal::shared(),
    );
    let mut storage = engine.open_storage().unwrap();
    for id in 1..=30 {
        add_user(&mut storage, id, 100);
    }

    let report = engine.run("test-config").await.expect("Run failed");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.collected, 30);
    assert_eq!(calls.load(Ordering::SeqCst), 60);
    assert_eq!(storage.count_edges(None).unwrap(), 3000);
    for id in 1..=30 {
        assert_eq!(storage.count_edges(Some(id)).unwrap(), 100);
    }
    let states = storage.count_entries_by_state().unwrap();
    assert_eq!(states.get(&EntryState::Done), Some(&30));
}

#[tokio::test]
async fn test_interrupted_entry_resumes_from_stored_cursor() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("crawl.db");

    // A previous process stored one page and died holding the claim
    {
        let mut storage = SqliteStorage::new(&db_path).unwrap();
        add_user(&mut storage, 1, 100);
        let entry = storage.claim_next_entry().unwrap().unwrap();
        let first_page: Vec<i64> = (0..23).collect();
        storage.record_page(entry.id, 1, &first_page, 77).unwrap();
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let transport = Arc::new(ClosureTransport::new(move |_: &Endpoint, args: &CallArgs| {
        counter.fetch_add(1, Ordering::SeqCst);
        assert_eq!(cursor_of(args), 77);
        // The page overlaps the one stored before the crash
        Ok(ApiResponse::with_full_quota(
            json!({"ids": (20..100).collect::<Vec<i64>>(), "next_cursor": 0}),
        ))
    }));

    let engine = CrawlEngine::new(
        shared_dispatcher(transport, 1),
        &db_path,
        create_test_options(2),
        ShutdownSignal::shared(),
    );
    let report = engine.run("test-config").await.expect("Run failed");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.stats.edges, 77);

    let storage = engine.open_storage().unwrap();
    assert_eq!(storage.count_edges(Some(1)).unwrap(), 100);
    assert_eq!(
        storage.get_entry_for_user(1).unwrap().unwrap().state(),
        EntryState::Done
    );
}

#[tokio::test]
async fn test_failed_users_do_not_abort_the_run() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(ClosureTransport::new(|_: &Endpoint, args: &CallArgs| {
        match user_of(args) {
            1 => Err(TransportError::http(401, HeaderMap::new(), "Not authorized.")),
            2 => Ok(ApiResponse::with_full_quota(json!({"ids": [7, 8], "next_cursor": 0}))),
            other => panic!("user {} should not be fetched", other),
        }
    }));

    let mut options = create_test_options(2);
    options.max_followers = 1000;
    let engine = CrawlEngine::new(
        shared_dispatcher(transport, 2),
        dir.path().join("crawl.db"),
        options,
        ShutdownSignal::shared(),
    );
    let mut storage = engine.open_storage().unwrap();
    add_user(&mut storage, 1, 2);
    add_user(&mut storage, 2, 2);
    add_user(&mut storage, 3, 1_000_000);

    let report = engine.run("test-config").await.expect("Run failed");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.collected, 1);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.skipped, 1);

    let failed = storage.get_entry_for_user(1).unwrap().unwrap();
    assert_eq!(failed.state(), EntryState::Failed);
    assert!(failed.errors.unwrap().contains("after 3 attempts"));
    assert_eq!(
        storage.get_entry_for_user(3).unwrap().unwrap().state(),
        EntryState::Skipped
    );
    assert_eq!(storage.count_edges(None).unwrap(), 2);
}

#[tokio::test]
async fn test_shutdown_marks_run_interrupted() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(ClosureTransport::new(|_: &Endpoint, _: &CallArgs| {
        Ok(ApiResponse::with_full_quota(json!({"ids": [1], "next_cursor": 0})))
    }));

    let shutdown = ShutdownSignal::shared();
    let engine = CrawlEngine::new(
        shared_dispatcher(transport, 1),
        dir.path().join("crawl.db"),
        create_test_options(2),
        Arc::clone(&shutdown),
    );
    let mut storage = engine.open_storage().unwrap();
    add_user(&mut storage, 1, 1);

    shutdown.request();
    let report = engine.run("test-config").await.expect("Run failed");

    assert_eq!(report.status, RunStatus::Interrupted);
    assert_eq!(report.stats.finished(), 0);
    let entry = storage.get_entry_for_user(1).unwrap().unwrap();
    assert_eq!(entry.state(), EntryState::Queued);
    assert_eq!(
        storage.get_latest_run().unwrap().unwrap().status,
        RunStatus::Interrupted
    );
}

#[tokio::test]
async fn test_unreachable_api_fails_the_run_and_keeps_the_entry() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(ClosureTransport::new(|_: &Endpoint, _: &CallArgs| {
        Err(TransportError::Connection("Connection refused".to_string()))
    }));

    let engine = CrawlEngine::new(
        shared_dispatcher(transport, 1),
        dir.path().join("crawl.db"),
        create_test_options(1),
        ShutdownSignal::shared(),
    );
    let mut storage = engine.open_storage().unwrap();
    add_user(&mut storage, 1, 10);

    let err = engine.run("test-config").await.unwrap_err();
    assert!(matches!(err, HarvestError::Transport { .. }));

    let entry = storage.get_entry_for_user(1).unwrap().unwrap();
    assert_eq!(entry.state(), EntryState::Queued);
    assert_eq!(entry.cursor, -1);
    assert_eq!(
        storage.get_latest_run().unwrap().unwrap().status,
        RunStatus::Failed
    );
}
