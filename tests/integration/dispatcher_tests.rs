//! Dispatcher, pagination and stream tests against a mock HTTP server

use crate::{create_test_api_config, http_dispatcher, json_response, test_credential};
use chrono::Utc;
use futures::StreamExt;
use quota_harvester::api::{HttpTransport, StreamTransport};
use quota_harvester::dispatch::{PageStrategy, StreamDispatcher, StreamPolicy, Worker};
use quota_harvester::{CallArgs, Endpoint, HarvestError};
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn users_page(start: usize, next_cursor: i64) -> Value {
    let users: Vec<Value> = (start..start + 20).map(|id| json!({"id": id})).collect();
    json!({"users": users, "next_cursor": next_cursor})
}

#[tokio::test]
async fn test_signed_call_records_rate_limits() {
    let mock_server = MockServer::start().await;
    let reset = Utc::now().timestamp() + 600;

    Mock::given(method("GET"))
        .and(path("/1.1/users/show.json"))
        .and(query_param("screen_name", "jack"))
        .and(header_exists("authorization"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": 12, "screen_name": "jack"}))
                // Inconsistent upstream headers: remaining above limit
                .insert_header("x-rate-limit-remaining", "20")
                .insert_header("x-rate-limit-limit", "15")
                .insert_header("x-rate-limit-reset", reset.to_string().as_str()),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let dispatcher = http_dispatcher(&mock_server.uri(), &["alice"]);
    let response = dispatcher
        .api()
        .path("users/show")
        .arg("screen_name", "jack")
        .send()
        .await
        .expect("Call failed");

    assert_eq!(response.body["id"], 12);

    let limits = dispatcher.workers()[0].limits_snapshot();
    let entry = limits.get("/users/show").expect("No limit recorded");
    assert!(entry.remaining <= entry.limit);
    assert_eq!(entry.reset_at.timestamp(), reset);
}

#[tokio::test]
async fn test_exhausted_credential_is_routed_around() {
    let mock_server = MockServer::start().await;
    let reset = Utc::now().timestamp() + 900;

    // Whichever credential asks first is told its quota is spent
    Mock::given(method("GET"))
        .and(path("/1.1/followers/ids.json"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_string("Rate limit exceeded")
                .insert_header("x-rate-limit-remaining", "0")
                .insert_header("x-rate-limit-limit", "15")
                .insert_header("x-rate-limit-reset", reset.to_string().as_str()),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/1.1/followers/ids.json"))
        .respond_with(json_response(json!({"ids": [1], "next_cursor": 0})))
        .expect(10)
        .mount(&mock_server)
        .await;

    let dispatcher = http_dispatcher(&mock_server.uri(), &["alice", "bob"]);
    for _ in 0..10 {
        let response = dispatcher
            .call(&Endpoint::parse("followers/ids"), &CallArgs::new().with("user_id", 12))
            .await
            .expect("Call failed");
        assert_eq!(response.body["ids"][0], 1);
    }

    let limited: Vec<&str> = dispatcher
        .workers()
        .iter()
        .filter(|w| w.is_limited("/followers/ids"))
        .map(|w| w.name())
        .collect();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn test_client_errors_surface_as_rejections() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1.1/users/show.json"))
        .respond_with(ResponseTemplate::new(404).set_body_string("User not found."))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dispatcher = http_dispatcher(&mock_server.uri(), &["alice"]);
    let err = dispatcher
        .call(&Endpoint::parse("users/show"), &CallArgs::new().with("user_id", 1))
        .await
        .unwrap_err();

    match err {
        HarvestError::UpstreamRejected {
            status, message, ..
        } => {
            assert_eq!(status, 404);
            assert!(message.contains("User not found"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_pagination_stops_after_reaching_max_count() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/1.1/followers/list.json"))
        .and(query_param("cursor", "-1"))
        .respond_with(json_response(users_page(0, 111)))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/1.1/followers/list.json"))
        .and(query_param("cursor", "111"))
        .respond_with(json_response(users_page(20, 222)))
        .expect(1)
        .mount(&mock_server)
        .await;

    // Never requested: 40 >= 25 after the second page
    Mock::given(method("GET"))
        .and(path("/1.1/followers/list.json"))
        .and(query_param("cursor", "222"))
        .respond_with(json_response(users_page(40, 0)))
        .expect(0)
        .mount(&mock_server)
        .await;

    let dispatcher = http_dispatcher(&mock_server.uri(), &["alice"]);
    let items: Vec<Value> = dispatcher
        .paginate(
            Endpoint::parse("followers/list"),
            CallArgs::new().with("user_id", 12).with("cursor", -1),
            25,
            PageStrategy::cursor("users"),
        )
        .map(|item| item.expect("Page failed"))
        .collect()
        .await;

    assert_eq!(items.len(), 40);
    assert_eq!(items[39]["id"], 39);
}

#[tokio::test]
async fn test_stream_yields_items_until_hangup() {
    let mock_server = MockServer::start().await;

    let body = "{\"id\": 1}\r\n\r\n{\"id\": 2}\r\nnot json\r\n{\"id\": 3}\r\n";
    Mock::given(method("GET"))
        .and(path("/stream/1.1/statuses/filter.json"))
        .and(query_param("track", "rust"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = create_test_api_config(&mock_server.uri());
    let transport = HttpTransport::new(&config, test_credential("alice")).expect("transport");
    let dispatcher = StreamDispatcher::new(
        vec![Worker::new(
            "alice",
            Box::new(transport) as Box<dyn StreamTransport>,
        )],
        StreamPolicy {
            reconnect: false,
            hangup_window: Duration::from_secs(60),
            reconnect_backoff: Duration::from_millis(10),
        },
    );

    let items: Vec<Value> = dispatcher
        .subscribe(
            Endpoint::parse("statuses/filter"),
            CallArgs::new().with("track", "rust"),
        )
        .await
        .expect("Subscribe failed")
        .map(|item| item.expect("Stream failed"))
        .collect()
        .await;

    let ids: Vec<i64> = items.iter().filter_map(|i| i["id"].as_i64()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(!dispatcher.workers()[0].is_busy());
}

#[tokio::test]
async fn test_stream_breaker_trips_on_repeated_hangups() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/stream/1.1/statuses/sample.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"id\": 1}\n"))
        .mount(&mock_server)
        .await;

    let config = create_test_api_config(&mock_server.uri());
    let transport = HttpTransport::new(&config, test_credential("alice")).expect("transport");
    let dispatcher = StreamDispatcher::new(
        vec![Worker::new(
            "alice",
            Box::new(transport) as Box<dyn StreamTransport>,
        )],
        StreamPolicy {
            reconnect: true,
            hangup_window: Duration::from_secs(60),
            reconnect_backoff: Duration::from_millis(10),
        },
    );

    let results: Vec<_> = dispatcher
        .subscribe(Endpoint::parse("statuses/sample"), CallArgs::new())
        .await
        .expect("Subscribe failed")
        .collect()
        .await;

    // One item per connection, then the second hangup inside the window aborts
    let items = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(items, 2);
    assert!(matches!(
        results.last(),
        Some(Err(HarvestError::TooManyHangups { .. }))
    ));
}

#[tokio::test]
async fn test_stream_client_error_ends_subscription() {
    let mock_server = MockServer::start().await;

    // Reconnect is on, so anything beyond one request would be a retry
    Mock::given(method("GET"))
        .and(path("/stream/1.1/statuses/filter.json"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = create_test_api_config(&mock_server.uri());
    let transport = HttpTransport::new(&config, test_credential("alice")).expect("transport");
    let dispatcher = StreamDispatcher::new(
        vec![Worker::new(
            "alice",
            Box::new(transport) as Box<dyn StreamTransport>,
        )],
        StreamPolicy {
            reconnect: true,
            hangup_window: Duration::from_secs(60),
            reconnect_backoff: Duration::from_millis(10),
        },
    );

    let results: Vec<_> = dispatcher
        .subscribe(
            Endpoint::parse("statuses/filter"),
            CallArgs::new().with("track", "rust"),
        )
        .await
        .expect("Subscribe failed")
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    match &results[0] {
        Err(HarvestError::UpstreamRejected { status, .. }) => assert_eq!(*status, 401),
        other => panic!("unexpected result: {:?}", other.as_ref().map(|_| ())),
    }
    assert!(!dispatcher.workers()[0].is_busy());
}
