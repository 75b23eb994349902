//! Integration tests for Quota-Harvester
//!
//! HTTP-level behavior is exercised against wiremock servers. Crawl scenarios
//! that need many workers or scripted pages use closure-backed transports.

mod bulk_tests;
mod crawl_tests;
mod dispatcher_tests;

use quota_harvester::api::{ApiTransport, HttpTransport};
use quota_harvester::config::ApiConfig;
use quota_harvester::dispatch::{Dispatcher, RetryPolicy, Worker};
use quota_harvester::Credential;
use std::sync::Arc;
use std::time::Duration;
use wiremock::ResponseTemplate;

/// Creates an API configuration pointing at a mock server
pub fn create_test_api_config(server_uri: &str) -> ApiConfig {
    ApiConfig {
        base_url: format!("{}/1.1/", server_uri),
        stream_url: format!("{}/stream/1.1/", server_uri),
        request_timeout_secs: 5,
        user_agent: "QuotaHarvesterTest/1.0".to_string(),
    }
}

pub fn test_credential(user: &str) -> Credential {
    Credential {
        user: user.to_string(),
        consumer_key: format!("consumer-{}", user),
        consumer_secret: "consumer-secret".to_string(),
        token_key: format!("token-{}", user),
        token_secret: "token-secret".to_string(),
    }
}

/// JSON response reporting a generous quota, so the worker stays available
pub fn json_response(body: serde_json::Value) -> ResponseTemplate {
    let reset = chrono::Utc::now().timestamp() + 900;
    ResponseTemplate::new(200)
        .set_body_json(body)
        .insert_header("x-rate-limit-remaining", "900")
        .insert_header("x-rate-limit-limit", "900")
        .insert_header("x-rate-limit-reset", reset.to_string().as_str())
}

/// Retry policy with millisecond sleeps
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        wait: true,
        busy_fallback: Duration::from_millis(10),
        transport_backoff: Duration::from_millis(10),
        max_transport_retries: Some(3),
    }
}

/// Dispatcher with one signed HTTP worker per user label
pub fn http_dispatcher(server_uri: &str, users: &[&str]) -> Arc<Dispatcher> {
    let config = create_test_api_config(server_uri);
    let workers = users
        .iter()
        .map(|user| {
            let transport = HttpTransport::new(&config, test_credential(user))
                .expect("Failed to build transport");
            Worker::new(*user, Box::new(transport) as Box<dyn ApiTransport>)
        })
        .collect();
    Arc::new(Dispatcher::new(workers, fast_policy()))
}

/// Dispatcher over `count` copies of a shared transport
pub fn shared_dispatcher<T>(transport: Arc<T>, count: usize) -> Arc<Dispatcher>
where
    T: ApiTransport + 'static,
{
    let workers = (0..count)
        .map(|i| {
            Worker::new(
                format!("worker-{}", i),
                Box::new(SharedTransport(Arc::clone(&transport))) as Box<dyn ApiTransport>,
            )
        })
        .collect();
    Arc::new(Dispatcher::new(workers, fast_policy()))
}

/// Lets several workers answer through the same transport
pub struct SharedTransport<T>(pub Arc<T>);

#[async_trait::async_trait]
impl<T: ApiTransport> ApiTransport for SharedTransport<T> {
    async fn invoke(
        &self,
        endpoint: &quota_harvester::Endpoint,
        args: &quota_harvester::CallArgs,
    ) -> Result<quota_harvester::ApiResponse, quota_harvester::api::TransportError> {
        self.0.invoke(endpoint, args).await
    }
}
