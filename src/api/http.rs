//! HTTP transport implementation
//!
//! This module performs the actual network calls for a worker:
//! - Building the HTTP client with the configured user agent and timeout
//! - Mapping an endpoint onto `<base-url>/<segments>.json`
//! - Signing every request with the worker's credential
//! - Classifying failures into HTTP, connection and decode errors
//! - Splitting streaming responses into newline-delimited JSON items

use crate::api::oauth::{authorization_header, OAuthNonce};
use crate::api::{
    ApiResponse, ApiTransport, CallArgs, Endpoint, ItemStream, StreamTransport, TransportError,
};
use crate::config::ApiConfig;
use crate::credentials::Credential;
use crate::HarvestError;
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response};
use std::time::Duration;
use url::Url;

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The API configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &ApiConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Signed HTTP transport bound to one credential
pub struct HttpTransport {
    client: Client,
    stream_client: Client,
    base_url: Url,
    stream_url: Url,
    credential: Credential,
}

impl HttpTransport {
    /// Creates a transport for one credential
    ///
    /// The streaming client has no overall timeout, since a subscription is
    /// expected to stay open indefinitely.
    pub fn new(config: &ApiConfig, credential: Credential) -> Result<Self, HarvestError> {
        let client = build_http_client(config)?;
        let stream_client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            stream_client,
            base_url: directory_url(&config.base_url)?,
            stream_url: directory_url(&config.stream_url)?,
            credential,
        })
    }

    /// Label of the credential this transport signs with
    pub fn credential_user(&self) -> &str {
        &self.credential.user
    }

    fn endpoint_url(base: &Url, endpoint: &Endpoint) -> Result<Url, TransportError> {
        base.join(&format!("{}.json", endpoint.segments().join("/")))
            .map_err(|e| TransportError::Connection(format!("Invalid endpoint URL: {}", e)))
    }

    async fn send(
        &self,
        client: &Client,
        url: Url,
        args: &CallArgs,
    ) -> Result<Response, TransportError> {
        let params: Vec<(String, String)> = args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let header = authorization_header(
            &self.credential,
            "GET",
            url.as_str(),
            &params,
            &OAuthNonce::fresh(),
        );

        let response = client
            .get(url)
            .query(&params)
            .header(AUTHORIZATION, header)
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::http(status.as_u16(), headers, body));
        }

        Ok(response)
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn invoke(
        &self,
        endpoint: &Endpoint,
        args: &CallArgs,
    ) -> Result<ApiResponse, TransportError> {
        let url = Self::endpoint_url(&self.base_url, endpoint)?;
        let response = self.send(&self.client, url, args).await?;

        let headers = response.headers().clone();
        let text = response.text().await.map_err(classify_error)?;
        let body = serde_json::from_str(&text)
            .map_err(|e| TransportError::Decode(format!("{} (body: {:.200})", e, text)))?;

        Ok(ApiResponse::with_headers(body, headers))
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn subscribe(
        &self,
        endpoint: &Endpoint,
        args: &CallArgs,
    ) -> Result<ItemStream, TransportError> {
        let url = Self::endpoint_url(&self.stream_url, endpoint)?;
        let response = self.send(&self.stream_client, url, args).await?;
        Ok(ndjson_items(response.bytes_stream()))
    }
}

/// Makes sure a base URL ends with `/` so `join` appends instead of replacing
fn directory_url(raw: &str) -> Result<Url, HarvestError> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn classify_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Connection("Request timeout".to_string())
    } else if e.is_connect() {
        TransportError::Connection(format!("Connection refused: {}", e))
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Connection(e.to_string())
    }
}

/// Splits a chunked byte stream into newline-delimited JSON items
///
/// Blank keep-alive lines are skipped. A read error ends the stream after
/// being yielded as a `Connection` error; a line that is not JSON is yielded
/// as a `Decode` error and the stream continues.
pub fn ndjson_items<S, B, E>(chunks: S) -> ItemStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = (chunks.boxed(), Vec::<u8>::new(), false);

    stream::unfold(state, |(mut chunks, mut buffer, mut done)| async move {
        loop {
            if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let item = serde_json::from_str(trimmed)
                    .map_err(|e| TransportError::Decode(e.to_string()));
                return Some((item, (chunks, buffer, done)));
            }

            if done {
                return None;
            }

            match chunks.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    buffer.clear();
                    let err = TransportError::Connection(e.to_string());
                    return Some((Err(err), (chunks, buffer, true)));
                }
                None => {
                    // Flush a final line that has no trailing newline
                    done = true;
                    if !buffer.is_empty() {
                        buffer.push(b'\n');
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_credential() -> Credential {
        Credential {
            user: "tester".to_string(),
            consumer_key: "ck".to_string(),
            consumer_secret: "cs".to_string(),
            token_key: "tk".to_string(),
            token_secret: "ts".to_string(),
        }
    }

    fn create_test_config(base: &str) -> ApiConfig {
        ApiConfig {
            base_url: format!("{}/1.1", base),
            stream_url: format!("{}/stream/1.1", base),
            request_timeout_secs: 5,
            user_agent: "QuotaHarvesterTest/1.0".to_string(),
        }
    }

    #[test]
    fn test_directory_url_appends_slash() {
        let url = directory_url("https://api.example.com/1.1").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/1.1/");
        let joined = url.join("followers/ids.json").unwrap();
        assert_eq!(joined.path(), "/1.1/followers/ids.json");
    }

    #[tokio::test]
    async fn test_invoke_returns_body_and_headers() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/1.1/followers/ids.json"))
            .and(query_param("user_id", "12"))
            .and(header_exists("authorization"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ids": [1, 2, 3], "next_cursor": 0}))
                    .insert_header("x-rate-limit-remaining", "14"),
            )
            .mount(&mock_server)
            .await;

        let transport =
            HttpTransport::new(&create_test_config(&mock_server.uri()), create_test_credential())
                .unwrap();
        let response = transport
            .invoke(
                &Endpoint::parse("followers/ids"),
                &CallArgs::new().with("user_id", 12),
            )
            .await
            .unwrap();

        assert_eq!(response.body["ids"], json!([1, 2, 3]));
        assert_eq!(
            response.headers.get("x-rate-limit-remaining").unwrap(),
            "14"
        );
    }

    #[tokio::test]
    async fn test_invoke_classifies_http_errors() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/1.1/users/lookup.json"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_string("Rate limit exceeded")
                    .insert_header("x-rate-limit-reset", "1700000000"),
            )
            .mount(&mock_server)
            .await;

        let transport =
            HttpTransport::new(&create_test_config(&mock_server.uri()), create_test_credential())
                .unwrap();
        let err = transport
            .invoke(&Endpoint::parse("users/lookup"), &CallArgs::new())
            .await
            .unwrap_err();

        match err {
            TransportError::Http {
                status,
                headers,
                body,
            } => {
                assert_eq!(status, 429);
                assert_eq!(headers.get("x-rate-limit-reset").unwrap(), "1700000000");
                assert_eq!(body, "Rate limit exceeded");
            }
            other => panic!("Expected HTTP error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invoke_rejects_non_json_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/1.1/statuses/lookup.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&mock_server)
            .await;

        let transport =
            HttpTransport::new(&create_test_config(&mock_server.uri()), create_test_credential())
                .unwrap();
        let err = transport
            .invoke(&Endpoint::parse("statuses/lookup"), &CallArgs::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[tokio::test]
    async fn test_invoke_connection_refused() {
        // Nothing listens on port 9 locally
        let config = create_test_config("http://127.0.0.1:9");
        let transport = HttpTransport::new(&config, create_test_credential()).unwrap();
        let err = transport
            .invoke(&Endpoint::parse("followers/ids"), &CallArgs::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Connection(_)));
    }

    #[tokio::test]
    async fn test_subscribe_splits_lines() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/stream/1.1/statuses/filter.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("{\"id\":1}\r\n\r\n{\"id\":2}\r\n"),
            )
            .mount(&mock_server)
            .await;

        let transport =
            HttpTransport::new(&create_test_config(&mock_server.uri()), create_test_credential())
                .unwrap();
        let items: Vec<_> = transport
            .subscribe(
                &Endpoint::parse("statuses/filter"),
                &CallArgs::new().with("track", "rust"),
            )
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap()["id"], 1);
        assert_eq!(items[1].as_ref().unwrap()["id"], 2);
    }

    #[tokio::test]
    async fn test_ndjson_handles_split_chunks() {
        let chunks = stream::iter(vec![
            Ok::<_, std::io::Error>(b"{\"a\":1}\n\r\n{\"b\"".to_vec()),
            Ok(b":2}\nnot json\n{\"c\":3}".to_vec()),
        ]);

        let items: Vec<_> = ndjson_items(chunks).collect().await;

        assert_eq!(items.len(), 4);
        assert_eq!(items[0].as_ref().unwrap()["a"], 1);
        assert_eq!(items[1].as_ref().unwrap()["b"], 2);
        assert!(matches!(items[2], Err(TransportError::Decode(_))));
        assert_eq!(items[3].as_ref().unwrap()["c"], 3);
    }

    #[tokio::test]
    async fn test_ndjson_stops_after_read_error() {
        let chunks = stream::iter(vec![
            Ok(b"{\"a\":1}\n".to_vec()),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "reset")),
            Ok(b"{\"b\":2}\n".to_vec()),
        ]);

        let items: Vec<_> = ndjson_items(chunks).collect().await;

        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(TransportError::Connection(_))));
    }
}
