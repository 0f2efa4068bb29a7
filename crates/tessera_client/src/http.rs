//! HTTP transport abstraction.
//!
//! The request engine only needs "send one HTTP request, get back a status
//! code and a body". That boundary is a trait so tests can script responses
//! and alternative transports can be dropped in.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use crate::request::Method;

/// A fully-resolved HTTP request, ready to be sent.
#[derive(Debug, Clone)]
pub struct RawRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL, query string included.
    pub url: Url,
    /// JSON-encoded body, if any.
    pub body: Option<Vec<u8>>,
    /// Bearer token for the `Authorization` header, if any.
    pub bearer_token: Option<String>,
    /// Per-request timeout; `None` uses the transport's default.
    pub timeout: Option<Duration>,
}

/// The raw outcome of an HTTP request.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body bytes.
    pub body: Vec<u8>,
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual transport. Errors are plain
/// strings describing a failure below the HTTP layer (DNS, connect, TLS,
/// timeout); anything that produced a status code is a [`RawResponse`].
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends one request and returns the raw response.
    async fn execute(&self, request: RawRequest) -> Result<RawResponse, String>;
}

/// [`HttpClient`] backed by reqwest.
///
/// Redirects are never followed: a 3xx status is returned as the raw
/// outcome, so every `execute` issues exactly one network call.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Creates a transport with a non-redirecting reqwest client.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client construction");
        Self { client }
    }

    /// Creates a transport from a preconfigured reqwest client.
    ///
    /// The caller owns the client's configuration; a client that follows
    /// redirects will issue more than one network call per `execute`.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: RawRequest) -> Result<RawResponse, String> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
        };

        let mut builder = self.client.request(method, request.url);
        if let Some(token) = request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| e.to_string())?
            .to_vec();

        Ok(RawResponse { status, body })
    }
}

/// A scriptable transport for tests.
///
/// Outcomes are delivered in FIFO order, one per request; every request is
/// recorded so tests can assert on methods, URLs and bodies. An exhausted
/// script yields an error outcome.
#[derive(Debug, Default)]
pub struct MockHttpClient {
    script: Mutex<VecDeque<Result<RawResponse, String>>>,
    requests: Mutex<Vec<RawRequest>>,
}

impl MockHttpClient {
    /// Creates a mock with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a raw response.
    pub fn push_response(&self, status: u16, body: impl Into<Vec<u8>>) {
        self.script.lock().push_back(Ok(RawResponse {
            status,
            body: body.into(),
        }));
    }

    /// Queues a JSON response.
    pub fn push_json(&self, status: u16, body: &serde_json::Value) {
        self.push_response(status, body.to_string().into_bytes());
    }

    /// Queues a transport failure.
    pub fn push_transport_error(&self, message: impl Into<String>) {
        self.script.lock().push_back(Err(message.into()));
    }

    /// Returns all requests seen so far.
    pub fn requests(&self) -> Vec<RawRequest> {
        self.requests.lock().clone()
    }

    /// Returns how many requests were executed.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: RawRequest) -> Result<RawResponse, String> {
        self.requests.lock().push(request);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err("mock script exhausted".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_request() -> RawRequest {
        RawRequest {
            method: Method::Get,
            url: Url::parse("https://example.org/_matrix/client/r0/sync").unwrap(),
            body: None,
            bearer_token: None,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn mock_replays_script_in_order() {
        let mock = MockHttpClient::new();
        mock.push_response(200, b"{}".to_vec());
        mock.push_transport_error("connection reset");

        let first = mock.execute(raw_request()).await.unwrap();
        assert_eq!(first.status, 200);

        let second = mock.execute(raw_request()).await;
        assert_eq!(second.unwrap_err(), "connection reset");
    }

    #[tokio::test]
    async fn mock_records_requests() {
        let mock = MockHttpClient::new();
        mock.push_response(200, b"{}".to_vec());

        mock.execute(raw_request()).await.unwrap();
        assert_eq!(mock.request_count(), 1);
        assert_eq!(mock.requests()[0].url.path(), "/_matrix/client/r0/sync");
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let mock = MockHttpClient::new();
        let result = mock.execute(raw_request()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reqwest_transport_surfaces_redirects_without_following() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let server_hits = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let hits = server_hits.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    if matches!(socket.read(&mut buf).await, Ok(0) | Err(_)) {
                        return;
                    }
                    hits.fetch_add(1, Ordering::SeqCst);
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 302 Found\r\n\
                              Location: /elsewhere\r\n\
                              Content-Length: 0\r\n\
                              Connection: close\r\n\r\n",
                        )
                        .await;
                });
            }
        });

        let transport = ReqwestHttpClient::new();
        let response = transport
            .execute(RawRequest {
                method: Method::Get,
                url: Url::parse(&format!("http://{addr}/a")).unwrap(),
                body: None,
                bearer_token: None,
                timeout: Some(Duration::from_secs(5)),
            })
            .await
            .unwrap();

        // One network call, and the 3xx is the outcome.
        assert_eq!(response.status, 302);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
