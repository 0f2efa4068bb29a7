//! The request engine.
//!
//! A [`Request`] describes one logical operation against the homeserver. The
//! engine turns it into exactly one HTTP call and exactly one outcome: a
//! parsed [`Response`] for a 2xx status, or a [`ClientError`] otherwise. It
//! keeps no state and never retries; retry policy belongs to the caller.

use std::time::Duration;

use serde_json::{Map, Value};
use url::Url;

use crate::error::{ClientError, ClientResult, ResponseBody};
use crate::http::{HttpClient, RawRequest};

/// HTTP methods used by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET request.
    Get,
    /// POST request.
    Post,
    /// PUT request.
    Put,
}

impl Method {
    /// Returns the method name as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }
}

/// One logical request against the homeserver.
///
/// Created per call and consumed by [`Request::perform`]. The path is a list
/// of segments so that ids and aliases containing reserved characters get
/// percent-encoded when the URL is built.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: Vec<String>,
    query: Vec<(String, String)>,
    body: Option<Map<String, Value>>,
    access_token: Option<String>,
    timeout: Option<Duration>,
}

impl Request {
    /// Creates a request for the given method and path segments.
    pub fn new(method: Method, path: &[&str]) -> Self {
        Self {
            method,
            path: path.iter().map(|s| s.to_string()).collect(),
            query: Vec::new(),
            body: None,
            access_token: None,
            timeout: None,
        }
    }

    /// Appends a query parameter. Keys may repeat; order is preserved.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets the JSON body.
    pub fn with_body(mut self, body: Map<String, Value>) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets the access token. Requests without a token are unauthenticated.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Sets a per-request timeout for the transport.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the absolute URL for this request against the homeserver.
    pub fn url(&self, homeserver: &Url) -> ClientResult<Url> {
        let mut url = homeserver.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::InvalidHomeserver(homeserver.to_string()))?
            .pop_if_empty()
            .extend(self.path.iter());

        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }

    /// Performs the request: one network call, one outcome.
    ///
    /// - transport failures surface as retryable [`ClientError::Transport`]
    /// - a body that is not a JSON object (an empty body counts as an empty
    ///   object) is a [`ClientError::MalformedResponse`]
    /// - a status of 300 or above is a [`ClientError::UnexpectedStatus`]
    ///   which still carries the parsed body and status code
    pub async fn perform(
        &self,
        http: &dyn HttpClient,
        homeserver: &Url,
    ) -> ClientResult<Response> {
        let url = self.url(homeserver)?;

        let body = match &self.body {
            Some(map) => Some(serde_json::to_vec(map).map_err(|e| {
                ClientError::transport_fatal(format!("failed to encode request body: {e}"))
            })?),
            None => None,
        };

        tracing::debug!(method = self.method.as_str(), %url, "performing request");

        let raw = http
            .execute(RawRequest {
                method: self.method,
                url,
                body,
                bearer_token: self.access_token.clone(),
                timeout: self.timeout,
            })
            .await
            .map_err(ClientError::transport_retryable)?;

        let body = parse_object(&raw.body)?;

        if raw.status >= 300 {
            return Err(ClientError::UnexpectedStatus {
                status: raw.status,
                response: body,
            });
        }

        Ok(Response {
            body,
            status: raw.status,
        })
    }
}

/// A successful (2xx) response: the parsed JSON object plus the status code.
#[derive(Debug, Clone)]
pub struct Response {
    /// Parsed response body. Empty if the server sent no body.
    pub body: ResponseBody,
    /// HTTP status code.
    pub status: u16,
}

impl Response {
    /// Returns the string value of the given top-level field, if present.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }
}

/// Parses response bytes into a JSON object. An empty body parses as an
/// empty object; a top-level array or scalar is malformed.
fn parse_object(bytes: &[u8]) -> ClientResult<ResponseBody> {
    if bytes.is_empty() {
        return Ok(Map::new());
    }

    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| ClientError::MalformedResponse(format!("invalid JSON: {e}")))?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(ClientError::MalformedResponse(format!(
            "expected a JSON object at the top level, got {other}"
        ))),
    }
}
