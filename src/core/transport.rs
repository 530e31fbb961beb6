//! HTTP Transport
//!
//! HTTP client interface and implementations, shared by the token endpoint client and the
//! authenticated request state machine.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{NetworkError, OAuth2Error, ProtocolError};

/// HTTP request definition.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Request URL.
    pub url: String,
    /// Request headers in the order they were set. Duplicates are sent as separate entries.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<String>,
    /// Request timeout.
    pub timeout: Option<Duration>,
    /// Follow 3xx redirects instead of returning them.
    pub follow_redirects: bool,
    /// Body size cap. `None` reads the whole body.
    pub max_response_size: Option<usize>,
}

impl HttpRequest {
    /// Values of every header with this name, case-insensitive, in order.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First value of the named header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).into_iter().next()
    }
}

/// HTTP method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Other(String),
}

impl HttpMethod {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Other(method) => method,
        }
    }

    /// Parse a method name, case-insensitive for the well-known verbs.
    pub fn parse(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "PATCH" => Self::Patch,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            _ => Self::Other(method.to_string()),
        }
    }
}

impl From<&str> for HttpMethod {
    fn from(method: &str) -> Self {
        Self::parse(method)
    }
}

/// HTTP response definition.
#[derive(Clone, Debug, Default)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Status text.
    pub status_text: String,
    /// Response headers, keyed by lowercase name. Repeated headers are joined with ", ".
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: String,
}

impl HttpResponse {
    /// Create a response with a status and body.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            status_text: reason_phrase(status).to_string(),
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

fn reason_phrase(status: u16) -> &'static str {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}

/// HTTP transport interface (for dependency injection).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send an HTTP request.
    ///
    /// `Err` means no HTTP status was obtained; HTTP-level failures are `Ok` responses.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, OAuth2Error>;

    /// Whether custom request headers reach the server.
    ///
    /// Constrained transports return `false`; credentials then always travel as a query
    /// parameter.
    fn supports_request_headers(&self) -> bool {
        true
    }
}

/// Default reqwest-based HTTP transport.
///
/// Holds one client per redirect policy since reqwest fixes the policy at build time.
pub struct ReqwestHttpTransport {
    client: reqwest::Client,
    redirecting_client: reqwest::Client,
    default_timeout: Duration,
}

impl ReqwestHttpTransport {
    /// Create new transport with default settings.
    pub fn new() -> Result<Self, OAuth2Error> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create transport with a custom default timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, OAuth2Error> {
        let build = |policy: reqwest::redirect::Policy| {
            reqwest::Client::builder()
                .timeout(timeout)
                .redirect(policy)
                .build()
                .map_err(|e| {
                    OAuth2Error::Network(NetworkError::TlsError {
                        message: e.to_string(),
                    })
                })
        };

        Ok(Self {
            client: build(reqwest::redirect::Policy::none())?,
            redirecting_client: build(reqwest::redirect::Policy::limited(10))?,
            default_timeout: timeout,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestHttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, OAuth2Error> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let max_response_size = request.max_response_size.unwrap_or(usize::MAX);

        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes()).map_err(
            |e| {
                OAuth2Error::Protocol(ProtocolError::InvalidResponse {
                    message: format!("invalid method {}: {}", request.method.as_str(), e),
                })
            },
        )?;

        let client = if request.follow_redirects {
            &self.redirecting_client
        } else {
            &self.client
        };

        let mut req_builder = client.request(method, request.url.as_str());

        for (key, value) in &request.headers {
            req_builder = req_builder.header(key, value);
        }

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        req_builder = req_builder.timeout(timeout);

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                OAuth2Error::Network(NetworkError::Timeout { timeout })
            } else {
                OAuth2Error::Network(NetworkError::ConnectionFailed {
                    message: e.to_string(),
                })
            }
        })?;

        let status = response.status().as_u16();
        let status_text = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();

        // Collect headers
        let mut headers: HashMap<String, String> = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers
                    .entry(key.as_str().to_lowercase())
                    .and_modify(|existing| {
                        existing.push_str(", ");
                        existing.push_str(v);
                    })
                    .or_insert_with(|| v.to_string());
            }
        }

        // Check content length
        if let Some(len) = response.content_length() {
            let len = usize::try_from(len).unwrap_or(usize::MAX);
            if len > max_response_size {
                return Err(OAuth2Error::Protocol(ProtocolError::ResponseTooLarge { size: len }));
            }
        }

        let body = response.text().await.map_err(|e| {
            OAuth2Error::Protocol(ProtocolError::InvalidResponse {
                message: e.to_string(),
            })
        })?;

        if body.len() > max_response_size {
            return Err(OAuth2Error::Protocol(ProtocolError::ResponseTooLarge {
                size: body.len(),
            }));
        }

        Ok(HttpResponse {
            status,
            status_text,
            headers,
            body,
        })
    }
}

/// Scripted reply of the mock transport.
#[derive(Debug)]
enum MockReply {
    Response(HttpResponse),
    NetworkError(String),
    Failure(OAuth2Error),
}

/// Mock HTTP transport for testing.
///
/// Replies are consumed in the order they were queued.
pub struct MockHttpTransport {
    replies: Mutex<VecDeque<MockReply>>,
    request_history: Mutex<Vec<HttpRequest>>,
    default_response: Mutex<Option<HttpResponse>>,
    supports_request_headers: bool,
}

impl Default for MockHttpTransport {
    fn default() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            request_history: Mutex::new(Vec::new()),
            default_response: Mutex::new(None),
            supports_request_headers: true,
        }
    }
}

impl MockHttpTransport {
    /// Create new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock transport that cannot carry custom request headers.
    pub fn without_request_headers() -> Self {
        Self {
            supports_request_headers: false,
            ..Self::default()
        }
    }

    /// Queue a response to return.
    pub fn queue_response(&self, response: HttpResponse) -> &Self {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(MockReply::Response(response));
        self
    }

    /// Queue a JSON response.
    pub fn queue_json_response<T: serde::Serialize>(&self, status: u16, body: &T) -> &Self {
        let body = serde_json::to_string(body).unwrap_or_default();
        let response =
            HttpResponse::new(status, body).with_header("content-type", "application/json");
        self.queue_response(response)
    }

    /// Queue a failure that yields no HTTP status.
    pub fn queue_network_error(&self, message: impl Into<String>) -> &Self {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(MockReply::NetworkError(message.into()));
        self
    }

    /// Queue an arbitrary transport failure.
    pub fn queue_error(&self, error: OAuth2Error) -> &Self {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(MockReply::Failure(error));
        self
    }

    /// Set default response when queue is empty.
    pub fn set_default_response(&self, response: HttpResponse) -> &Self {
        *self.default_response.lock().unwrap_or_else(|e| e.into_inner()) = Some(response);
        self
    }

    /// Get request history.
    pub fn get_requests(&self) -> Vec<HttpRequest> {
        self.request_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Get last request.
    pub fn get_last_request(&self) -> Option<HttpRequest> {
        self.request_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }

    /// Clear request history.
    pub fn clear_history(&self) {
        self.request_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, OAuth2Error> {
        self.request_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let reply = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .or_else(|| {
                self.default_response
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .map(MockReply::Response)
            });

        match reply {
            Some(MockReply::Response(response)) => Ok(response),
            Some(MockReply::NetworkError(message)) => {
                Err(OAuth2Error::Network(NetworkError::ConnectionFailed { message }))
            }
            Some(MockReply::Failure(error)) => Err(error),
            None => Err(OAuth2Error::Network(NetworkError::ConnectionFailed {
                message: "No mock response available".to_string(),
            })),
        }
    }

    fn supports_request_headers(&self) -> bool {
        self.supports_request_headers
    }
}

/// Create production HTTP transport.
pub fn create_transport(timeout: Option<Duration>) -> Result<ReqwestHttpTransport, OAuth2Error> {
    match timeout {
        Some(t) => ReqwestHttpTransport::with_timeout(t),
        None => ReqwestHttpTransport::new(),
    }
}

/// Create mock HTTP transport for testing.
pub fn create_mock_transport() -> MockHttpTransport {
    MockHttpTransport::new()
}
