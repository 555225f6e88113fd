//! The pluggable fetch function.
//!
//! The data source never talks to the network directly; the host supplies an
//! implementation of [`Transport`] and the adapter builds requests for it.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use mirror_core::DataError;

/// Logical HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An outbound request handed to the transport.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl FetchRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }
}

/// The transport's answer: status, reason phrase, raw body.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// Build a response, deriving the reason phrase from the status code.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            status_text: status_text(status).to_string(),
            body,
        }
    }

    /// Build a response carrying a JSON body.
    pub fn json(status: u16, value: &Value) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self::new(status, body)
    }

    /// An empty 204 response.
    pub fn no_content() -> Self {
        Self::new(204, Vec::new())
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    /// Decode the body as JSON. A 204 or empty body decodes to `None`.
    pub fn decode(&self) -> Result<Option<Value>, DataError> {
        if self.status == 204 || self.body.is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_slice(&self.body)?;
        Ok(Some(value))
    }
}

/// Failures below the HTTP layer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failure: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("request rejected: {0}")]
    Request(String),
}

/// Pluggable fetch function.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError>;
}

/// Reason phrase for the status codes the engine cares about.
pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        410 => "Gone",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}
