use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use switchboard_types::{Provider, SwitchboardError};

// ---------------------------------------------------------------------------
// HttpRequest / HttpResponse
// ---------------------------------------------------------------------------

/// A fully built POST. The body is serialized once so every retry sends
/// identical bytes.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn post_json(url: impl Into<String>, body: &Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            url: url.into(),
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: serde_json::to_vec(body)?,
        })
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header with this name, compared case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The URL with any `key=` query value masked, safe to log.
    pub fn redacted_url(&self) -> String {
        let Some(pos) = self.url.find("key=") else {
            return self.url.clone();
        };
        let start = pos + "key=".len();
        let end = self.url[start..]
            .find('&')
            .map(|i| start + i)
            .unwrap_or(self.url.len());
        format!("{}REDACTED{}", &self.url[..start], &self.url[end..])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn into_switchboard(self, provider: Provider) -> SwitchboardError {
        SwitchboardError::Transport {
            provider,
            message: self.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

/// Async POST primitive used by every provider adapter.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Default transport over one pooled `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }
}

/// The URL is stripped from the message since a Gemini URL carries the key.
fn classify_reqwest(e: reqwest::Error) -> TransportError {
    let e = e.without_url();
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(classify_reqwest)?;
        Ok(HttpResponse { status, body })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
