//! HTTP seam between the supervisor and the worker's loopback API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use reqwest::Method;

/// One call to the worker.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub method: Method,
    pub port: u16,
    /// Absolute path, e.g. `/api/health`.
    pub path: String,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl WorkerRequest {
    pub fn new(method: Method, port: u16, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            port,
            path: path.into(),
            body: None,
            timeout,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, self.path)
    }
}

/// Status plus decoded body. Bodies that are not JSON arrive as a JSON string.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub status: u16,
    pub body: Value,
}

impl WorkerResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The worker reports failures as `{"error": "..."}`.
    pub fn error_message(&self) -> Option<String> {
        self.body
            .get("error")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// The request never produced an HTTP response.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request to worker timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not reach worker: {0}")]
    Connect(String),

    #[error("worker request failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: WorkerRequest) -> Result<WorkerResponse, TransportError>;
}

/// Production transport: plain HTTP on 127.0.0.1.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// The worker is always on loopback, so environment proxies are ignored.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: WorkerRequest) -> Result<WorkerResponse, TransportError> {
        let url = request.url();
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .timeout(request.timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(request.timeout)
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(request.timeout)
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(WorkerResponse { status, body })
    }
}
