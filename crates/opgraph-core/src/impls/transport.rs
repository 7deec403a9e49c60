//! Transports - HTTP と固定レスポンス
//!
//! `HttpTransport` is the production transport (reqwest). `StaticTransport`
//! answers from a table of canned bodies keyed by URL; the CLI uses it for
//! `--fixture` files and the tests use its gate to hold a request in flight.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::domain::{Method, RequestDescriptor};
use crate::ports::{Transport, TransportError};

#[derive(Debug, Clone)]
enum Canned {
    Body(Vec<u8>),
    Status(u16),
}

/// Transport answering from canned responses.
pub struct StaticTransport {
    responses: Mutex<HashMap<String, Canned>>,
    requests: Mutex<Vec<(Method, String)>>,
    calls: watch::Sender<usize>,
    gate: Mutex<Option<watch::Receiver<bool>>>,
}

/// Holds every request sent through a `StaticTransport` until released.
pub struct TransportGate {
    open: watch::Sender<bool>,
}

impl TransportGate {
    pub fn release(&self) {
        self.open.send_replace(true);
    }
}

impl Drop for TransportGate {
    fn drop(&mut self) {
        self.release();
    }
}

impl StaticTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            calls: watch::Sender::new(0),
            gate: Mutex::new(None),
        }
    }

    /// Load a fixture: a JSON object mapping URLs to the JSON body returned
    /// for them.
    pub fn from_json(fixture: &str) -> Result<Self, serde_json::Error> {
        let table: HashMap<String, serde_json::Value> = serde_json::from_str(fixture)?;
        let transport = Self::new();
        for (url, body) in table {
            transport.respond(url, serde_json::to_vec(&body)?);
        }
        Ok(transport)
    }

    pub fn respond(&self, url: impl Into<String>, body: Vec<u8>) {
        self.responses.lock().insert(url.into(), Canned::Body(body));
    }

    /// Answer `url` with a non-success status.
    pub fn respond_status(&self, url: impl Into<String>, status: u16) {
        self.responses.lock().insert(url.into(), Canned::Status(status));
    }

    /// Hold requests until the returned gate is released or dropped.
    pub fn hold(&self) -> TransportGate {
        let (open, closed) = watch::channel(false);
        *self.gate.lock() = Some(closed);
        TransportGate { open }
    }

    /// Number of requests sent so far (held ones included).
    pub fn calls(&self) -> usize {
        *self.calls.borrow()
    }

    /// Method and URL of every request, in order.
    pub fn requests(&self) -> Vec<(Method, String)> {
        self.requests.lock().clone()
    }

    pub async fn wait_for_calls(&self, count: usize) {
        let mut calls = self.calls.subscribe();
        let _ = calls.wait_for(|calls| *calls >= count).await;
    }
}

impl Default for StaticTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StaticTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<Vec<u8>, TransportError> {
        let url = request.url.to_string();
        self.requests.lock().push((request.method, url.clone()));
        self.calls.send_modify(|calls| *calls += 1);

        let gate = self.gate.lock().clone();
        if let Some(mut gate) = gate {
            trace!(%url, "request held");
            let _ = gate.wait_for(|open| *open).await;
        }

        let canned = self.responses.lock().get(&url).cloned();
        match canned {
            Some(Canned::Body(body)) => Ok(body),
            Some(Canned::Status(status)) => Err(TransportError::Status { url, status }),
            None => Err(TransportError::NoResponse(url)),
        }
    }
}

/// Transport over HTTP(S).
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let invalid = |message: String| TransportError::Request {
            url: String::new(),
            message,
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| invalid(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| invalid(format!("invalid value for header '{name}': {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| invalid(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<Vec<u8>, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        let url = request.url.to_string();

        let mut builder = self.client.request(method, request.url.clone());
        if let Some(body) = &request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("timed out: {e}")
            } else if e.is_connect() {
                format!("connection failed: {e}")
            } else {
                e.to_string()
            };
            TransportError::Request {
                url: url.clone(),
                message,
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| TransportError::Request {
            url: url.clone(),
            message: format!("failed to read response body: {e}"),
        })?;
        debug!(%url, bytes = body.len(), "response received");
        Ok(body.to_vec())
    }
}
