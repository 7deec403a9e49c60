//! Transport port - リモートストアへの送信

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::RequestDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("no response configured for {0}")]
    NoResponse(String),
}

/// Transport sends a resolved request and returns the raw response body.
///
/// Implementations must not retry; a failure is reported once and the
/// partition chain ends there.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestDescriptor) -> Result<Vec<u8>, TransportError>;
}
