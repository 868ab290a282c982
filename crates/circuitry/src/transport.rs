//! Transport seams: the multi-hop network the pools are built on.
//!
//! Three layers, each fallible and async:
//! 1. [`Transport::connect`] establishes a client connection (outer pool)
//! 2. [`TransportClient::extend_path`] derives a fresh circuit from it (inner pool)
//! 3. [`Circuit::request`] carries exactly one request over that circuit

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::pool::FactoryError;

/// Status and body of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
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

/// Failure below the application layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid transport configuration: {0}")]
    Config(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Path extension failed: {0}")]
    Extend(String),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Circuit already destroyed")]
    Destroyed,
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<TransportError> for FactoryError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Config(_) => FactoryError::Permanent(e.to_string()),
            TransportError::Cancelled => FactoryError::Cancelled,
            other => FactoryError::Transient(other.to_string()),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Client: TransportClient;

    /// Establish the client connection for outer slot `index`.
    async fn connect(
        &self,
        index: usize,
        cancel: CancellationToken,
    ) -> Result<Self::Client, TransportError>;
}

#[async_trait]
pub trait TransportClient: Send + Sync + 'static {
    type Circuit: Circuit;

    async fn extend_path(&self, cancel: CancellationToken) -> Result<Self::Circuit, TransportError>;
}

#[async_trait]
pub trait Circuit: Send + Sync + 'static {
    /// Perform one request; `timeout` bounds the whole exchange.
    async fn request(&self, url: &str, timeout: Duration) -> Result<Response, TransportError>;

    /// Tear the circuit down. Must be idempotent.
    fn destroy(&self) -> Result<(), TransportError>;
}
