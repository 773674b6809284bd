//! Token exchange client.
//!
//! This module contains:
//! - `ExchangeClient` trait: one remote exchange call, no internal retry
//! - Request/response types
//! - Implementations: gRPC (tonic), Mock

use std::time::Duration;

use async_trait::async_trait;
use tonic::{Code, Status};

pub mod grpc;
pub mod mock;

pub use grpc::GrpcExchangeClient;
pub use mock::MockExchangeClient;

/// Result type for exchange calls.
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Errors from a single exchange call.
///
/// All of these are transient from the coordinator's point of view.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("grpc error: {0}")]
    Grpc(Box<Status>),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("exchange call timed out after {0:?}")]
    Timeout(Duration),

    #[error("exchange rejected: {0}")]
    Rejected(String),
}

impl From<Status> for ExchangeError {
    fn from(status: Status) -> Self {
        ExchangeError::Grpc(Box::new(status))
    }
}

impl ExchangeError {
    /// Returns the gRPC status code if this is a gRPC error.
    pub fn code(&self) -> Option<Code> {
        match self {
            ExchangeError::Grpc(s) => Some(s.code()),
            _ => None,
        }
    }

    /// Returns true if this is a deadline expiry, local or remote.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExchangeError::Timeout(_))
            || matches!(self.code(), Some(Code::DeadlineExceeded))
    }
}

/// Input to one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRequest {
    /// Identifier of the party requesting the exchange.
    pub applicant: String,
    /// User whose replication is awaited.
    pub subject_id: String,
    /// Externally issued token.
    pub original_token: String,
}

impl ExchangeRequest {
    pub fn new(
        applicant: impl Into<String>,
        subject_id: impl Into<String>,
        original_token: impl Into<String>,
    ) -> Self {
        Self {
            applicant: applicant.into(),
            subject_id: subject_id.into(),
            original_token: original_token.into(),
        }
    }
}

/// Successful exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct ExchangeResult {
    pub token: String,
}

impl std::fmt::Debug for ExchangeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeResult")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// One remote token exchange.
///
/// Implementations make exactly one call per invocation and must give up
/// after `deadline`.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn exchange(&self, request: &ExchangeRequest, deadline: Duration)
        -> Result<ExchangeResult>;
}
