//! gRPC exchange client using tonic.

use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use super::{ExchangeClient, ExchangeError, ExchangeRequest, ExchangeResult, Result};
use crate::config::ExchangeEndpointConfig;
use crate::proto::{ExchangeTokenRequest, ExchangeTokenResponse, EXCHANGE_TOKEN_PATH};
use crate::utils::retry::connection_backoff;

/// Exchange client over a tonic channel.
///
/// Cheap to clone; clones share the underlying channel.
#[derive(Clone)]
pub struct GrpcExchangeClient {
    inner: Grpc<Channel>,
}

impl GrpcExchangeClient {
    /// Connect to the exchange service once.
    pub async fn connect(settings: &ExchangeEndpointConfig) -> Result<Self> {
        let endpoint = Endpoint::from_shared(settings.address.clone())
            .map_err(|e| ExchangeError::InvalidEndpoint(e.to_string()))?
            .connect_timeout(settings.connect_timeout());
        let channel = endpoint.connect().await?;
        Ok(Self::from_channel(channel))
    }

    /// Connect with exponential backoff.
    ///
    /// An unparseable address fails immediately.
    pub async fn connect_with_retry(settings: &ExchangeEndpointConfig) -> Result<Self> {
        let client = (|| Self::connect(settings))
            .retry(connection_backoff())
            .when(|e: &ExchangeError| !matches!(e, ExchangeError::InvalidEndpoint(_)))
            .notify(|err: &ExchangeError, dur: Duration| {
                warn!(
                    address = %settings.address,
                    error = %err,
                    delay = ?dur,
                    "Connection failed, retrying"
                );
            })
            .await?;
        info!(address = %settings.address, "Connected to exchange service");
        Ok(client)
    }

    /// Create a client from an existing channel.
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            inner: Grpc::new(channel),
        }
    }

    async fn call(&self, request: &ExchangeRequest, deadline: Duration) -> Result<ExchangeResult> {
        let mut grpc = self.inner.clone();
        grpc.ready().await?;

        let mut message = tonic::Request::new(ExchangeTokenRequest {
            applicant: request.applicant.clone(),
            user_id: request.subject_id.clone(),
            original_token: request.original_token.clone(),
        });
        message.set_timeout(deadline);

        let codec: ProstCodec<ExchangeTokenRequest, ExchangeTokenResponse> =
            ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(EXCHANGE_TOKEN_PATH);
        let response = grpc.unary(message, path, codec).await?.into_inner();

        if response.token.is_empty() {
            return Err(ExchangeError::Rejected("empty token in response".to_string()));
        }
        Ok(ExchangeResult {
            token: response.token,
        })
    }
}

#[async_trait]
impl ExchangeClient for GrpcExchangeClient {
    async fn exchange(
        &self,
        request: &ExchangeRequest,
        deadline: Duration,
    ) -> Result<ExchangeResult> {
        debug!(subject_id = %request.subject_id, "Calling ExchangeToken");
        tokio::time::timeout(deadline, self.call(request, deadline))
            .await
            .map_err(|_| ExchangeError::Timeout(deadline))?
    }
}
