//! Round-trip collaborator: the HTTP client used to reach upstreams.

use crate::body::{ProxyBody, StreamError};
use async_trait::async_trait;
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::fmt;

/// Error produced by a failed upstream round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTripError(String);

impl RoundTripError {
    /// Create a new round-trip error
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoundTripError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round trip failed: {}", self.0)
    }
}

impl std::error::Error for RoundTripError {}

/// A collaborator that dispatches one request to an upstream and returns
/// its streaming response.
///
/// The orchestrator is generic over this trait so tests can substitute a
/// scripted upstream.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    /// Perform one HTTP round trip.
    async fn round_trip(
        &self,
        request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, RoundTripError>;
}

/// Pooled HTTP/1.1 upstream client over plain TCP.
#[derive(Clone)]
pub struct HttpClient {
    inner: Client<HttpConnector, ProxyBody>,
}

impl HttpClient {
    /// Build the client on the tokio executor with default pooling.
    pub fn new() -> Self {
        Self {
            inner: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoundTrip for HttpClient {
    async fn round_trip(
        &self,
        request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, RoundTripError> {
        let response = self
            .inner
            .request(request)
            .await
            .map_err(|err| RoundTripError::new(err.to_string()))?;
        Ok(response.map(|body| {
            body.map_err(|err| StreamError::Source(err.to_string()))
                .boxed_unsync()
        }))
    }
}
