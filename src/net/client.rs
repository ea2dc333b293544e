//! gRPC client for one peer.
//!
//! [`GrpcPeer`] implements [`PeerTransport`] on top of a tonic channel.
//! Calls go through `tonic::client::Grpc` with the prost codec and the
//! hand-written messages from [`proto`](super::proto).
//!
//! The base protocol never retries. A non-zero
//! [`RetryPolicy::max_attempts`] re-sends a failed call with exponential
//! backoff; receivers answer a retried copy of an already granted request
//! with a grant, so a retry cannot create a second deferral.

use super::proto;
use crate::core::config::{PeerConfig, TransportConfig};
use crate::core::error::{status_to_mutex_error, MutexError, MutexResult};
use crate::engine::{NodeId, PeerReply, PeerTransport, Request};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure; 0 disables retry.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// No retry at all.
    pub const fn disabled() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Policy from the transport section of the config.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retriable error, or
    /// the attempts are used up.
    pub async fn run<F, Fut, T>(&self, peer: &NodeId, what: &str, mut op: F) -> MutexResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MutexResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    attempt += 1;
                    tracing::debug!(
                        peer = %peer,
                        call = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying peer call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Transport to a single peer over gRPC.
pub struct GrpcPeer {
    id: NodeId,
    endpoint: Endpoint,
    channel: OnceCell<Channel>,
    retry: RetryPolicy,
}

impl GrpcPeer {
    /// Prepare a peer from its config entry. Does not connect.
    pub fn new(peer: &PeerConfig, transport: &TransportConfig) -> MutexResult<Self> {
        let uri = format!("http://{}", peer.addr);
        let mut endpoint = Endpoint::from_shared(uri).map_err(|e| {
            MutexError::transport(peer.id.as_str(), format!("invalid address {}: {}", peer.addr, e))
        })?;
        endpoint = endpoint.connect_timeout(Duration::from_millis(transport.connect_timeout_ms));
        if transport.request_timeout_ms > 0 {
            endpoint = endpoint.timeout(Duration::from_millis(transport.request_timeout_ms));
        }

        Ok(Self {
            id: NodeId::new(peer.id.clone()),
            endpoint,
            channel: OnceCell::new(),
            retry: RetryPolicy::from_config(transport),
        })
    }

    /// The peer's identity.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Check whether a connection has been established.
    pub fn is_connected(&self) -> bool {
        self.channel.initialized()
    }

    /// Connect now, retrying up to `attempts` times with `backoff`.
    pub async fn connect(&self, attempts: u32, backoff: RetryPolicy) -> MutexResult<()> {
        let policy = RetryPolicy {
            max_attempts: attempts.saturating_sub(1),
            ..backoff
        };
        policy
            .run(&self.id, "connect", || async { self.channel().await.map(|_| ()) })
            .await?;
        tracing::info!(peer = %self.id, uri = %self.endpoint.uri(), "connected to peer");
        Ok(())
    }

    async fn channel(&self) -> MutexResult<Channel> {
        self.channel
            .get_or_try_init(|| async {
                self.endpoint.connect().await.map_err(|e| {
                    MutexError::transport(self.id.as_str(), format!("connect failed: {}", e))
                })
            })
            .await
            .cloned()
    }

    async fn unary<Req, Resp>(&self, path: &'static str, message: Req) -> MutexResult<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel().await?);
        grpc.ready()
            .await
            .map_err(|e| MutexError::transport(self.id.as_str(), format!("not ready: {}", e)))?;

        let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
        let response = grpc
            .unary(
                tonic::Request::new(message),
                PathAndQuery::from_static(path),
                codec,
            )
            .await
            .map_err(|status| status_to_mutex_error(self.id.as_str(), &status))?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl PeerTransport for GrpcPeer {
    async fn request_access(&self, request: Request) -> MutexResult<PeerReply> {
        let message = proto::AccessRequest::from(request);
        let response: proto::AccessResponse = self
            .retry
            .run(&self.id, "RequestAccess", || {
                self.unary(proto::REQUEST_ACCESS_PATH, message.clone())
            })
            .await?;
        Ok(response.into())
    }

    async fn release_access(&self, release: Request) -> MutexResult<PeerReply> {
        let message = proto::ReleaseRequest::from(release);
        let response: proto::ReleaseResponse = self
            .retry
            .run(&self.id, "ReleaseAccess", || {
                self.unary(proto::RELEASE_ACCESS_PATH, message.clone())
            })
            .await?;
        Ok(response.into())
    }
}

impl std::fmt::Debug for GrpcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcPeer")
            .field("id", &self.id)
            .field("uri", self.endpoint.uri())
            .field("connected", &self.is_connected())
            .finish()
    }
}
