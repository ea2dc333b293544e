//! gRPC server for the mutex service.
//!
//! Wires `RequestAccess` and `ReleaseAccess` to the node's inbound
//! handlers. The service is a hand-rolled tonic service over the unary
//! framing in [`framing`](super::framing).

use crate::core::error::{mutex_error_to_status, MutexError, MutexResult};
use crate::engine::Node;
use bytes::Bytes;
use prost::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::body::BoxBody;
use tonic::codegen::http::Response;
use tonic::codegen::StdError;
use tonic::Status;

use super::{framing, proto};

/// Inbound side of the protocol, shared by every connection.
#[derive(Clone)]
pub struct MutexService {
    node: Arc<Node>,
}

impl MutexService {
    /// Create a service over `node`.
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// Handle `RequestAccess`.
    pub fn request_access(&self, req: proto::AccessRequest) -> MutexResult<proto::AccessResponse> {
        let request = req.into_request().map_err(MutexError::protocol)?;
        let reply = self.node.on_request(request)?;
        Ok(reply.into())
    }

    /// Handle `ReleaseAccess`.
    pub fn release_access(
        &self,
        req: proto::ReleaseRequest,
    ) -> MutexResult<proto::ReleaseResponse> {
        let release = req.into_request().map_err(MutexError::protocol)?;
        let reply = self.node.on_release(release)?;
        Ok(reply.into())
    }

    /// Route one call by its path, read its request and answer it.
    async fn dispatch<B>(&self, path: &str, body: B) -> Response<BoxBody>
    where
        B: tonic::codegen::Body,
        B::Data: Into<Bytes>,
        B::Error: Into<StdError>,
    {
        match path {
            proto::REQUEST_ACCESS_PATH => match framing::read_unary(body).await {
                Ok(req) => self.respond("RequestAccess", self.request_access(req)),
                Err(status) => framing::status_response(status),
            },
            proto::RELEASE_ACCESS_PATH => match framing::read_unary(body).await {
                Ok(req) => self.respond("ReleaseAccess", self.release_access(req)),
                Err(status) => framing::status_response(status),
            },
            _ => {
                tracing::warn!(path = %path, "unknown mutex method");
                framing::status_response(Status::unimplemented(format!(
                    "Unknown method: {}",
                    path
                )))
            }
        }
    }

    fn respond<M: Message>(&self, method: &str, result: MutexResult<M>) -> Response<BoxBody> {
        match result {
            Ok(message) => framing::message_response(&message),
            Err(e) => {
                tracing::warn!(node = %self.node.id(), method, error = %e, "call rejected");
                framing::status_response(mutex_error_to_status(e))
            }
        }
    }
}

impl tonic::server::NamedService for MutexService {
    const NAME: &'static str = proto::SERVICE_NAME;
}

impl<B> tonic::codegen::Service<tonic::codegen::http::Request<B>> for MutexService
where
    B: tonic::codegen::Body + Send + 'static,
    B::Data: Into<Bytes> + Send,
    B::Error: Into<tonic::codegen::StdError> + Send + 'static,
{
    type Response = Response<BoxBody>;
    type Error = std::convert::Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: tonic::codegen::http::Request<B>) -> Self::Future {
        let inner = self.clone();
        let path = req.uri().path().to_string();

        Box::pin(async move {
            tracing::trace!(path = %path, "handling mutex request");
            Ok(inner.dispatch(&path, req.into_body()).await)
        })
    }
}

/// gRPC server hosting one node.
pub struct MutexGrpcServer {
    bind_addr: SocketAddr,
    node: Arc<Node>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MutexGrpcServer {
    /// Create a server for `node` on `bind_addr`.
    pub fn new(bind_addr: SocketAddr, node: Arc<Node>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            node,
            shutdown_rx,
        }
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(self, listener: TcpListener) -> MutexResult<()> {
        use tonic::transport::Server;

        let addr = listener.local_addr().unwrap_or(self.bind_addr);
        let mut shutdown_rx = self.shutdown_rx;

        tracing::info!(node = %self.node.id(), %addr, "starting mutex gRPC server");

        Server::builder()
            .add_service(MutexService::new(self.node))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                tracing::info!("gRPC server shutting down");
            })
            .await
            .map_err(|e| MutexError::Internal {
                message: format!("gRPC server error: {}", e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LogicalTimestamp, NodeId, PeerSet};
    use crate::engine::{PeerReply, PeerTransport, Request};
    use async_trait::async_trait;
    use http_body_util::{BodyExt, Full};

    struct Silent;

    #[async_trait]
    impl PeerTransport for Silent {
        async fn request_access(&self, _request: Request) -> MutexResult<PeerReply> {
            Err(MutexError::transport("silent", "no network in unit tests"))
        }

        async fn release_access(&self, _release: Request) -> MutexResult<PeerReply> {
            Err(MutexError::transport("silent", "no network in unit tests"))
        }
    }

    fn service() -> MutexService {
        let peers = PeerSet::new().with_peer(NodeId::new("node2"), Arc::new(Silent));
        MutexService::new(Arc::new(Node::new(NodeId::new("node1"), peers)))
    }

    #[test]
    fn test_request_access_grants_when_released() {
        let svc = service();
        let resp = svc
            .request_access(proto::AccessRequest {
                node_id: "node2".to_string(),
                lamport_timestamp: 4,
            })
            .unwrap();
        assert!(resp.granted);
        assert_eq!(resp.lamport_timestamp, 5);
    }

    #[test]
    fn test_request_access_rejects_missing_node_id() {
        let svc = service();
        let err = svc
            .request_access(proto::AccessRequest::default())
            .unwrap_err();
        assert!(matches!(err, MutexError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_release_access_without_pending_grant() {
        let svc = service();
        let resp = svc
            .release_access(proto::ReleaseRequest {
                node_id: "node2".to_string(),
                lamport_timestamp: 9,
            })
            .unwrap();
        assert!(!resp.acknowledged);
        assert_eq!(resp.lamport_timestamp, 10);
        assert_eq!(svc.node.clock(), LogicalTimestamp::new(10));
    }

    #[tokio::test]
    async fn test_dispatch_answers_framed_request() {
        let svc = service();
        let body = Full::new(framing::encode(&proto::AccessRequest {
            node_id: "node2".to_string(),
            lamport_timestamp: 6,
        }));

        let response = svc.dispatch(proto::REQUEST_ACCESS_PATH, body).await;
        let collected = response.into_body().collect().await.unwrap();
        let reply: proto::AccessResponse = framing::decode(&collected.to_bytes()).unwrap();
        assert!(reply.granted);
        assert_eq!(reply.lamport_timestamp, 7);
    }

    #[tokio::test]
    async fn test_dispatch_rejection_carries_status() {
        let svc = service();
        let body = Full::new(framing::encode(&proto::ReleaseRequest {
            node_id: "node1".to_string(),
            lamport_timestamp: 6,
        }));

        let response = svc.dispatch(proto::RELEASE_ACCESS_PATH, body).await;
        assert_eq!(grpc_status(&response).as_deref(), Some("3"));
        assert_eq!(svc.node.clock(), LogicalTimestamp::zero());
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let svc = service();
        let response = svc
            .dispatch("/mutex.MutexService/Nope", Full::new(Bytes::new()))
            .await;
        assert_eq!(grpc_status(&response).as_deref(), Some("12"));
    }

    fn grpc_status(response: &Response<BoxBody>) -> Option<String> {
        response
            .headers()
            .get("grpc-status")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}
