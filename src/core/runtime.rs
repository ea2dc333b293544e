//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: gRPC listener → peer connections → scheduling loop
//! - Shutdown order: scheduling loop → listener
//!
//! The listener comes up before any peer is dialled so that nodes started
//! at the same time can reach each other.

use crate::core::config::{Config, SchedulerConfig};
use crate::core::error::{MutexError, MutexResult};
use crate::engine::{Node, NodeId, PeerSet};
use crate::net::client::{GrpcPeer, RetryPolicy};
use crate::net::server::MutexGrpcServer;
use anyhow::{Context, Result};
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long `stop` waits for the listener to drain.
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Node runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// The mutual-exclusion node shared with the gRPC service.
    node: Arc<Node>,

    /// Outbound transports, kept for eager connection.
    peers: Vec<Arc<GrpcPeer>>,

    /// Address the listener actually bound.
    local_addr: Option<SocketAddr>,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: Arc<watch::Sender<bool>>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,

    /// gRPC server task handle.
    server_handle: Option<JoinHandle<MutexResult<()>>>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let mut peer_set = PeerSet::new();
        let mut peers = Vec::with_capacity(config.peers.len());
        for entry in &config.peers {
            let peer = Arc::new(
                GrpcPeer::new(entry, &config.transport)
                    .with_context(|| format!("invalid peer {}", entry.id))?,
            );
            peer_set.insert(peer.id().clone(), peer.clone());
            peers.push(peer);
        }

        let node = Arc::new(Node::new(NodeId::new(config.node.id.clone()), peer_set));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            node,
            peers,
            local_addr: None,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            server_handle: None,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the node.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Bind the configured address and start serving.
    pub async fn start(&mut self) -> Result<()> {
        let bind_addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", bind_addr))?;
        self.start_with_listener(listener).await
    }

    /// Start serving on an already bound listener, then connect peers.
    pub async fn start_with_listener(&mut self, listener: TcpListener) -> Result<()> {
        let local_addr = listener
            .local_addr()
            .context("listener has no local address")?;

        tracing::info!(
            node = %self.node.id(),
            bind = %local_addr,
            peers = self.peers.len(),
            "starting mutex runtime"
        );

        let server = MutexGrpcServer::new(local_addr, self.node.clone(), self.shutdown_rx.clone());
        self.server_handle = Some(tokio::spawn(server.serve(listener)));
        self.local_addr = Some(local_addr);
        self.running.store(true, Ordering::Release);

        self.connect_peers().await;
        Ok(())
    }

    /// Dial every peer eagerly. A peer that stays unreachable is logged and
    /// left to connect lazily on first use.
    async fn connect_peers(&self) {
        let attempts = self.config.transport.connect_attempts;
        let backoff = RetryPolicy::from_config(&self.config.transport);

        let results = join_all(self.peers.iter().map(|peer| async move {
            (peer.id().clone(), peer.connect(attempts, backoff).await)
        }))
        .await;

        for (peer, result) in results {
            if let Err(e) = result {
                tracing::warn!(
                    node = %self.node.id(),
                    peer = %peer,
                    attempts,
                    error = %e,
                    "peer unreachable at startup, will retry on first request"
                );
            }
        }
    }

    /// Sender that stops a runtime owned elsewhere (e.g. moved into
    /// [`run`](Self::run) on another task).
    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown_tx.clone()
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        shutdown_signalled(&mut rx).await;
    }

    /// Run the runtime until shutdown.
    ///
    /// The scheduling loop finishing its rounds does not stop the node; it
    /// keeps answering peers until ctrl-c or [`shutdown`](Self::shutdown).
    /// A fatal engine error or a listener failure stops it.
    pub async fn run(&mut self) -> Result<()> {
        if self.server_handle.is_none() {
            self.start().await?;
        }
        let Some(mut server) = self.server_handle.take() else {
            anyhow::bail!("gRPC server did not start");
        };

        let mut scheduler = tokio::spawn(run_scheduler(
            self.node.clone(),
            self.config.scheduler.clone(),
            self.shutdown_rx.clone(),
        ));
        let mut scheduler_done = false;
        let mut server_done = false;
        let mut failure: Option<anyhow::Error> = None;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("shutdown signal received (SIGINT)");
                    break;
                }
                _ = shutdown_signalled(&mut shutdown_rx) => {
                    tracing::info!("shutdown requested by component");
                    break;
                }
                result = &mut server => {
                    server_done = true;
                    match result {
                        Ok(Ok(())) => {
                            tracing::info!("gRPC server stopped normally");
                        }
                        Ok(Err(e)) => {
                            tracing::error!(error = %e, "gRPC server failed");
                            failure = Some(anyhow::Error::new(e).context("gRPC server failed"));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "gRPC server task panicked");
                            failure = Some(anyhow::anyhow!("gRPC server task panicked: {}", e));
                        }
                    }
                    break;
                }
                result = &mut scheduler, if !scheduler_done => {
                    scheduler_done = true;
                    match result {
                        Ok(Ok(rounds)) => {
                            tracing::info!(
                                node = %self.node.id(),
                                rounds,
                                "scheduling loop finished, still serving peers"
                            );
                        }
                        Ok(Err(e)) => {
                            tracing::error!(node = %self.node.id(), error = %e, "stopping node");
                            failure = Some(anyhow::Error::new(e).context("fatal engine error"));
                            break;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "scheduling loop panicked");
                            failure = Some(anyhow::anyhow!("scheduling loop panicked: {}", e));
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown();
        if !scheduler_done {
            // An acquisition stalled on an unreachable peer never returns.
            scheduler.abort();
        }
        if !server_done {
            self.server_handle = Some(server);
        }
        self.stop().await?;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop all runtime components.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown();

        if let Some(handle) = self.server_handle.take() {
            match tokio::time::timeout(SERVER_STOP_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    tracing::warn!(error = %e, "gRPC server reported an error while stopping");
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "gRPC server task failed while stopping");
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = SERVER_STOP_TIMEOUT.as_millis() as u64,
                        "gRPC server did not stop in time"
                    );
                }
            }
        }

        self.running.store(false, Ordering::Release);
        let stats = self.node.stats();
        tracing::info!(
            node = %self.node.id(),
            acquisitions = stats.acquisitions,
            grants_given = stats.grants_given,
            deferrals = stats.deferrals,
            "runtime stopped"
        );
        Ok(())
    }
}

/// Repeatedly acquire the critical section, hold it for the configured
/// duration, and release it.
///
/// Returns the number of completed rounds once `max_rounds` is reached or
/// shutdown is signalled. Non-fatal errors are logged and the loop carries
/// on; a fatal error ends it.
pub async fn run_scheduler(
    node: Arc<Node>,
    config: SchedulerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> MutexResult<u64> {
    let interval = Duration::from_millis(config.request_interval_ms);
    let hold = Duration::from_millis(config.hold_duration_ms);
    let mut rounds = 0u64;

    while config.max_rounds == 0 || rounds < config.max_rounds {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_signalled(&mut shutdown_rx) => break,
        }

        let round = node.run_exclusive(|| async {
            tracing::info!(
                node = %node.id(),
                timestamp = %node.clock(),
                hold_ms = hold.as_millis() as u64,
                "working in critical section"
            );
            tokio::time::sleep(hold).await;
        });

        // Shutdown abandons a round stalled on an unreachable peer.
        let outcome = tokio::select! {
            outcome = round => outcome,
            _ = shutdown_signalled(&mut shutdown_rx) => Err(MutexError::Shutdown),
        };

        match outcome {
            Ok(Some(())) => rounds += 1,
            Ok(None) => {
                tracing::debug!(node = %node.id(), "round skipped, acquisition outstanding");
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(MutexError::Shutdown) => {
                tracing::info!(node = %node.id(), state = %node.state(), "round interrupted by shutdown");
                break;
            }
            Err(e) => {
                tracing::warn!(node = %node.id(), error = %e, "round failed");
            }
        }
    }

    Ok(rounds)
}

/// Resolve once the watch channel carries `true` or its sender is gone.
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
