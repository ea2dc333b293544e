//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use ramutex::core::config::Config;
use ramutex::core::error::{MutexError, MutexResult};
use ramutex::engine::{LogicalTimestamp, Node, NodeId, PeerReply, PeerSet, PeerTransport, Request};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

// ============================================================================
// Config helpers
// ============================================================================

/// Write `content` to a temp file.
pub fn create_config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Config file for `id` in a cluster of `node1..nodeN` on consecutive ports.
pub fn create_cluster_config(id: &str, nodes: u16, base_port: u16) -> NamedTempFile {
    let mut content = String::new();
    for index in 0..nodes {
        let name = format!("node{}", index + 1);
        let addr = format!("127.0.0.1:{}", base_port + index);
        if name == id {
            content.push_str(&format!("[node]\nid = \"{}\"\nbind = \"{}\"\n\n", name, addr));
        } else {
            content.push_str(&format!("[[peers]]\nid = \"{}\"\naddr = \"{}\"\n\n", name, addr));
        }
    }
    create_config_file(&content)
}

/// Load and validate a config file.
pub fn load_config(file: &NamedTempFile) -> Config {
    Config::from_file(file.path()).expect("Failed to load config")
}

// ============================================================================
// In-memory network
// ============================================================================

/// Routes calls straight into the target node's inbound handlers.
pub struct Network {
    nodes: Mutex<HashMap<NodeId, Arc<Node>>>,
    down: Mutex<HashSet<NodeId>>,
    max_delay: Duration,
}

impl Network {
    /// A network that delivers every call after a random delay in
    /// `0..=max_delay`.
    pub fn new(max_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            down: Mutex::new(HashSet::new()),
            max_delay,
        })
    }

    /// Build one node per id, fully connected through this network.
    pub fn cluster(self: &Arc<Self>, ids: &[&str]) -> Vec<Arc<Node>> {
        let nodes: Vec<_> = ids
            .iter()
            .map(|id| {
                let me = NodeId::new(*id);
                let peers = ids
                    .iter()
                    .filter(|other| *other != id)
                    .fold(PeerSet::new(), |set, other| {
                        let peer = NodeId::new(*other);
                        let link = Arc::new(Loopback {
                            to: peer.clone(),
                            network: self.clone(),
                        });
                        set.with_peer(peer, link)
                    });
                Arc::new(Node::new(me, peers))
            })
            .collect();

        let mut registry = self.nodes.lock();
        for node in &nodes {
            registry.insert(node.id().clone(), node.clone());
        }
        nodes
    }

    /// Make calls to `id` fail with a transport error.
    pub fn take_down(&self, id: &str) {
        self.down.lock().insert(NodeId::new(id));
    }

    /// Undo [`take_down`](Self::take_down).
    pub fn bring_up(&self, id: &str) {
        self.down.lock().remove(&NodeId::new(id));
    }

    fn target(&self, id: &NodeId) -> MutexResult<Arc<Node>> {
        if self.down.lock().contains(id) {
            return Err(MutexError::transport(id.as_str(), "connection refused"));
        }
        self.nodes
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| MutexError::transport(id.as_str(), "no such node"))
    }

    fn jitter(&self) -> Duration {
        let max = self.max_delay.as_micros() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=max))
    }

    async fn delay(&self) {
        let jitter = self.jitter();
        if jitter.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(jitter).await;
        }
    }
}

/// One direction of a link in [`Network`].
struct Loopback {
    to: NodeId,
    network: Arc<Network>,
}

impl Loopback {
    // A handler error reaches the caller the way a gRPC status would.
    fn as_transport(&self, result: MutexResult<PeerReply>) -> MutexResult<PeerReply> {
        result.map_err(|e| MutexError::transport(self.to.as_str(), e.to_string()))
    }
}

#[async_trait]
impl PeerTransport for Loopback {
    async fn request_access(&self, request: Request) -> MutexResult<PeerReply> {
        self.network.delay().await;
        let reply = self.as_transport(self.network.target(&self.to)?.on_request(request));
        self.network.delay().await;
        reply
    }

    async fn release_access(&self, release: Request) -> MutexResult<PeerReply> {
        self.network.delay().await;
        let reply = self.as_transport(self.network.target(&self.to)?.on_release(release));
        self.network.delay().await;
        reply
    }
}

// ============================================================================
// Scripted peers
// ============================================================================

/// How a [`ScriptedPeer`] answers `RequestAccess`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Grant at once with the given timestamp.
    Grant(u64),
    /// Defer with the given timestamp; the grant comes with a release.
    Defer(u64),
    /// Never answer.
    Stall,
    /// Fail requests and releases with a transport error.
    Refuse,
}

/// A peer that answers from a script and records what it was sent.
pub struct ScriptedPeer {
    script: Mutex<Script>,
    requests: Mutex<Vec<Request>>,
    releases: Mutex<Vec<Request>>,
}

impl ScriptedPeer {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn releases(&self) -> Vec<Request> {
        self.releases.lock().clone()
    }
}

#[async_trait]
impl PeerTransport for ScriptedPeer {
    async fn request_access(&self, request: Request) -> MutexResult<PeerReply> {
        self.requests.lock().push(request);
        let script = *self.script.lock();
        match script {
            Script::Grant(ts) => Ok(PeerReply::grant(LogicalTimestamp::new(ts))),
            Script::Defer(ts) => Ok(PeerReply::defer(LogicalTimestamp::new(ts))),
            Script::Stall => std::future::pending().await,
            Script::Refuse => Err(MutexError::transport("scripted", "connection refused")),
        }
    }

    async fn release_access(&self, release: Request) -> MutexResult<PeerReply> {
        if *self.script.lock() == Script::Refuse {
            return Err(MutexError::transport("scripted", "connection refused"));
        }
        let timestamp = release.timestamp();
        self.releases.lock().push(release);
        Ok(PeerReply::grant(timestamp))
    }
}

/// A node whose peers are the given scripted transports.
pub fn scripted_node(id: &str, peers: &[(&str, Arc<ScriptedPeer>)]) -> Arc<Node> {
    let set = peers.iter().fold(PeerSet::new(), |set, (peer, transport)| {
        set.with_peer(NodeId::new(*peer), transport.clone())
    });
    Arc::new(Node::new(NodeId::new(id), set))
}

/// Shorthand for a request.
pub fn request(id: &str, ts: u64) -> Request {
    Request::new(NodeId::new(id), LogicalTimestamp::new(ts))
}

/// Wait until `check` holds, polling every millisecond for up to 5s.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..5_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
