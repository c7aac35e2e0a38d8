//! Helpers for driving coordinators over the in-memory relay and links

#![allow(dead_code)]

use anyhow::{bail, Result};
use lanshare::mesh::mock::{MockNetwork, MockRelay};
use lanshare::mesh::{ConnectionState, IncomingUrl, PeerSnapshot, RelayStatus, Subscription};
use lanshare::{MeshConfig, PeerCoordinator, SignalingTransport};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ROOM: &str = "room-1";

pub struct Harness {
    pub relay: MockRelay,
    pub network: MockNetwork,
    pub config: MeshConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(MeshConfig {
            sweep_interval: Duration::from_millis(10),
            ..MeshConfig::default()
        })
    }

    pub fn with_config(config: MeshConfig) -> Self {
        Self {
            relay: MockRelay::new(),
            network: MockNetwork::new(),
            config,
        }
    }

    pub fn node(&self, id: &str) -> Node {
        let transport = SignalingTransport::new(id, "mock://relay", Arc::new(self.relay.clone()));
        let mesh = PeerCoordinator::spawn(
            transport,
            Arc::new(self.network.factory(id)),
            self.config.clone(),
        );
        Node::watch(id, mesh)
    }
}

/// A coordinator plus everything its observers reported
pub struct Node {
    pub id: String,
    pub mesh: PeerCoordinator,
    pub statuses: Arc<Mutex<Vec<RelayStatus>>>,
    pub snapshots: Arc<Mutex<Vec<PeerSnapshot>>>,
    pub urls: Arc<Mutex<Vec<IncomingUrl>>>,
    _subscriptions: Vec<Subscription>,
}

impl Node {
    fn watch(id: &str, mesh: PeerCoordinator) -> Self {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let urls = Arc::new(Mutex::new(Vec::new()));

        let s = statuses.clone();
        let p = snapshots.clone();
        let u = urls.clone();
        let subscriptions = vec![
            mesh.on_status_change(move |status| s.lock().unwrap().push(*status)),
            mesh.on_peers_change(move |snapshot| p.lock().unwrap().push(snapshot.clone())),
            mesh.on_incoming_url(move |url| u.lock().unwrap().push(url.clone())),
        ];

        Self {
            id: id.to_string(),
            mesh,
            statuses,
            snapshots,
            urls,
            _subscriptions: subscriptions,
        }
    }

    pub fn state_of(&self, peer: &Node) -> Option<ConnectionState> {
        self.mesh.snapshot().state_of(&peer.id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.mesh
            .snapshot()
            .iter()
            .map(|p| p.peer_id.clone())
            .collect()
    }

    pub fn received(&self) -> Vec<String> {
        self.urls.lock().unwrap().iter().map(|u| u.url.clone()).collect()
    }

    pub fn status_count(&self, status: RelayStatus) -> usize {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == status)
            .count()
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..200 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {}", what)
}

pub async fn wait_for_async<F, Fut>(what: &str, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {}", what)
}

/// Wait until `node` has `count` peers with an open channel
pub async fn wait_for_open(node: &Node, count: usize) -> Result<()> {
    wait_for_async(&format!("{} open channels on {}", count, node.id), || async move {
        node.mesh.open_peers().await.unwrap_or(0) == count
    })
    .await
}

/// Connect `a` then `b` to ROOM and wait for the handshake to finish
pub async fn pair(a: &Node, b: &Node) -> Result<()> {
    a.mesh.connect(ROOM).await?;
    b.mesh.connect(ROOM).await?;
    wait_for("peers connected", || {
        a.state_of(b) == Some(ConnectionState::Connected)
            && b.state_of(a) == Some(ConnectionState::Connected)
    })
    .await?;
    wait_for_open(a, 1).await?;
    wait_for_open(b, 1).await
}

/// Let in-flight frames and events settle
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
