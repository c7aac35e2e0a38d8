//! In-memory relay and peer links
//!
//! `MockRelay` echoes every frame to every connected client, sender included,
//! like the public relay does. `MockNetwork` pairs links by the id carried in
//! the offer and opens both ends as soon as the answer is applied.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;

use super::error::{LinkError, TransportError};
use super::transport::{LinkEvent, LinkEventSink, LinkFactory, PeerLink, RelayConnector, RelayLink};
use super::types::{ChannelState, ConnectionState, NodeId};

#[derive(Default)]
struct RelayHub {
    next_client: u64,
    clients: HashMap<u64, mpsc::UnboundedSender<String>>,
    /// Clients the relay hung up on; their later frames are discarded
    hung_up: HashSet<u64>,
    frames: Vec<String>,
    unreachable: bool,
}

impl RelayHub {
    fn fan_out(&mut self, text: &str) {
        self.clients.retain(|_, tx| tx.send(text.to_string()).is_ok());
    }
}

/// Echoing relay shared by every coordinator in a test
#[derive(Clone, Default)]
pub struct MockRelay {
    hub: Arc<Mutex<RelayHub>>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, RelayHub> {
        self.hub.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Deliver a raw frame to every client, as if some other node sent it
    pub fn inject(&self, text: &str) {
        self.hub().fan_out(text);
    }

    /// Close every client connection from the relay side
    pub fn drop_all(&self) {
        let mut hub = self.hub();
        let ids: Vec<u64> = hub.clients.drain().map(|(id, _)| id).collect();
        hub.hung_up.extend(ids);
    }

    /// Refuse new connections
    pub fn set_unreachable(&self, unreachable: bool) {
        self.hub().unreachable = unreachable;
    }

    /// Every frame clients sent, in arrival order
    pub fn frames(&self) -> Vec<String> {
        self.hub().frames.clone()
    }

    pub fn client_count(&self) -> usize {
        self.hub().clients.len()
    }
}

#[async_trait]
impl RelayConnector for MockRelay {
    async fn open(&self, url: &str) -> Result<RelayLink, TransportError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let client = {
            let mut hub = self.hub();
            if hub.unreachable {
                return Err(TransportError::ConnectionFailed(format!(
                    "{} unreachable",
                    url
                )));
            }
            let client = hub.next_client;
            hub.next_client += 1;
            hub.clients.insert(client, inbound_tx);
            client
        };

        let hub = self.hub.clone();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                let mut hub = hub.lock().unwrap_or_else(|p| p.into_inner());
                if hub.hung_up.contains(&client) {
                    break;
                }
                trace!("Mock relay: client {} -> {}", client, text);
                hub.frames.push(text.clone());
                hub.fan_out(&text);
            }
            let mut hub = hub.lock().unwrap_or_else(|p| p.into_inner());
            hub.clients.remove(&client);
        });

        Ok(RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

struct LinkSlot {
    owner: NodeId,
    remote: NodeId,
    sink: LinkEventSink,
    partner: Option<u64>,
    channel_open: bool,
    closed: bool,
    applied_candidates: Vec<serde_json::Value>,
}

impl LinkSlot {
    fn emit(&self, event: LinkEvent) {
        if !self.closed {
            self.sink.emit(event);
        }
    }
}

#[derive(Default)]
struct NetworkState {
    next_link: u64,
    links: HashMap<u64, LinkSlot>,
}

impl NetworkState {
    /// Live link owned by `local` towards `remote`
    fn find(&self, local: &str, remote: &str) -> Option<u64> {
        self.links
            .iter()
            .filter(|(_, slot)| !slot.closed && slot.owner == local && slot.remote == remote)
            .map(|(id, _)| *id)
            .max()
    }
}

/// Registry of in-memory links shared by every node in a test
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Link factory for the node `local_id`
    pub fn factory(&self, local_id: &str) -> MockLinkFactory {
        MockLinkFactory {
            network: self.clone(),
            local_id: local_id.to_string(),
        }
    }

    /// Make the link `local` holds towards `remote` report a connection state
    pub fn set_state(&self, local: &str, remote: &str, state: ConnectionState) -> bool {
        let mut net = self.state();
        let Some(id) = net.find(local, remote) else {
            return false;
        };
        if let Some(slot) = net.links.get_mut(&id) {
            if matches!(state, ConnectionState::Failed | ConnectionState::Closed) {
                slot.channel_open = false;
            }
            slot.emit(LinkEvent::ConnectionState(state));
        }
        true
    }

    /// Make the link `local` holds towards `remote` report a channel state
    pub fn set_channel_state(&self, local: &str, remote: &str, state: ChannelState) -> bool {
        let mut net = self.state();
        let Some(id) = net.find(local, remote) else {
            return false;
        };
        if let Some(slot) = net.links.get_mut(&id) {
            slot.channel_open = state == ChannelState::Open;
            slot.emit(LinkEvent::ChannelState(state));
        }
        true
    }

    /// Hand `text` to `local` as if `remote` had written it to the channel
    pub fn deliver(&self, local: &str, remote: &str, text: &str) -> bool {
        let net = self.state();
        let Some(slot) = net.find(local, remote).and_then(|id| net.links.get(&id)) else {
            return false;
        };
        slot.emit(LinkEvent::Message(text.to_string()));
        true
    }

    /// Candidates the link `local` holds towards `remote` has applied
    pub fn applied_candidates(&self, local: &str, remote: &str) -> usize {
        let net = self.state();
        net.find(local, remote)
            .and_then(|id| net.links.get(&id))
            .map(|slot| slot.applied_candidates.len())
            .unwrap_or(0)
    }

    /// Links not yet closed
    pub fn live_links(&self) -> usize {
        self.state().links.values().filter(|s| !s.closed).count()
    }
}

/// Creates in-memory links for one node
#[derive(Clone)]
pub struct MockLinkFactory {
    network: MockNetwork,
    local_id: NodeId,
}

#[async_trait]
impl LinkFactory for MockLinkFactory {
    async fn create(&self, sink: LinkEventSink) -> Result<Arc<dyn PeerLink>, LinkError> {
        let mut net = self.network.state();
        let id = net.next_link;
        net.next_link += 1;
        net.links.insert(
            id,
            LinkSlot {
                owner: self.local_id.clone(),
                remote: sink.peer_id().to_string(),
                sink,
                partner: None,
                channel_open: false,
                closed: false,
                applied_candidates: Vec::new(),
            },
        );
        Ok(Arc::new(MockLink {
            id,
            network: self.network.clone(),
        }))
    }
}

/// In-memory link
pub struct MockLink {
    id: u64,
    network: MockNetwork,
}

impl MockLink {
    fn local_candidate(&self) -> serde_json::Value {
        serde_json::json!({
            "candidate": format!("candidate:mock-{} 1 udp 2122260223 127.0.0.1 9 typ host", self.id),
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        })
    }
}

fn parse_description(desc: &serde_json::Value, kind: &'static str) -> Result<u64, LinkError> {
    if desc.get("type").and_then(|t| t.as_str()) != Some(kind) {
        return Err(LinkError::UnexpectedDescription(desc.to_string()));
    }
    let sdp = desc
        .get("sdp")
        .and_then(|s| s.as_str())
        .ok_or(LinkError::MissingSdp(kind))?;
    sdp.strip_prefix("mock:")
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| LinkError::UnexpectedDescription(sdp.to_string()))
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self) -> Result<serde_json::Value, LinkError> {
        let net = self.network.state();
        let slot = net.links.get(&self.id).ok_or(LinkError::Closed)?;
        slot.emit(LinkEvent::ConnectionState(ConnectionState::Connecting));
        slot.emit(LinkEvent::LocalCandidate(self.local_candidate()));
        Ok(serde_json::json!({ "type": "offer", "sdp": format!("mock:{}", self.id) }))
    }

    async fn accept_offer(&self, offer: serde_json::Value) -> Result<serde_json::Value, LinkError> {
        let remote = parse_description(&offer, "offer")?;
        let mut net = self.network.state();
        if !net.links.contains_key(&remote) {
            return Err(LinkError::Setup(format!("no link mock:{}", remote)));
        }
        if let Some(slot) = net.links.get_mut(&self.id) {
            slot.partner = Some(remote);
            slot.emit(LinkEvent::LocalCandidate(self.local_candidate()));
        }
        if let Some(slot) = net.links.get_mut(&remote) {
            slot.partner = Some(self.id);
        }
        Ok(serde_json::json!({ "type": "answer", "sdp": format!("mock:{}", self.id) }))
    }

    async fn apply_answer(&self, answer: serde_json::Value) -> Result<(), LinkError> {
        let remote = parse_description(&answer, "answer")?;
        let mut net = self.network.state();
        let paired = net
            .links
            .get(&remote)
            .is_some_and(|slot| slot.partner == Some(self.id) && !slot.closed);
        if !paired {
            return Err(LinkError::Setup(format!("answer from unpaired mock:{}", remote)));
        }

        for id in [self.id, remote] {
            if let Some(slot) = net.links.get_mut(&id) {
                slot.channel_open = true;
                slot.emit(LinkEvent::ConnectionState(ConnectionState::Connected));
                slot.emit(LinkEvent::ChannelState(ChannelState::Open));
            }
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: serde_json::Value) -> Result<(), LinkError> {
        let mut net = self.network.state();
        let slot = net.links.get_mut(&self.id).ok_or(LinkError::Closed)?;
        slot.applied_candidates.push(candidate);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<(), LinkError> {
        let net = self.network.state();
        let slot = net.links.get(&self.id).ok_or(LinkError::Closed)?;
        if slot.closed || !slot.channel_open {
            return Err(LinkError::ChannelNotOpen);
        }
        let partner = slot
            .partner
            .and_then(|id| net.links.get(&id))
            .filter(|p| !p.closed && p.channel_open)
            .ok_or(LinkError::Closed)?;
        partner.emit(LinkEvent::Message(text));
        Ok(())
    }

    async fn close(&self) {
        let mut net = self.network.state();
        let Some(slot) = net.links.get_mut(&self.id) else {
            return;
        };
        if slot.closed {
            return;
        }
        slot.closed = true;
        slot.channel_open = false;
        let partner = slot.partner;

        if let Some(partner) = partner.and_then(|id| net.links.get_mut(&id)) {
            if partner.channel_open {
                partner.channel_open = false;
                partner.emit(LinkEvent::ChannelState(ChannelState::Closed));
                partner.emit(LinkEvent::ConnectionState(ConnectionState::Disconnected));
            }
        }
    }
}
