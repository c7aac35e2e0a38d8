//! Signaling envelope, peer state and channel message types
//!
//! Wire format is compatible with the browser userscript peers:
//! - Envelope: `{"type":"offer","from":"mms-..","to":"mms-..","payload":{..},"networkId":".."}`
//! - Channel message: `{"type":"url","payload":"https://.."}`

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Public relay used for signaling when nothing else is configured
pub const DEFAULT_RELAY_URL: &str = "wss://websockets.chilvers.io/";

/// Network literal shared by every installation that doesn't pick its own
pub const DEFAULT_NETWORK_ID: &str = "miku-share-default-network";

/// Label of the reliable data channel opened by the initiator
pub const CHANNEL_LABEL: &str = "url-channel";

/// Default STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Opaque node identifier (the local device id of a peer)
pub type NodeId = String;

/// Shorten a node id for log lines. Ids come from remote peers, so cut on a
/// char boundary.
pub fn short_id(id: &str) -> &str {
    id.char_indices().nth(12).map_or(id, |(i, _)| &id[..i])
}

/// Signaling envelope type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "joined", alias = "user-joined")]
    Joined,
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "candidate", alias = "ice-candidate")]
    Candidate,
    #[serde(rename = "left", alias = "user-left")]
    Left,
    #[serde(rename = "error")]
    Error,
}

impl EnvelopeKind {
    /// Offer, answer and candidate must name a recipient
    pub fn is_directed(&self) -> bool {
        matches!(
            self,
            EnvelopeKind::Offer | EnvelopeKind::Answer | EnvelopeKind::Candidate
        )
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeKind::Joined => write!(f, "joined"),
            EnvelopeKind::Offer => write!(f, "offer"),
            EnvelopeKind::Answer => write!(f, "answer"),
            EnvelopeKind::Candidate => write!(f, "candidate"),
            EnvelopeKind::Left => write!(f, "left"),
            EnvelopeKind::Error => write!(f, "error"),
        }
    }
}

/// One signaling message as it travels over the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub from: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<NodeId>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    #[serde(rename = "networkId", default)]
    pub network_id: String,
}

impl SignalingEnvelope {
    fn new(
        kind: EnvelopeKind,
        from: &str,
        to: Option<&str>,
        payload: serde_json::Value,
        network_id: &str,
    ) -> Self {
        Self {
            kind,
            from: from.to_string(),
            to: to.map(|s| s.to_string()),
            payload,
            network_id: network_id.to_string(),
        }
    }

    pub fn joined(from: &str, network_id: &str) -> Self {
        Self::new(EnvelopeKind::Joined, from, None, serde_json::Value::Null, network_id)
    }

    pub fn left(from: &str, network_id: &str) -> Self {
        Self::new(EnvelopeKind::Left, from, None, serde_json::Value::Null, network_id)
    }

    pub fn offer(from: &str, to: &str, offer: serde_json::Value, network_id: &str) -> Self {
        Self::new(EnvelopeKind::Offer, from, Some(to), offer, network_id)
    }

    pub fn answer(from: &str, to: &str, answer: serde_json::Value, network_id: &str) -> Self {
        Self::new(EnvelopeKind::Answer, from, Some(to), answer, network_id)
    }

    pub fn candidate(from: &str, to: &str, candidate: serde_json::Value, network_id: &str) -> Self {
        Self::new(EnvelopeKind::Candidate, from, Some(to), candidate, network_id)
    }

    /// Parse a relay frame.
    ///
    /// Older peers nest `networkId` inside the payload; it is lifted to the
    /// top level when the top-level field is missing.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let mut envelope: SignalingEnvelope = serde_json::from_str(text)?;
        if envelope.network_id.is_empty() {
            if let Some(nested) = envelope
                .payload
                .get("networkId")
                .and_then(|v| v.as_str())
            {
                envelope.network_id = nested.to_string();
            }
        }
        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Sent by this node (relays echo everything back)
    pub fn is_self_echo(&self, local_id: &str) -> bool {
        self.from == local_id
    }

    /// Addressed to some other node
    pub fn is_for_other(&self, local_id: &str) -> bool {
        matches!(&self.to, Some(to) if to != local_id)
    }
}

/// State of the point-to-point connection to one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `closed` is terminal; `failed` may only be closed; `disconnected`
    /// can recover when the transport re-establishes the path.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (*self, next) {
            (a, b) if a == b => false,
            (Closed, _) => false,
            (Failed, Closed) => true,
            (Failed, _) => false,
            (_, New) => false,
            (New, _) => true,
            (Connecting, _) => true,
            (Connected, Disconnected | Failed | Closed) => true,
            (Connected, _) => false,
            (Disconnected, _) => true,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// State of the reliable message channel riding on a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

/// Status of the relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayStatus::Connecting => write!(f, "connecting"),
            RelayStatus::Connected => write!(f, "connected"),
            RelayStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// One entry in the peer list pushed to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    #[serde(rename = "peerId")]
    pub peer_id: NodeId,
    #[serde(rename = "connectionState")]
    pub connection_state: ConnectionState,
}

/// Peers in the order they were discovered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot(pub Vec<PeerInfo>);

impl PeerSnapshot {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.0.iter()
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerInfo> {
        self.0.iter().find(|p| p.peer_id == peer_id)
    }

    /// Connection state of `peer_id`, if present
    pub fn state_of(&self, peer_id: &str) -> Option<ConnectionState> {
        self.get(peer_id).map(|p| p.connection_state)
    }

    pub fn count_in(&self, state: ConnectionState) -> usize {
        self.0.iter().filter(|p| p.connection_state == state).count()
    }
}

/// Messages exchanged over the reliable channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelMessage {
    #[serde(rename = "url")]
    Url { payload: String },
}

/// A URL a peer pushed to us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingUrl {
    pub from: NodeId,
    pub url: String,
}

/// Settings for the peer mesh
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Relay endpoint for signaling
    pub relay_url: String,
    /// Network joined when `connect` is given an empty id
    pub default_network_id: String,
    /// STUN servers for candidate discovery
    pub stun_servers: Vec<String>,
    /// How long a session whose connection closed stays in the peer list.
    /// `None` keeps it until `left` or global disconnect.
    pub session_grace: Option<Duration>,
    /// Interval of the stale session sweep
    pub sweep_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            default_network_id: DEFAULT_NETWORK_ID.to_string(),
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            session_grace: Some(Duration::from_secs(30)),
            sweep_interval: Duration::from_secs(1),
        }
    }
}
