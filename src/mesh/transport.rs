//! Transport seams
//!
//! Defines traits for the relay socket and for point-to-point peer links so
//! the signaling and coordination logic runs unchanged over real WebSocket +
//! WebRTC or over the in-memory doubles in `mock`.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::error::{LinkError, TransportError};
use super::types::{ChannelState, ConnectionState, NodeId};

/// An open relay connection: text frames out, text frames in.
///
/// The inbound receiver yields `None` once the relay closed the connection.
/// Dropping `outbound` asks the connector to close the socket.
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens relay connections
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Open a connection to `url`, resolving once the transport is open
    async fn open(&self, url: &str) -> Result<RelayLink, TransportError>;
}

/// Event reported by a peer link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A local network-path candidate to send to the remote peer
    LocalCandidate(serde_json::Value),
    ConnectionState(ConnectionState),
    ChannelState(ChannelState),
    /// A text message received on the reliable channel
    Message(String),
}

/// Link event tagged with the session it belongs to
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub peer_id: NodeId,
    pub session_id: u64,
    pub event: LinkEvent,
}

/// Where a link reports its events
#[derive(Clone)]
pub struct LinkEventSink {
    peer_id: NodeId,
    session_id: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl LinkEventSink {
    pub fn new(peer_id: NodeId, session_id: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            peer_id,
            session_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Report an event. Silently dropped once the coordinator is gone.
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send(SessionEvent {
            peer_id: self.peer_id.clone(),
            session_id: self.session_id,
            event,
        });
    }
}

/// One point-to-point connection plus its reliable ordered message channel
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Open the local message channel and produce a session offer
    async fn create_offer(&self) -> Result<serde_json::Value, LinkError>;

    /// Apply a remote offer and produce the answer
    async fn accept_offer(&self, offer: serde_json::Value) -> Result<serde_json::Value, LinkError>;

    /// Apply the remote answer to our offer
    async fn apply_answer(&self, answer: serde_json::Value) -> Result<(), LinkError>;

    /// Apply one remote candidate
    async fn add_candidate(&self, candidate: serde_json::Value) -> Result<(), LinkError>;

    /// Write a text message to the channel
    async fn send(&self, text: String) -> Result<(), LinkError>;

    /// Tear down channel and connection. No events are emitted afterwards.
    async fn close(&self);
}

/// Creates peer links
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create(&self, sink: LinkEventSink) -> Result<Arc<dyn PeerLink>, LinkError>;
}

#[async_trait]
impl<T: LinkFactory + ?Sized> LinkFactory for Arc<T> {
    async fn create(&self, sink: LinkEventSink) -> Result<Arc<dyn PeerLink>, LinkError> {
        (**self).create(sink).await
    }
}

#[async_trait]
impl<T: RelayConnector + ?Sized> RelayConnector for Arc<T> {
    async fn open(&self, url: &str) -> Result<RelayLink, TransportError> {
        (**self).open(url).await
    }
}
