//! One session per remote peer
//!
//! Wraps a [`PeerLink`] with the explicit connection/channel state pair,
//! validates transitions, and queues remote candidates that arrive before
//! the remote description is applied.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::error::LinkError;
use super::transport::PeerLink;
use super::types::{short_id, ChannelState, ConnectionState, NodeId, PeerInfo};

/// Who sent the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// We saw the peer's `joined` and sent the offer
    Initiator,
    /// We answered the peer's offer
    Responder,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRole::Initiator => write!(f, "initiator"),
            SessionRole::Responder => write!(f, "responder"),
        }
    }
}

/// Session with one remote peer
pub struct PeerSession {
    pub peer_id: NodeId,
    pub session_id: u64,
    /// Discovery order, used to sort snapshots
    pub seq: u64,
    pub role: SessionRole,
    pub created_at: Instant,
    pub connected_at: Option<Instant>,
    /// When the link reported `closed`
    pub closed_at: Option<Instant>,

    connection_state: ConnectionState,
    channel_state: ChannelState,
    link: Arc<dyn PeerLink>,
    remote_description_set: bool,
    pending_candidates: Vec<serde_json::Value>,
    seen_candidates: HashSet<String>,
    torn_down: bool,
}

impl PeerSession {
    pub fn new(
        peer_id: NodeId,
        session_id: u64,
        seq: u64,
        role: SessionRole,
        link: Arc<dyn PeerLink>,
    ) -> Self {
        Self {
            peer_id,
            session_id,
            seq,
            role,
            created_at: Instant::now(),
            connected_at: None,
            closed_at: None,
            connection_state: ConnectionState::New,
            channel_state: ChannelState::Connecting,
            link,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            torn_down: false,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel_state
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            connection_state: self.connection_state,
        }
    }

    /// Channel can carry messages
    pub fn is_open(&self) -> bool {
        !self.torn_down && self.channel_state == ChannelState::Open
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Our offer is still waiting for an answer
    pub fn awaiting_answer(&self) -> bool {
        self.role == SessionRole::Initiator && !self.remote_description_set
    }

    /// Time from session creation until the link first connected
    pub fn setup_time(&self) -> Option<Duration> {
        self.connected_at
            .map(|at| at.saturating_duration_since(self.created_at))
    }

    pub fn queued_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Apply a connection state reported by the link or the coordinator.
    /// Returns true if the state changed.
    pub fn set_connection_state(&mut self, next: ConnectionState) -> bool {
        if self.torn_down {
            return false;
        }
        if !self.connection_state.can_transition_to(next) {
            if self.connection_state != next {
                debug!(
                    "Peer {} ignoring transition {} -> {}",
                    short_id(&self.peer_id),
                    self.connection_state,
                    next
                );
            }
            return false;
        }

        debug!(
            "Peer {} connection: {} -> {}",
            short_id(&self.peer_id),
            self.connection_state,
            next
        );
        self.connection_state = next;
        match next {
            ConnectionState::Connected => {
                self.connected_at.get_or_insert_with(Instant::now);
            }
            ConnectionState::Failed => self.channel_state = ChannelState::Closed,
            ConnectionState::Closed => {
                self.channel_state = ChannelState::Closed;
                self.closed_at = Some(Instant::now());
            }
            _ => {}
        }
        true
    }

    /// Returns true if the state changed
    pub fn set_channel_state(&mut self, next: ChannelState) -> bool {
        if self.torn_down || self.channel_state == next || self.channel_state == ChannelState::Closed
        {
            return false;
        }
        debug!(
            "Peer {} channel: {} -> {}",
            short_id(&self.peer_id),
            self.channel_state,
            next
        );
        self.channel_state = next;
        true
    }

    /// Open the local channel and produce our offer
    pub async fn create_offer(&mut self) -> Result<serde_json::Value, LinkError> {
        self.set_connection_state(ConnectionState::Connecting);
        self.link.create_offer().await
    }

    /// Apply the remote offer and produce our answer. Queued candidates are
    /// applied afterwards.
    pub async fn accept_offer(
        &mut self,
        offer: serde_json::Value,
    ) -> Result<serde_json::Value, LinkError> {
        self.set_connection_state(ConnectionState::Connecting);
        let answer = self.link.accept_offer(offer).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;
        Ok(answer)
    }

    /// Apply the remote answer to our offer, then queued candidates
    pub async fn apply_answer(&mut self, answer: serde_json::Value) -> Result<(), LinkError> {
        if self.remote_description_set {
            debug!(
                "Peer {} duplicate answer ignored",
                short_id(&self.peer_id)
            );
            return Ok(());
        }
        self.link.apply_answer(answer).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description is
    /// set. Candidates already seen are ignored.
    pub async fn add_remote_candidate(&mut self, candidate: serde_json::Value) {
        if candidate.is_null() {
            return;
        }
        if !self.seen_candidates.insert(candidate.to_string()) {
            trace!(
                "Peer {} duplicate candidate ignored",
                short_id(&self.peer_id)
            );
            return;
        }

        if !self.remote_description_set {
            trace!(
                "Peer {} queueing early candidate ({} queued)",
                short_id(&self.peer_id),
                self.pending_candidates.len() + 1
            );
            self.pending_candidates.push(candidate);
            return;
        }

        self.apply_candidate(candidate).await;
    }

    async fn flush_candidates(&mut self) {
        let queued = std::mem::take(&mut self.pending_candidates);
        if !queued.is_empty() {
            debug!(
                "Peer {} applying {} queued candidates",
                short_id(&self.peer_id),
                queued.len()
            );
        }
        for candidate in queued {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: serde_json::Value) {
        if let Err(e) = self.link.add_candidate(candidate).await {
            warn!(
                "Peer {} failed to add candidate: {}",
                short_id(&self.peer_id),
                e
            );
        }
    }

    /// Write to the channel. True iff the channel was open and the write
    /// succeeded.
    pub async fn send(&self, text: &str) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.link.send(text.to_string()).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Peer {} send failed: {}", short_id(&self.peer_id), e);
                false
            }
        }
    }

    /// Tear down channel and connection. Idempotent; no events are reported
    /// for this session afterwards.
    pub async fn close(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.pending_candidates.clear();
        self.link.close().await;
        self.channel_state = ChannelState::Closed;
        if self.connection_state != ConnectionState::Closed {
            self.connection_state = ConnectionState::Closed;
            self.closed_at = Some(Instant::now());
        }
        debug!(
            "Peer {} {} session {} closed",
            short_id(&self.peer_id),
            self.role,
            self.session_id
        );
    }
}
