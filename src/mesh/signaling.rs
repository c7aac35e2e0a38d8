//! Relay signaling transport
//!
//! Owns the single relay connection for the current network membership:
//! - stamps the network id on everything it sends
//! - filters inbound frames (wrong network, self-echo, addressed to someone else)
//! - reports relay status (connecting, connected, disconnected)
//!
//! Holds no peer state. Dropping the inbound receiver on disconnect makes
//! delivery after close impossible.

use std::future::pending;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::error::TransportError;
use super::transport::RelayConnector;
use super::types::{short_id, NodeId, RelayStatus, SignalingEnvelope};

/// Callback for relay status changes
pub type StatusHandler = Arc<dyn Fn(RelayStatus) + Send + Sync>;

/// Something read from the relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayInput {
    Frame(String),
    /// The relay closed the connection or it failed
    Closed,
}

struct ActiveRelay {
    network_id: String,
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
}

/// Signaling over one relay connection
pub struct SignalingTransport {
    local_id: NodeId,
    relay_url: String,
    connector: Arc<dyn RelayConnector>,
    active: Option<ActiveRelay>,
    status: RelayStatus,
    on_status: Option<StatusHandler>,
}

impl SignalingTransport {
    pub fn new(
        local_id: impl Into<NodeId>,
        relay_url: impl Into<String>,
        connector: Arc<dyn RelayConnector>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            relay_url: relay_url.into(),
            connector,
            active: None,
            status: RelayStatus::Disconnected,
            on_status: None,
        }
    }

    /// Set the status callback
    pub fn set_status_handler(&mut self, handler: StatusHandler) {
        self.on_status = Some(handler);
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Network of the current membership
    pub fn network_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.network_id.as_str())
    }

    pub fn status(&self) -> RelayStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    fn set_status(&mut self, status: RelayStatus) {
        if self.status == status {
            return;
        }
        debug!("Relay status: {} -> {}", self.status, status);
        self.status = status;
        if let Some(ref handler) = self.on_status {
            handler(status);
        }
    }

    /// Join `network_id` on the relay.
    ///
    /// Returns `Ok(false)` when already a member of that network. A different
    /// membership is left first.
    pub async fn connect(&mut self, network_id: &str) -> Result<bool, TransportError> {
        if let Some(ref active) = self.active {
            if active.network_id == network_id {
                debug!("Already joined network {}", network_id);
                return Ok(false);
            }
            info!(
                "Switching network {} -> {}",
                active.network_id, network_id
            );
            self.disconnect();
        }

        self.set_status(RelayStatus::Connecting);
        info!("Connecting to relay: {}", self.relay_url);

        let link = match self.connector.open(&self.relay_url).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Relay {} connection failed: {}", self.relay_url, e);
                self.set_status(RelayStatus::Disconnected);
                return Err(e);
            }
        };

        self.active = Some(ActiveRelay {
            network_id: network_id.to_string(),
            outbound: link.outbound,
            inbound: link.inbound,
        });

        info!(
            "Joined network {} as {}",
            network_id,
            short_id(&self.local_id)
        );
        self.send(SignalingEnvelope::joined(&self.local_id, network_id));
        self.set_status(RelayStatus::Connected);
        Ok(true)
    }

    /// Leave the network and close the relay connection. Safe to call when
    /// already disconnected.
    pub fn disconnect(&mut self) {
        if let Some(active) = self.active.take() {
            let left = SignalingEnvelope::left(&self.local_id, &active.network_id);
            if let Ok(text) = left.to_json() {
                let _ = active.outbound.send(text);
            }
            info!("Left network {}", active.network_id);
            // Dropping both halves closes the socket and discards unread frames
        }
        self.set_status(RelayStatus::Disconnected);
    }

    /// Fire-and-forget send. Returns false when there is no relay connection.
    pub fn send(&self, mut envelope: SignalingEnvelope) -> bool {
        let Some(ref active) = self.active else {
            trace!("Dropping {} - relay not connected", envelope.kind);
            return false;
        };
        envelope.network_id = active.network_id.clone();

        match envelope.to_json() {
            Ok(text) => {
                trace!("Sending {} to {:?}", envelope.kind, envelope.to);
                active.outbound.send(text).is_ok()
            }
            Err(e) => {
                warn!("Failed to encode {} envelope: {}", envelope.kind, e);
                false
            }
        }
    }

    /// Next relay input. Never resolves while disconnected.
    pub async fn recv(&mut self) -> RelayInput {
        match self.active.as_mut() {
            Some(active) => match active.inbound.recv().await {
                Some(text) => RelayInput::Frame(text),
                None => RelayInput::Closed,
            },
            None => pending().await,
        }
    }

    /// The relay went away on its own
    pub fn handle_closed(&mut self) {
        if let Some(active) = self.active.take() {
            warn!("Relay connection closed (network {})", active.network_id);
        }
        self.set_status(RelayStatus::Disconnected);
    }

    /// Decode and filter one inbound frame.
    ///
    /// Returns `None` for anything the coordinator must not see.
    pub fn accept(&self, text: &str) -> Option<SignalingEnvelope> {
        let network_id = self.network_id()?;

        let envelope = match SignalingEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Ignoring malformed relay frame: {}", e);
                return None;
            }
        };

        if envelope.network_id != network_id {
            trace!(
                "Ignoring {} for network {:?}",
                envelope.kind,
                envelope.network_id
            );
            return None;
        }
        if envelope.is_self_echo(&self.local_id) || envelope.is_for_other(&self.local_id) {
            return None;
        }
        if envelope.kind.is_directed() && envelope.to.is_none() {
            debug!(
                "Ignoring {} from {} without recipient",
                envelope.kind,
                short_id(&envelope.from)
            );
            return None;
        }

        Some(envelope)
    }
}
