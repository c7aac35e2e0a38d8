//! Peer mesh for sharing URLs between devices on the same network id
//!
//! A public WebSocket relay carries signaling only:
//! - Envelope types: joined, offer, answer, candidate, left, error
//! - Every envelope carries `networkId`; others are ignored
//! - Payloads then travel over a WebRTC data channel labelled `url-channel`

mod coordinator;
mod error;
pub mod mock;
mod observer;
mod relay;
mod rtc;
mod session;
mod signaling;
mod transport;
mod types;

#[cfg(test)]
mod tests;

pub use coordinator::PeerCoordinator;
pub use error::{LinkError, MeshError, TransportError};
pub use observer::{Observers, Subscription};
pub use relay::WsRelayConnector;
pub use rtc::{RtcLink, RtcLinkFactory};
pub use session::{PeerSession, SessionRole};
pub use signaling::{RelayInput, SignalingTransport, StatusHandler};
pub use transport::{
    LinkEvent, LinkEventSink, LinkFactory, PeerLink, RelayConnector, RelayLink, SessionEvent,
};
pub use types::{
    short_id, ChannelMessage, ChannelState, ConnectionState, EnvelopeKind, IncomingUrl,
    MeshConfig, NodeId, PeerInfo, PeerSnapshot, RelayStatus, SignalingEnvelope, CHANNEL_LABEL,
    DEFAULT_NETWORK_ID, DEFAULT_RELAY_URL, DEFAULT_STUN_SERVER,
};
