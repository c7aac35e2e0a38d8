//! WebRTC peer links
//!
//! Offer/answer payloads are browser `RTCSessionDescriptionInit` JSON and
//! candidates are `RTCIceCandidateInit` JSON, so native and userscript peers
//! can pair. Candidates trickle; nothing waits for gathering to complete.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::error::LinkError;
use super::transport::{LinkEvent, LinkEventSink, LinkFactory, PeerLink};
use super::types::{short_id, ChannelState, ConnectionState, CHANNEL_LABEL};

/// Creates WebRTC links using the given STUN servers
#[derive(Debug, Clone)]
pub struct RtcLinkFactory {
    stun_servers: Vec<String>,
}

impl RtcLinkFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    async fn create(&self, sink: LinkEventSink) -> Result<Arc<dyn PeerLink>, LinkError> {
        let link = RtcLink::new(sink, &self.stun_servers).await?;
        Ok(Arc::new(link))
    }
}

/// Event reporting that goes quiet once the link is closed
struct Reporter {
    sink: LinkEventSink,
    closed: AtomicBool,
}

impl Reporter {
    fn emit(&self, event: LinkEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            self.sink.emit(event);
        }
    }

    fn short(&self) -> String {
        short_id(self.sink.peer_id()).to_string()
    }
}

/// One RTCPeerConnection plus its `url-channel` data channel
pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    reporter: Arc<Reporter>,
}

impl RtcLink {
    pub async fn new(sink: LinkEventSink, stun_servers: &[String]) -> Result<Self, LinkError> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let link = Self {
            pc: Arc::new(api.new_peer_connection(config).await?),
            channel: Arc::new(Mutex::new(None)),
            reporter: Arc::new(Reporter {
                sink,
                closed: AtomicBool::new(false),
            }),
        };
        link.setup_handlers();
        Ok(link)
    }

    fn setup_handlers(&self) {
        let reporter = self.reporter.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let reporter = reporter.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => reporter.emit(LinkEvent::LocalCandidate(candidate_json(&init))),
                        Err(e) => debug!("[Peer {}] Bad local candidate: {}", reporter.short(), e),
                    }
                })
            }));

        let reporter = self.reporter.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let reporter = reporter.clone();
                Box::pin(async move {
                    info!("[Peer {}] Connection state: {}", reporter.short(), state);
                    if let Some(state) = map_state(state) {
                        reporter.emit(LinkEvent::ConnectionState(state));
                    }
                })
            }));

        // Responder side: the initiator opens the channel
        let reporter = self.reporter.clone();
        let channel = self.channel.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let reporter = reporter.clone();
                let channel = channel.clone();
                Box::pin(async move {
                    info!(
                        "[Peer {}] Received data channel: {}",
                        reporter.short(),
                        dc.label()
                    );
                    setup_channel_handlers(&dc, reporter);
                    *channel.lock().await = Some(dc);
                })
            }));
    }
}

fn setup_channel_handlers(dc: &Arc<RTCDataChannel>, reporter: Arc<Reporter>) {
    let on_open = reporter.clone();
    dc.on_open(Box::new(move || {
        info!("[Peer {}] Data channel open", on_open.short());
        on_open.emit(LinkEvent::ChannelState(ChannelState::Open));
        Box::pin(async {})
    }));

    let on_close = reporter.clone();
    dc.on_close(Box::new(move || {
        debug!("[Peer {}] Data channel closed", on_close.short());
        on_close.emit(LinkEvent::ChannelState(ChannelState::Closed));
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let reporter = reporter.clone();
        Box::pin(async move {
            if !msg.is_string {
                trace!("[Peer {}] Ignoring binary message", reporter.short());
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => reporter.emit(LinkEvent::Message(text)),
                Err(e) => debug!("[Peer {}] Invalid UTF-8 message: {}", reporter.short(), e),
            }
        })
    }));
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn candidate_json(init: &RTCIceCandidateInit) -> serde_json::Value {
    serde_json::json!({
        "candidate": init.candidate,
        "sdpMid": init.sdp_mid,
        "sdpMLineIndex": init.sdp_mline_index,
        "usernameFragment": init.username_fragment,
    })
}

fn description_json(desc: &RTCSessionDescription, kind: &str) -> serde_json::Value {
    serde_json::json!({
        "type": kind,
        "sdp": desc.sdp,
    })
}

/// Pull the SDP out of a description payload, checking its type if given
fn sdp_of(desc: &serde_json::Value, kind: &'static str) -> Result<String, LinkError> {
    if let Some(actual) = desc.get("type").and_then(|t| t.as_str()) {
        if actual != kind {
            return Err(LinkError::UnexpectedDescription(format!(
                "expected {}, got {}",
                kind, actual
            )));
        }
    }
    desc.get("sdp")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string())
        .ok_or(LinkError::MissingSdp(kind))
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self) -> Result<serde_json::Value, LinkError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(CHANNEL_LABEL, Some(init)).await?;
        setup_channel_handlers(&dc, self.reporter.clone());
        *self.channel.lock().await = Some(dc);

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(description_json(&offer, "offer"))
    }

    async fn accept_offer(&self, offer: serde_json::Value) -> Result<serde_json::Value, LinkError> {
        let sdp = sdp_of(&offer, "offer")?;
        self.pc
            .set_remote_description(RTCSessionDescription::offer(sdp)?)
            .await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(description_json(&answer, "answer"))
    }

    async fn apply_answer(&self, answer: serde_json::Value) -> Result<(), LinkError> {
        let sdp = sdp_of(&answer, "answer")?;
        self.pc
            .set_remote_description(RTCSessionDescription::answer(sdp)?)
            .await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: serde_json::Value) -> Result<(), LinkError> {
        let candidate_str = candidate
            .get("candidate")
            .and_then(|c| c.as_str())
            .unwrap_or("");

        // End-of-candidates marker
        if candidate_str.is_empty() {
            return Ok(());
        }

        let init = RTCIceCandidateInit {
            candidate: candidate_str.to_string(),
            sdp_mid: candidate
                .get("sdpMid")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string()),
            sdp_mline_index: candidate
                .get("sdpMLineIndex")
                .and_then(|i| i.as_u64())
                .map(|i| i as u16),
            username_fragment: candidate
                .get("usernameFragment")
                .and_then(|u| u.as_str())
                .map(|s| s.to_string()),
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn send(&self, text: String) -> Result<(), LinkError> {
        if self.reporter.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let channel = self.channel.lock().await;
        let dc = channel.as_ref().ok_or(LinkError::ChannelNotOpen)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(LinkError::ChannelNotOpen);
        }
        dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.reporter.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(dc) = self.channel.lock().await.take() {
            if let Err(e) = dc.close().await {
                debug!("[Peer {}] Error closing channel: {}", self.reporter.short(), e);
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!("[Peer {}] Error closing connection: {}", self.reporter.short(), e);
        }
    }
}
