//! Tests for wire formats, filtering and the session state machine

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::error::LinkError;
use super::mock::MockRelay;
use super::observer::Observers;
use super::session::{PeerSession, SessionRole};
use super::signaling::{RelayInput, SignalingTransport};
use super::transport::PeerLink;
use super::types::*;

#[test]
fn test_offer_envelope_format() {
    let offer = serde_json::json!({"type": "offer", "sdp": "v=0\r\n"});
    let env = SignalingEnvelope::offer("mms-aaaa", "mms-bbbb", offer, "room-1");
    let json = env.to_json().unwrap();

    assert!(json.contains("\"type\":\"offer\""));
    assert!(json.contains("\"from\":\"mms-aaaa\""));
    assert!(json.contains("\"to\":\"mms-bbbb\""));
    assert!(json.contains("\"networkId\":\"room-1\""));
    assert!(json.contains("\"sdp\""));

    let parsed = SignalingEnvelope::from_json(&json).unwrap();
    assert_eq!(parsed, env);
}

#[test]
fn test_joined_envelope_omits_recipient_and_payload() {
    let json = SignalingEnvelope::joined("mms-aaaa", "room-1").to_json().unwrap();
    assert!(json.contains("\"type\":\"joined\""));
    assert!(!json.contains("\"to\""));
    assert!(!json.contains("\"payload\""));
}

#[test]
fn test_legacy_envelope_names() {
    let joined = SignalingEnvelope::from_json(
        r#"{"type":"user-joined","from":"mms-x","payload":{"networkId":"room-1"}}"#,
    )
    .unwrap();
    assert_eq!(joined.kind, EnvelopeKind::Joined);
    assert_eq!(joined.network_id, "room-1");

    let candidate = SignalingEnvelope::from_json(
        r#"{"type":"ice-candidate","from":"mms-x","to":"mms-y","payload":{"candidate":"c"},"networkId":"room-1"}"#,
    )
    .unwrap();
    assert_eq!(candidate.kind, EnvelopeKind::Candidate);

    let left = SignalingEnvelope::from_json(
        r#"{"type":"user-left","from":"mms-x","networkId":"room-1"}"#,
    )
    .unwrap();
    assert_eq!(left.kind, EnvelopeKind::Left);

    // Output always uses the current names
    assert!(left.to_json().unwrap().contains("\"type\":\"left\""));
}

#[test]
fn test_top_level_network_id_wins() {
    let env = SignalingEnvelope::from_json(
        r#"{"type":"joined","from":"mms-x","payload":{"networkId":"nested"},"networkId":"top"}"#,
    )
    .unwrap();
    assert_eq!(env.network_id, "top");
}

#[test]
fn test_unknown_envelope_type_rejected() {
    assert!(SignalingEnvelope::from_json(r#"{"type":"hello","from":"mms-x"}"#).is_err());
    assert!(SignalingEnvelope::from_json("not json").is_err());
}

#[test]
fn test_envelope_addressing() {
    let env = SignalingEnvelope::answer("mms-a", "mms-b", serde_json::Value::Null, "n");
    assert!(env.is_self_echo("mms-a"));
    assert!(!env.is_self_echo("mms-b"));
    assert!(env.is_for_other("mms-c"));
    assert!(!env.is_for_other("mms-b"));

    let joined = SignalingEnvelope::joined("mms-a", "n");
    assert!(!joined.is_for_other("mms-c"));
    assert!(EnvelopeKind::Candidate.is_directed());
    assert!(!EnvelopeKind::Left.is_directed());
}

#[test]
fn test_connection_state_machine() {
    use ConnectionState::*;

    assert!(New.can_transition_to(Connecting));
    assert!(Connecting.can_transition_to(Connected));
    assert!(Connecting.can_transition_to(Failed));
    assert!(Connected.can_transition_to(Disconnected));
    assert!(Disconnected.can_transition_to(Connected));
    assert!(Failed.can_transition_to(Closed));

    assert!(!Connected.can_transition_to(Connecting));
    assert!(!Failed.can_transition_to(Connected));
    assert!(!Connecting.can_transition_to(New));
    assert!(!Connected.can_transition_to(Connected));
    for next in [New, Connecting, Connected, Disconnected, Failed] {
        assert!(!Closed.can_transition_to(next));
    }
}

#[test]
fn test_channel_message_format() {
    let msg = ChannelMessage::Url {
        payload: "https://example.com".to_string(),
    };
    let json = serde_json::to_string(&msg).unwrap();
    assert_eq!(json, r#"{"type":"url","payload":"https://example.com"}"#);

    assert!(serde_json::from_str::<ChannelMessage>(r#"{"type":"ping"}"#).is_err());
}

#[test]
fn test_snapshot_format() {
    let snapshot = PeerSnapshot(vec![PeerInfo {
        peer_id: "mms-b".to_string(),
        connection_state: ConnectionState::Connecting,
    }]);
    let json = serde_json::to_string(&snapshot).unwrap();
    assert_eq!(json, r#"[{"peerId":"mms-b","connectionState":"connecting"}]"#);
    assert_eq!(snapshot.state_of("mms-b"), Some(ConnectionState::Connecting));
    assert_eq!(snapshot.count_in(ConnectionState::Connected), 0);
}

#[test]
fn test_short_id() {
    assert_eq!(short_id("mms-abcdefgh1234"), "mms-abcdefgh");
    assert_eq!(short_id("mms-a"), "mms-a");
}

#[test]
fn test_short_id_multibyte() {
    let id = format!("a{}", "é".repeat(10));
    assert_eq!(short_id(&id), id);

    let long = "é".repeat(20);
    assert_eq!(short_id(&long), "é".repeat(12));
    assert_eq!(short_id("日本語のピアID-123456"), "日本語のピアID-12");
}

#[test]
fn test_observers_subscribe_and_drop() {
    let observers: Observers<u32> = Observers::new();
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = seen.clone();
    let sub = observers.subscribe(move |v| {
        counter.fetch_add(*v as usize, Ordering::SeqCst);
    });
    observers.notify(&2);
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    drop(sub);
    observers.notify(&5);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert!(observers.is_empty());
}

#[test]
fn test_observers_unsubscribe_and_detach() {
    let observers: Observers<()> = Observers::new();
    let seen = Arc::new(AtomicUsize::new(0));

    let c1 = seen.clone();
    let first = observers.subscribe(move |_| {
        c1.fetch_add(1, Ordering::SeqCst);
    });
    let c2 = seen.clone();
    observers
        .subscribe(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        })
        .detach();
    assert_eq!(observers.len(), 2);

    first.unsubscribe();
    observers.notify(&());
    assert_eq!(seen.load(Ordering::SeqCst), 10);
}

#[test]
fn test_observer_may_subscribe_during_notify() {
    let observers: Observers<()> = Observers::new();
    let inner = observers.clone();
    observers
        .subscribe(move |_| {
            inner.subscribe(|_| {}).detach();
        })
        .detach();

    observers.notify(&());
    assert_eq!(observers.len(), 2);
}

// Signaling transport over the in-memory relay

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

fn recording_transport(
    local_id: &str,
    relay: &MockRelay,
) -> (SignalingTransport, Arc<Mutex<Vec<RelayStatus>>>) {
    let mut transport = SignalingTransport::new(local_id, "mock://relay", Arc::new(relay.clone()));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let log = statuses.clone();
    transport.set_status_handler(Arc::new(move |s| log.lock().unwrap().push(s)));
    (transport, statuses)
}

#[tokio::test]
async fn test_transport_connect_sends_joined() {
    let relay = MockRelay::new();
    let (mut transport, statuses) = recording_transport("mms-a", &relay);

    assert!(transport.connect("room-1").await.unwrap());
    assert_eq!(transport.network_id(), Some("room-1"));
    assert_eq!(
        *statuses.lock().unwrap(),
        vec![RelayStatus::Connecting, RelayStatus::Connected]
    );

    // Same network again is a no-op
    assert!(!transport.connect("room-1").await.unwrap());
    assert_eq!(statuses.lock().unwrap().len(), 2);

    wait_until(|| !relay.frames().is_empty()).await;
    let joined = SignalingEnvelope::from_json(&relay.frames()[0]).unwrap();
    assert_eq!(joined.kind, EnvelopeKind::Joined);
    assert_eq!(joined.from, "mms-a");
    assert_eq!(joined.network_id, "room-1");
}

#[tokio::test]
async fn test_transport_drops_self_echo() {
    let relay = MockRelay::new();
    let (mut transport, _) = recording_transport("mms-a", &relay);
    transport.connect("room-1").await.unwrap();

    // The relay echoes our own joined back
    match transport.recv().await {
        RelayInput::Frame(text) => assert!(transport.accept(&text).is_none()),
        RelayInput::Closed => panic!("relay closed"),
    }
}

#[tokio::test]
async fn test_transport_filter() {
    let relay = MockRelay::new();
    let (mut transport, _) = recording_transport("mms-a", &relay);
    transport.connect("room-1").await.unwrap();

    let offer = |to: &str, net: &str| {
        SignalingEnvelope::offer("mms-b", to, serde_json::json!({"sdp": "x"}), net)
            .to_json()
            .unwrap()
    };

    assert!(transport.accept(&offer("mms-a", "room-1")).is_some());
    assert!(transport.accept(&offer("mms-c", "room-1")).is_none());
    assert!(transport.accept(&offer("mms-a", "room-2")).is_none());
    assert!(transport.accept("{\"type\":\"offer\"").is_none());
    assert!(transport
        .accept(r#"{"type":"offer","from":"mms-b","networkId":"room-1"}"#)
        .is_none());
    assert!(transport
        .accept(&SignalingEnvelope::joined("mms-b", "room-1").to_json().unwrap())
        .is_some());
}

#[tokio::test]
async fn test_transport_disconnect_sends_left_once() {
    let relay = MockRelay::new();
    let (mut transport, statuses) = recording_transport("mms-a", &relay);
    transport.connect("room-1").await.unwrap();

    transport.disconnect();
    transport.disconnect();
    assert!(!transport.is_connected());
    assert_eq!(
        *statuses.lock().unwrap(),
        vec![
            RelayStatus::Connecting,
            RelayStatus::Connected,
            RelayStatus::Disconnected
        ]
    );
    assert!(!transport.send(SignalingEnvelope::joined("mms-a", "room-1")));

    wait_until(|| relay.frames().len() == 2).await;
    wait_until(|| relay.client_count() == 0).await;
    let left = SignalingEnvelope::from_json(&relay.frames()[1]).unwrap();
    assert_eq!(left.kind, EnvelopeKind::Left);
    assert_eq!(left.network_id, "room-1");
}

#[tokio::test]
async fn test_transport_switches_network() {
    let relay = MockRelay::new();
    let (mut transport, _) = recording_transport("mms-a", &relay);
    transport.connect("room-1").await.unwrap();
    assert!(transport.connect("room-2").await.unwrap());
    assert_eq!(transport.network_id(), Some("room-2"));

    wait_until(|| relay.frames().len() == 3).await;
    let kinds: Vec<(EnvelopeKind, String)> = relay
        .frames()
        .iter()
        .map(|f| SignalingEnvelope::from_json(f).unwrap())
        .map(|e| (e.kind, e.network_id))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (EnvelopeKind::Joined, "room-1".to_string()),
            (EnvelopeKind::Left, "room-1".to_string()),
            (EnvelopeKind::Joined, "room-2".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_transport_connect_failure() {
    let relay = MockRelay::new();
    relay.set_unreachable(true);
    let (mut transport, statuses) = recording_transport("mms-a", &relay);

    assert!(transport.connect("room-1").await.is_err());
    assert!(!transport.is_connected());
    assert_eq!(
        *statuses.lock().unwrap(),
        vec![RelayStatus::Connecting, RelayStatus::Disconnected]
    );
}

#[tokio::test]
async fn test_transport_remote_close() {
    let relay = MockRelay::new();
    let (mut transport, statuses) = recording_transport("mms-a", &relay);
    transport.connect("room-1").await.unwrap();

    relay.drop_all();
    loop {
        if transport.recv().await == RelayInput::Closed {
            break;
        }
    }
    transport.handle_closed();
    transport.disconnect();

    let disconnects = statuses
        .lock()
        .unwrap()
        .iter()
        .filter(|s| **s == RelayStatus::Disconnected)
        .count();
    assert_eq!(disconnects, 1);
}

// Peer session

#[derive(Default)]
struct RecordingLink {
    candidates: Mutex<Vec<serde_json::Value>>,
    sent: Mutex<Vec<String>>,
    closes: AtomicUsize,
    fail_send: AtomicBool,
}

#[async_trait]
impl PeerLink for RecordingLink {
    async fn create_offer(&self) -> Result<serde_json::Value, LinkError> {
        Ok(serde_json::json!({"type": "offer", "sdp": "o"}))
    }

    async fn accept_offer(&self, _offer: serde_json::Value) -> Result<serde_json::Value, LinkError> {
        Ok(serde_json::json!({"type": "answer", "sdp": "a"}))
    }

    async fn apply_answer(&self, _answer: serde_json::Value) -> Result<(), LinkError> {
        Ok(())
    }

    async fn add_candidate(&self, candidate: serde_json::Value) -> Result<(), LinkError> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<(), LinkError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(LinkError::ChannelNotOpen);
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn session_with(link: &Arc<RecordingLink>, role: SessionRole) -> PeerSession {
    PeerSession::new("mms-b".to_string(), 1, 0, role, link.clone())
}

#[tokio::test]
async fn test_session_queues_early_candidates() {
    let link = Arc::new(RecordingLink::default());
    let mut session = session_with(&link, SessionRole::Initiator);
    session.create_offer().await.unwrap();
    assert!(session.awaiting_answer());

    let c1 = serde_json::json!({"candidate": "candidate:1", "sdpMid": "0"});
    let c2 = serde_json::json!({"candidate": "candidate:2", "sdpMid": "0"});
    session.add_remote_candidate(c1.clone()).await;
    session.add_remote_candidate(c2.clone()).await;
    assert_eq!(session.queued_candidates(), 2);
    assert!(link.candidates.lock().unwrap().is_empty());

    session
        .apply_answer(serde_json::json!({"type": "answer", "sdp": "a"}))
        .await
        .unwrap();
    assert!(!session.awaiting_answer());
    assert_eq!(session.queued_candidates(), 0);
    assert_eq!(*link.candidates.lock().unwrap(), vec![c1, c2]);
}

#[tokio::test]
async fn test_session_ignores_duplicate_candidates() {
    let link = Arc::new(RecordingLink::default());
    let mut session = session_with(&link, SessionRole::Responder);
    session
        .accept_offer(serde_json::json!({"type": "offer", "sdp": "o"}))
        .await
        .unwrap();

    let candidate = serde_json::json!({"candidate": "candidate:1", "sdpMid": "0"});
    session.add_remote_candidate(candidate.clone()).await;
    session.add_remote_candidate(candidate).await;
    assert_eq!(link.candidates.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_session_send_requires_open_channel() {
    let link = Arc::new(RecordingLink::default());
    let mut session = session_with(&link, SessionRole::Initiator);

    assert!(!session.send("x").await);
    assert!(session.set_channel_state(ChannelState::Open));
    assert!(session.send("x").await);

    link.fail_send.store(true, Ordering::SeqCst);
    assert!(!session.send("y").await);
    assert_eq!(*link.sent.lock().unwrap(), vec!["x".to_string()]);
}

#[tokio::test]
async fn test_session_close_is_final() {
    let link = Arc::new(RecordingLink::default());
    let mut session = session_with(&link, SessionRole::Initiator);
    session.set_channel_state(ChannelState::Open);
    session.set_connection_state(ConnectionState::Connected);

    session.close().await;
    session.close().await;
    assert_eq!(link.closes.load(Ordering::SeqCst), 1);
    assert_eq!(session.connection_state(), ConnectionState::Closed);
    assert_eq!(session.channel_state(), ChannelState::Closed);
    assert!(!session.send("x").await);
    assert!(!session.set_connection_state(ConnectionState::Connected));
    assert!(!session.set_channel_state(ChannelState::Open));
}

#[tokio::test]
async fn test_session_rejects_invalid_transitions() {
    let link = Arc::new(RecordingLink::default());
    let mut session = session_with(&link, SessionRole::Initiator);

    assert!(session.set_connection_state(ConnectionState::Connecting));
    assert!(session.set_connection_state(ConnectionState::Failed));
    assert!(!session.set_connection_state(ConnectionState::Connected));
    assert_eq!(session.info().connection_state, ConnectionState::Failed);
}

#[tokio::test]
async fn test_session_setup_time_set_on_first_connect() {
    let link = Arc::new(RecordingLink::default());
    let mut session = session_with(&link, SessionRole::Responder);
    assert_eq!(session.setup_time(), None);

    session.set_connection_state(ConnectionState::Connecting);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(session.set_connection_state(ConnectionState::Connected));
    let setup = session.setup_time().unwrap();
    assert!(setup >= Duration::from_millis(5));

    // Reconnecting after a drop keeps the first connect time
    session.set_connection_state(ConnectionState::Disconnected);
    session.set_connection_state(ConnectionState::Connected);
    assert_eq!(session.setup_time(), Some(setup));
}

#[tokio::test]
async fn test_link_event_sink_tags_session() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = super::transport::LinkEventSink::new("mms-b".to_string(), 7, tx);
    sink.emit(super::transport::LinkEvent::Message("hi".to_string()));

    let event = rx.recv().await.unwrap();
    assert_eq!(event.peer_id, "mms-b");
    assert_eq!(event.session_id, 7);
}
