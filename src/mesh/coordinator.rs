//! Peer coordinator
//!
//! A single task owns the signaling transport and every peer session. The
//! cloneable [`PeerCoordinator`] handle queues commands to it; observers are
//! called from that task, so a handler may call back into the handle without
//! re-entering whatever the task is currently doing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::error::MeshError;
use super::observer::{Observers, Subscription};
use super::session::{PeerSession, SessionRole};
use super::signaling::{RelayInput, SignalingTransport};
use super::transport::{LinkEvent, LinkEventSink, LinkFactory, SessionEvent};
use super::types::{
    short_id, ChannelMessage, ConnectionState, EnvelopeKind, IncomingUrl, MeshConfig, NodeId,
    PeerSnapshot, RelayStatus, SignalingEnvelope,
};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

enum Command {
    Connect {
        network_id: String,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Broadcast {
        payload: String,
        reply: oneshot::Sender<usize>,
    },
    OpenCount {
        reply: oneshot::Sender<usize>,
    },
    NetworkId {
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Handle to the coordinator task
#[derive(Clone)]
pub struct PeerCoordinator {
    local_id: NodeId,
    commands: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<RelayStatus>,
    snapshot_rx: watch::Receiver<PeerSnapshot>,
    status_observers: Observers<RelayStatus>,
    peer_observers: Observers<PeerSnapshot>,
    url_observers: Observers<IncomingUrl>,
}

impl PeerCoordinator {
    /// Start the coordinator task. Must be called from within a tokio runtime.
    ///
    /// The task stops, leaving the network, once every handle is dropped.
    pub fn spawn(
        mut transport: SignalingTransport,
        links: Arc<dyn LinkFactory>,
        config: MeshConfig,
    ) -> Self {
        let local_id = transport.local_id().to_string();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(transport.status());
        let (snapshot_tx, snapshot_rx) = watch::channel(PeerSnapshot::default());

        let status_observers = Observers::new();
        let peer_observers = Observers::new();
        let url_observers = Observers::new();

        let observers = status_observers.clone();
        transport.set_status_handler(Arc::new(move |status| {
            status_tx.send_replace(status);
            observers.notify(&status);
        }));

        let actor = Actor {
            local_id: local_id.clone(),
            config,
            transport,
            links,
            network: None,
            sessions: HashMap::new(),
            next_session_id: 1,
            next_seq: 0,
            events_tx,
            snapshot_tx,
            peer_observers: peer_observers.clone(),
            url_observers: url_observers.clone(),
        };
        tokio::spawn(actor.run(commands_rx, events_rx));

        info!("Peer coordinator started as {}", short_id(&local_id));

        Self {
            local_id,
            commands: commands_tx,
            status_rx,
            snapshot_rx,
            status_observers,
            peer_observers,
            url_observers,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Join a network. An empty id selects the configured default network.
    /// Joining the current network again is a no-op; joining another one
    /// leaves the current network first.
    pub async fn connect(&self, network_id: &str) -> Result<(), MeshError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            network_id: network_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MeshError::Stopped)?
    }

    /// Leave the network and close every session. Once this returns no
    /// further observer callbacks come from the old membership.
    pub async fn disconnect(&self) -> Result<(), MeshError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disconnect { reply })?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Send `payload` as a URL message to every peer with an open channel.
    /// Returns the number of peers written to.
    pub async fn broadcast(&self, payload: &str) -> Result<usize, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Broadcast {
            payload: payload.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Number of peers whose channel is open
    pub async fn open_peers(&self) -> Result<usize, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::OpenCount { reply })?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Network of the current membership
    pub async fn network_id(&self) -> Result<Option<String>, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::NetworkId { reply })?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Latest peer list
    pub fn snapshot(&self) -> PeerSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Latest relay status
    pub fn status(&self) -> RelayStatus {
        *self.status_rx.borrow()
    }

    pub fn on_status_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RelayStatus) + Send + Sync + 'static,
    {
        self.status_observers.subscribe(handler)
    }

    pub fn on_peers_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PeerSnapshot) + Send + Sync + 'static,
    {
        self.peer_observers.subscribe(handler)
    }

    pub fn on_incoming_url<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&IncomingUrl) + Send + Sync + 'static,
    {
        self.url_observers.subscribe(handler)
    }

    fn send(&self, command: Command) -> Result<(), MeshError> {
        self.commands.send(command).map_err(|_| MeshError::Stopped)
    }
}

struct Actor {
    local_id: NodeId,
    config: MeshConfig,
    transport: SignalingTransport,
    links: Arc<dyn LinkFactory>,
    /// Network the sessions belong to. Survives a relay drop.
    network: Option<String>,
    sessions: HashMap<NodeId, PeerSession>,
    next_session_id: u64,
    next_seq: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    snapshot_tx: watch::Sender<PeerSnapshot>,
    peer_observers: Observers<PeerSnapshot>,
    url_observers: Observers<IncomingUrl>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval.max(MIN_SWEEP_INTERVAL));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                input = self.transport.recv() => self.handle_relay_input(input).await,
                Some(event) = events.recv() => self.handle_link_event(event).await,
                _ = sweep.tick() => self.reap_closed().await,
            }
        }

        debug!("Peer coordinator handles dropped, shutting down");
        self.disconnect().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { network_id, reply } => {
                let result = self.connect(network_id).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Broadcast { payload, reply } => {
                let count = self.broadcast(&payload).await;
                let _ = reply.send(count);
            }
            Command::OpenCount { reply } => {
                let count = self.sessions.values().filter(|s| s.is_open()).count();
                let _ = reply.send(count);
            }
            Command::NetworkId { reply } => {
                let _ = reply.send(self.network.clone());
            }
        }
    }

    async fn connect(&mut self, network_id: String) -> Result<(), MeshError> {
        let network_id = if network_id.is_empty() {
            self.config.default_network_id.clone()
        } else {
            network_id
        };

        if self.network.as_deref() != Some(network_id.as_str()) {
            if self.network.is_some() {
                self.disconnect().await;
            }
            self.network = Some(network_id.clone());
        }

        match self.transport.connect(&network_id).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if self.sessions.is_empty() {
                    self.network = None;
                }
                Err(e.into())
            }
        }
    }

    async fn disconnect(&mut self) {
        self.transport.disconnect();
        self.network = None;

        if self.sessions.is_empty() {
            return;
        }
        info!("Closing {} peer sessions", self.sessions.len());
        for (_, mut session) in self.sessions.drain() {
            session.close().await;
        }
        self.notify_peers();
    }

    async fn broadcast(&mut self, payload: &str) -> usize {
        let message = ChannelMessage::Url {
            payload: payload.to_string(),
        };
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode broadcast: {}", e);
                return 0;
            }
        };

        let mut sessions: Vec<&PeerSession> = self.sessions.values().collect();
        sessions.sort_by_key(|s| s.seq);

        let mut delivered = 0;
        for session in sessions {
            if session.send(&text).await {
                delivered += 1;
            }
        }
        info!("Broadcast delivered to {} peers", delivered);
        delivered
    }

    async fn handle_relay_input(&mut self, input: RelayInput) {
        match input {
            RelayInput::Frame(text) => {
                if let Some(envelope) = self.transport.accept(&text) {
                    self.handle_envelope(envelope).await;
                }
            }
            RelayInput::Closed => {
                // Established channels keep working without signaling
                self.transport.handle_closed();
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        trace!(
            "Received {} from {}",
            envelope.kind,
            short_id(&envelope.from)
        );
        match envelope.kind {
            EnvelopeKind::Joined => self.handle_joined(envelope.from).await,
            EnvelopeKind::Offer => self.handle_offer(envelope.from, envelope.payload).await,
            EnvelopeKind::Answer => self.handle_answer(envelope.from, envelope.payload).await,
            EnvelopeKind::Candidate => {
                self.handle_candidate(envelope.from, envelope.payload).await
            }
            EnvelopeKind::Left => {
                if self.remove_session(&envelope.from).await {
                    info!("Peer {} left", short_id(&envelope.from));
                }
            }
            EnvelopeKind::Error => {
                warn!(
                    "Relay reported error from {}: {}",
                    short_id(&envelope.from),
                    envelope.payload
                );
            }
        }
    }

    async fn handle_joined(&mut self, peer_id: NodeId) {
        if let Some(existing) = self.sessions.get(&peer_id) {
            match existing.connection_state() {
                ConnectionState::Failed
                | ConnectionState::Closed
                | ConnectionState::Disconnected => {
                    debug!(
                        "Peer {} rejoined, replacing {} session",
                        short_id(&peer_id),
                        existing.connection_state()
                    );
                    self.remove_session(&peer_id).await;
                }
                _ => {
                    trace!("Peer {} already known", short_id(&peer_id));
                    return;
                }
            }
        }

        info!("Peer {} joined, sending offer", short_id(&peer_id));
        let Some(mut session) = self.new_session(&peer_id, SessionRole::Initiator, None).await
        else {
            return;
        };

        match session.create_offer().await {
            Ok(offer) => {
                self.transport.send(SignalingEnvelope::offer(
                    &self.local_id,
                    &peer_id,
                    offer,
                    self.network.as_deref().unwrap_or_default(),
                ));
            }
            Err(e) => {
                warn!("Failed to create offer for {}: {}", short_id(&peer_id), e);
                session.set_connection_state(ConnectionState::Failed);
            }
        }
        self.sessions.insert(peer_id, session);
        self.notify_peers();
    }

    async fn handle_offer(&mut self, peer_id: NodeId, offer: serde_json::Value) {
        let mut seq = None;
        if let Some(existing) = self.sessions.get(&peer_id) {
            if existing.awaiting_answer() {
                if self.local_id < peer_id {
                    debug!(
                        "Offer collision with {}, keeping ours",
                        short_id(&peer_id)
                    );
                    return;
                }
                debug!(
                    "Offer collision with {}, answering theirs",
                    short_id(&peer_id)
                );
            } else {
                debug!(
                    "Peer {} sent a new offer, replacing session",
                    short_id(&peer_id)
                );
            }
            seq = Some(existing.seq);
            if let Some(mut old) = self.sessions.remove(&peer_id) {
                old.close().await;
            }
        }

        info!("Answering offer from {}", short_id(&peer_id));
        let Some(mut session) = self.new_session(&peer_id, SessionRole::Responder, seq).await
        else {
            self.notify_peers();
            return;
        };

        match session.accept_offer(offer).await {
            Ok(answer) => {
                self.transport.send(SignalingEnvelope::answer(
                    &self.local_id,
                    &peer_id,
                    answer,
                    self.network.as_deref().unwrap_or_default(),
                ));
            }
            Err(e) => {
                warn!("Failed to answer offer from {}: {}", short_id(&peer_id), e);
                session.set_connection_state(ConnectionState::Failed);
            }
        }
        self.sessions.insert(peer_id, session);
        self.notify_peers();
    }

    async fn handle_answer(&mut self, peer_id: NodeId, answer: serde_json::Value) {
        let Some(session) = self.sessions.get_mut(&peer_id) else {
            debug!("Answer from unknown peer {}", short_id(&peer_id));
            return;
        };
        if !session.awaiting_answer() {
            debug!("Unexpected answer from {}", short_id(&peer_id));
            return;
        }

        debug!("Applying answer from {}", short_id(&peer_id));
        if let Err(e) = session.apply_answer(answer).await {
            warn!("Failed to apply answer from {}: {}", short_id(&peer_id), e);
            if session.set_connection_state(ConnectionState::Failed) {
                self.notify_peers();
            }
        }
    }

    async fn handle_candidate(&mut self, peer_id: NodeId, candidate: serde_json::Value) {
        match self.sessions.get_mut(&peer_id) {
            Some(session) => session.add_remote_candidate(candidate).await,
            None => debug!("Candidate from unknown peer {}", short_id(&peer_id)),
        }
    }

    async fn handle_link_event(&mut self, event: SessionEvent) {
        let Some(session) = self.sessions.get_mut(&event.peer_id) else {
            trace!("Dropping event for removed peer {}", short_id(&event.peer_id));
            return;
        };
        if session.session_id != event.session_id {
            trace!(
                "Dropping event for stale session {} of {}",
                event.session_id,
                short_id(&event.peer_id)
            );
            return;
        }

        match event.event {
            LinkEvent::LocalCandidate(candidate) => {
                self.transport.send(SignalingEnvelope::candidate(
                    &self.local_id,
                    &event.peer_id,
                    candidate,
                    self.network.as_deref().unwrap_or_default(),
                ));
            }
            LinkEvent::ConnectionState(state) => {
                if session.set_connection_state(state) {
                    if state == ConnectionState::Connected {
                        info!(
                            "Peer {} connected in {:?}",
                            short_id(&event.peer_id),
                            session.setup_time().unwrap_or_default()
                        );
                    }
                    self.notify_peers();
                }
            }
            LinkEvent::ChannelState(state) => {
                if session.set_channel_state(state) {
                    self.notify_peers();
                }
            }
            LinkEvent::Message(text) => self.handle_message(event.peer_id, &text),
        }
    }

    fn handle_message(&self, from: NodeId, text: &str) {
        match serde_json::from_str::<ChannelMessage>(text) {
            Ok(ChannelMessage::Url { payload }) => {
                if payload.trim().is_empty() {
                    debug!("Ignoring empty url from {}", short_id(&from));
                    return;
                }
                info!("Received url from {}", short_id(&from));
                self.url_observers.notify(&IncomingUrl { from, url: payload });
            }
            Err(e) => {
                debug!("Ignoring message from {}: {}", short_id(&from), e);
            }
        }
    }

    /// Drop sessions whose link reported `closed` longer than the grace
    /// period ago
    async fn reap_closed(&mut self) {
        let Some(grace) = self.config.session_grace.filter(|g| !g.is_zero()) else {
            return;
        };
        let expired: Vec<NodeId> = self
            .sessions
            .values()
            .filter(|s| s.connection_state() == ConnectionState::Closed)
            .filter(|s| s.closed_at.is_some_and(|t| t.elapsed() >= grace))
            .map(|s| s.peer_id.clone())
            .collect();

        for peer_id in expired {
            debug!("Reaping closed session for {}", short_id(&peer_id));
            self.remove_session(&peer_id).await;
        }
    }

    async fn new_session(
        &mut self,
        peer_id: &str,
        role: SessionRole,
        seq: Option<u64>,
    ) -> Option<PeerSession> {
        let session_id = self.next_session_id;
        self.next_session_id += 1;
        let seq = seq.unwrap_or_else(|| {
            let seq = self.next_seq;
            self.next_seq += 1;
            seq
        });

        let sink = LinkEventSink::new(peer_id.to_string(), session_id, self.events_tx.clone());
        match self.links.create(sink).await {
            Ok(link) => Some(PeerSession::new(
                peer_id.to_string(),
                session_id,
                seq,
                role,
                link,
            )),
            Err(e) => {
                warn!("Failed to create link for {}: {}", short_id(peer_id), e);
                None
            }
        }
    }

    /// Close and forget one session. Returns false if the peer was unknown.
    async fn remove_session(&mut self, peer_id: &str) -> bool {
        let Some(mut session) = self.sessions.remove(peer_id) else {
            return false;
        };
        session.close().await;
        self.notify_peers();
        true
    }

    fn notify_peers(&self) {
        let mut sessions: Vec<&PeerSession> = self.sessions.values().collect();
        sessions.sort_by_key(|s| s.seq);
        let snapshot = PeerSnapshot(sessions.into_iter().map(|s| s.info()).collect());

        self.snapshot_tx.send_replace(snapshot.clone());
        self.peer_observers.notify(&snapshot);
    }
}
