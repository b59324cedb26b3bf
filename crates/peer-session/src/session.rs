//! Session actor shared by hub members and outbound sessions.
//!
//! Every input of a session (relay messages, primitive callbacks, channel
//! events, commands from handles) is processed to completion by a single
//! task before the next one is looked at. Handles read the channel map and
//! negotiation state through [`SessionShared`]; only the actor writes them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use relay_bus::{Identity, MessageKind, Relay, RelayMessage};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use crate::channel::{ChannelOwner, SubChannel};
use crate::config::{DataChannelConfig, SessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::events::{ChannelEvent, EventFilter, EventSink, EventStream, SessionEvent};
use crate::negotiation::{NegotiationState, Negotiator, Politeness, Signaler};
use crate::rtc::{
    ConnectionState, DataChannelTransport, IceCandidate, OfferOptions, PeerConnection, PeerEvent,
    RtcBackend, SessionDescription,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Hub side; sends the initial offer and wins collisions.
    Member,
    /// Connecting side; answers the hub and yields on collisions.
    Outbound,
}

impl Role {
    fn politeness(self) -> Politeness {
        match self {
            Role::Member => Politeness::Impolite,
            Role::Outbound => Politeness::Polite,
        }
    }
}

pub(crate) enum Command<B: RtcBackend> {
    Start,
    CreateDataChannel {
        label: String,
        config: DataChannelConfig,
        reply: Option<oneshot::Sender<SessionResult<()>>>,
    },
    AddTrack {
        track: B::LocalTrack,
        streams: Vec<String>,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

pub(crate) enum Input<B: RtcBackend> {
    Relay(RelayMessage),
    Channel { generation: u64, event: ChannelEvent },
    Command(Command<B>),
}

/// Runs once, right before the session's `Close` event is emitted.
pub(crate) type TerminationHook = Box<dyn FnOnce() + Send>;

type PeerEvents<B> = mpsc::UnboundedReceiver<PeerEvent<B>>;

pub(crate) struct SessionShared<B: RtcBackend> {
    remote: Identity,
    channels: RwLock<HashMap<String, Arc<SubChannel<B>>>>,
    state: RwLock<NegotiationState>,
    connected: AtomicBool,
    sink: EventSink<B::RemoteTrack>,
    inputs: mpsc::UnboundedSender<Input<B>>,
}

impl<B: RtcBackend> SessionShared<B> {
    pub(crate) fn remote(&self) -> &Identity {
        &self.remote
    }

    pub(crate) fn channel(&self, label: &str) -> Option<Arc<SubChannel<B>>> {
        self.channels.read().get(label).cloned()
    }

    pub(crate) fn channel_labels(&self) -> Vec<String> {
        let mut labels: Vec<_> = self.channels.read().keys().cloned().collect();
        labels.sort();
        labels
    }

    pub(crate) fn negotiation_state(&self) -> NegotiationState {
        *self.state.read()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe(&self, filter: EventFilter) -> EventStream<B::RemoteTrack> {
        self.sink.subscribe(filter)
    }

    pub(crate) fn enqueue(&self, input: Input<B>) -> SessionResult<()> {
        self.inputs.send(input).map_err(|_| SessionError::Closed)
    }

    pub(crate) fn command(&self, command: Command<B>) -> SessionResult<()> {
        self.enqueue(Input::Command(command))
    }

    pub(crate) async fn create_data_channel(
        &self,
        label: String,
        config: DataChannelConfig,
    ) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::CreateDataChannel {
            label,
            config,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub(crate) async fn add_track(
        &self,
        track: B::LocalTrack,
        streams: Vec<String>,
    ) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::AddTrack {
            track,
            streams,
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub(crate) async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

pub(crate) struct SessionSeed<B: RtcBackend> {
    pub(crate) role: Role,
    pub(crate) backend: Arc<B>,
    pub(crate) relay: Arc<dyn Relay>,
    pub(crate) remote: Identity,
    pub(crate) config: SessionConfig,
    pub(crate) upstream: Option<broadcast::Sender<SessionEvent<B::RemoteTrack>>>,
    pub(crate) on_terminated: Option<TerminationHook>,
    pub(crate) peer: Option<(Arc<B::Peer>, PeerEvents<B>)>,
}

pub(crate) fn spawn<B: RtcBackend>(seed: SessionSeed<B>) -> (Arc<SessionShared<B>>, JoinHandle<()>) {
    let (inputs, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(SessionShared {
        remote: seed.remote.clone(),
        channels: RwLock::new(HashMap::new()),
        state: RwLock::new(NegotiationState::Idle),
        connected: AtomicBool::new(false),
        sink: EventSink::new(seed.config.event_capacity, seed.upstream),
        inputs,
    });
    let span = info_span!(
        parent: &seed.config.span,
        "session",
        remote = %seed.remote,
        role = ?seed.role
    );
    let mut driver = SessionDriver {
        role: seed.role,
        backend: seed.backend,
        shared: shared.clone(),
        signaler: Signaler::new(seed.relay, seed.remote),
        negotiator: Negotiator::new(seed.role.politeness()),
        config: seed.config,
        peer: None,
        generation: 0,
        deadline: None,
        on_terminated: seed.on_terminated,
        finished: false,
        span: span.clone(),
    };
    if let Some((peer, events)) = seed.peer {
        driver.install_peer(peer, events, None);
    }
    let handle = tokio::spawn(driver.run(rx).instrument(span));
    (shared, handle)
}

struct ActivePeer<B: RtcBackend> {
    peer: Arc<B::Peer>,
    events: PeerEvents<B>,
    /// Outbound only: SDP of the hub offer that created this peer.
    offer_sdp: Option<String>,
}

struct SessionDriver<B: RtcBackend> {
    role: Role,
    backend: Arc<B>,
    shared: Arc<SessionShared<B>>,
    config: SessionConfig,
    signaler: Signaler,
    negotiator: Negotiator,
    peer: Option<ActivePeer<B>>,
    generation: u64,
    deadline: Option<Instant>,
    on_terminated: Option<TerminationHook>,
    finished: bool,
    span: Span,
}

impl<B: RtcBackend> SessionDriver<B> {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input<B>>) {
        debug!(target = "peer_session", "session driver started");
        while !self.finished {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                input = inputs.recv() => match input {
                    Some(input) => self.handle_input(input).await,
                    None => break,
                },
                event = next_peer_event(&mut self.peer) => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => self.teardown("primitive event stream ended").await,
                },
                _ = expire(deadline) => self.handshake_expired().await,
            }
        }
        debug!(target = "peer_session", "session driver stopped");
    }

    fn install_peer(&mut self, peer: Arc<B::Peer>, events: PeerEvents<B>, offer_sdp: Option<String>) {
        self.generation += 1;
        self.peer = Some(ActivePeer {
            peer,
            events,
            offer_sdp,
        });
        self.negotiator = Negotiator::new(self.role.politeness());
        self.deadline = self
            .config
            .handshake_timeout
            .map(|timeout| Instant::now() + timeout);
        self.shared.connected.store(false, Ordering::Release);
        self.publish_state();
    }

    fn current_peer(&self) -> Option<Arc<B::Peer>> {
        self.peer.as_ref().map(|active| active.peer.clone())
    }

    fn emit(&self, event: SessionEvent<B::RemoteTrack>) {
        self.shared.sink.emit(event);
    }

    fn publish_state(&self) {
        let state = match &self.peer {
            Some(active) => self.negotiator.state(active.peer.signaling_state()),
            None => NegotiationState::Closed,
        };
        *self.shared.state.write() = state;
    }

    async fn handle_input(&mut self, input: Input<B>) {
        match input {
            Input::Relay(message) => self.handle_relay(message).await,
            Input::Channel { generation, event } => self.handle_channel_event(generation, event),
            Input::Command(command) => self.handle_command(command).await,
        }
    }

    async fn handle_relay(&mut self, message: RelayMessage) {
        let kind = message.kind;
        match kind {
            MessageKind::Offer if self.role == Role::Outbound => self.handle_offer(message).await,
            MessageKind::Answer | MessageKind::Description => {
                let Some(peer) = self.current_peer() else {
                    debug!(target = "peer_session", %kind, "no session; dropping description");
                    return;
                };
                match message.payload::<SessionDescription>() {
                    Ok(description) => {
                        self.apply_remote(peer, description, MessageKind::Description)
                            .await
                    }
                    Err(err) => warn!(target = "peer_session", error = %err, "bad description"),
                }
            }
            MessageKind::Renegotiate => {
                let Some(peer) = self.current_peer() else {
                    debug!(target = "peer_session", "no session; dropping turn message");
                    return;
                };
                if let Err(err) = self.negotiator.renegotiate::<B>(&peer, &self.signaler).await {
                    warn!(target = "peer_session", error = %err, "turn handling failed");
                }
                self.publish_state();
            }
            MessageKind::Candidate => {
                if !message.has_payload() {
                    trace!(target = "peer_session", "remote finished gathering candidates");
                    return;
                }
                let Some(peer) = self.current_peer() else {
                    debug!(target = "peer_session", "no session; dropping candidate");
                    return;
                };
                match message.payload::<IceCandidate>() {
                    Ok(candidate) => {
                        self.negotiator
                            .remote_candidate::<B>(&peer, candidate)
                            .await
                    }
                    Err(err) => warn!(target = "peer_session", error = %err, "bad candidate"),
                }
            }
            other => debug!(target = "peer_session", kind = %other, "ignoring relay message"),
        }
    }

    async fn handle_offer(&mut self, message: RelayMessage) {
        let description = match message.payload::<SessionDescription>() {
            Ok(description) => description,
            Err(err) => {
                warn!(target = "peer_session", error = %err, "bad offer");
                return;
            }
        };
        if let Some(active) = &self.peer {
            if active.offer_sdp.as_deref() == Some(description.sdp.as_str()) {
                debug!(target = "peer_session", "duplicate offer");
                return;
            }
            info!(target = "peer_session", "hub sent a new offer; replacing session");
            self.teardown("replaced by a new offer").await;
        }

        let (tx, events) = mpsc::unbounded_channel();
        let peer = match self.backend.create_peer(&self.config.rtc, tx).await {
            Ok(peer) => peer,
            Err(err) => {
                warn!(target = "peer_session", error = %err, "failed to create peer");
                return;
            }
        };
        self.install_peer(peer.clone(), events, Some(description.sdp.clone()));
        self.apply_remote(peer, description, MessageKind::Answer).await;
    }

    async fn apply_remote(
        &mut self,
        peer: Arc<B::Peer>,
        description: SessionDescription,
        answer_kind: MessageKind,
    ) {
        let result = self
            .negotiator
            .remote_description::<B>(&peer, description, answer_kind, &self.signaler)
            .await;
        match result {
            Ok(outcome) => debug!(target = "peer_session", ?outcome, "remote description handled"),
            Err(err) => warn!(target = "peer_session", error = %err, "remote description failed"),
        }
        self.publish_state();
    }

    async fn handle_command(&mut self, command: Command<B>) {
        match command {
            Command::Start => {
                let Some(peer) = self.current_peer() else {
                    return;
                };
                info!(target = "peer_session", "sending initial offer");
                let result = self
                    .negotiator
                    .offer::<B>(&peer, OfferOptions::initial(), MessageKind::Offer, &self.signaler)
                    .await;
                if let Err(err) = result {
                    warn!(target = "peer_session", error = %err, "initial offer failed");
                    self.teardown("initial offer failed").await;
                    return;
                }
                self.publish_state();
            }
            Command::CreateDataChannel {
                label,
                config,
                reply,
            } => {
                let result = self.create_data_channel(label, config).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(err) = result {
                            debug!(target = "peer_session", error = %err, "data channel not created");
                        }
                    }
                }
            }
            Command::AddTrack {
                track,
                streams,
                reply,
            } => {
                let result = match self.current_peer() {
                    Some(peer) => peer.add_track(track, &streams).await.map_err(Into::into),
                    None => Err(SessionError::NoSession),
                };
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                self.teardown("closed locally").await;
                let _ = reply.send(());
            }
            Command::Shutdown => {
                self.teardown("shut down").await;
                self.finished = true;
            }
        }
    }

    async fn create_data_channel(
        &mut self,
        label: String,
        config: DataChannelConfig,
    ) -> SessionResult<()> {
        if self.shared.channels.read().contains_key(&label) {
            warn!(target = "peer_session", %label, "data channel already exists");
            return Err(SessionError::ChannelExists(label));
        }
        let peer = self.current_peer().ok_or(SessionError::NoSession)?;
        let transport = peer.create_data_channel(&label, &config).await?;
        if !self.adopt_channel(transport) {
            return Err(SessionError::ChannelExists(label));
        }
        debug!(target = "peer_session", %label, "data channel created");
        Ok(())
    }

    /// Wraps `transport` and records it; false when the label is taken.
    fn adopt_channel(&self, transport: Arc<B::Channel>) -> bool {
        let label = transport.label().to_string();
        let mut channels = self.shared.channels.write();
        if channels.contains_key(&label) {
            warn!(target = "peer_session", %label, "duplicate data channel dropped");
            return false;
        }
        let channel = SubChannel::wrap(transport, self.channel_owner(), &self.span);
        channels.insert(label, channel);
        true
    }

    fn channel_owner(&self) -> ChannelOwner {
        let inputs = self.shared.inputs.clone();
        let generation = self.generation;
        Arc::new(move |event| {
            let _ = inputs.send(Input::Channel { generation, event });
        })
    }

    fn handle_channel_event(&mut self, generation: u64, event: ChannelEvent) {
        if generation != self.generation {
            trace!(target = "peer_session", "stale channel event");
            return;
        }
        let label = event.label().to_string();
        let known = match &event {
            ChannelEvent::Close { .. } => self.shared.channels.write().remove(&label).is_some(),
            _ => self.shared.channels.read().contains_key(&label),
        };
        if !known {
            trace!(target = "peer_session", %label, "event for retired channel");
            return;
        }
        self.emit(SessionEvent::Channel {
            remote: self.shared.remote.clone(),
            event,
        });
    }

    async fn handle_peer_event(&mut self, event: PeerEvent<B>) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Err(err) = self.signaler.send(MessageKind::Candidate, &candidate) {
                    warn!(target = "peer_session", error = %err, "failed to send candidate");
                }
            }
            PeerEvent::ConnectionState(state) => self.connection_changed(state).await,
            PeerEvent::Track { track, streams } => {
                info!(target = "peer_session", ?track, "remote track");
                self.emit(SessionEvent::Track {
                    remote: self.shared.remote.clone(),
                    track,
                    streams,
                });
            }
            PeerEvent::DataChannel(transport) => {
                let label = transport.label().to_string();
                if self.adopt_channel(transport) {
                    debug!(target = "peer_session", %label, "remote data channel");
                }
            }
            PeerEvent::NegotiationNeeded => {
                let Some(peer) = self.current_peer() else {
                    return;
                };
                let result = self
                    .negotiator
                    .negotiation_needed::<B>(&peer, &self.signaler)
                    .await;
                if let Err(err) = result {
                    warn!(target = "peer_session", error = %err, "renegotiation failed");
                }
                self.publish_state();
            }
        }
    }

    async fn connection_changed(&mut self, state: ConnectionState) {
        debug!(target = "peer_session", ?state, "connection state changed");
        if state == ConnectionState::Connected {
            if !self.shared.connected.swap(true, Ordering::AcqRel) {
                self.deadline = None;
                info!(target = "peer_session", "session open");
                self.emit(SessionEvent::Open {
                    remote: self.shared.remote.clone(),
                });
            }
        } else if state.is_terminal() {
            self.teardown("connection ended").await;
        }
    }

    async fn handshake_expired(&mut self) {
        warn!(
            target = "peer_session",
            timeout_ms = self.config.handshake_timeout.map(|t| t.as_millis() as u64),
            "handshake timed out"
        );
        self.teardown("handshake timed out").await;
    }

    /// Closes the current peer and reports the session closed. Hub members
    /// stop afterwards; outbound sessions wait for the next offer.
    async fn teardown(&mut self, reason: &str) {
        if self.role == Role::Member {
            self.finished = true;
        }
        let Some(active) = self.peer.take() else {
            return;
        };
        info!(target = "peer_session", reason, "closing session");
        self.deadline = None;

        let channels: Vec<_> = self.shared.channels.write().drain().collect();
        if let Err(err) = active.peer.close().await {
            debug!(target = "peer_session", error = %err, "primitive close failed");
        }
        for (label, channel) in channels {
            channel.terminate();
            self.emit(SessionEvent::Channel {
                remote: self.shared.remote.clone(),
                event: ChannelEvent::Close { label },
            });
        }

        self.shared.connected.store(false, Ordering::Release);
        self.publish_state();
        if let Some(hook) = self.on_terminated.take() {
            hook();
        }
        self.emit(SessionEvent::Close {
            remote: self.shared.remote.clone(),
        });
    }
}

async fn next_peer_event<B: RtcBackend>(peer: &mut Option<ActivePeer<B>>) -> Option<PeerEvent<B>> {
    match peer {
        Some(active) => active.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
