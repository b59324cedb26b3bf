use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use relay_bus::{Identity, MessageKind, Relay, RelayFilter, RelayMessage, RelaySubscription};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use crate::config::{DataChannelConfig, HubConfig};
use crate::error::{SessionError, SessionResult};
use crate::events::{EventFilter, EventStream, SessionEvent};
use crate::member::HubSession;
use crate::rtc::{ChannelData, RtcBackend};

/// A sub-channel every session of the hub carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDeclaration {
    pub label: String,
    pub config: DataChannelConfig,
}

/// Accepts CONNECT requests, keeps one session per remote identity and
/// replays declared sub-channels onto each of them.
///
/// Events of every member session are re-emitted on the hub's own stream.
pub struct SessionHub<B: RtcBackend> {
    inner: Arc<HubInner<B>>,
    router: JoinHandle<()>,
}

struct HubInner<B: RtcBackend> {
    backend: Arc<B>,
    relay: Arc<dyn Relay>,
    config: HubConfig,
    registry: Mutex<Registry<B>>,
    events: broadcast::Sender<SessionEvent<B::RemoteTrack>>,
    next_session_id: AtomicU64,
    span: Span,
}

struct Registry<B: RtcBackend> {
    sessions: HashMap<Identity, Arc<HubSession<B>>>,
    declarations: Vec<ChannelDeclaration>,
}

impl<B: RtcBackend> SessionHub<B> {
    /// Starts routing relay messages addressed to `relay`'s identity. Must be
    /// called from within a tokio runtime.
    pub fn new(backend: Arc<B>, relay: Arc<dyn Relay>, config: HubConfig) -> Self {
        let span = info_span!(parent: &config.span, "session_hub", identity = %relay.identity());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inbox = relay.subscribe(RelayFilter::any().with_kinds([
            MessageKind::Connect,
            MessageKind::Answer,
            MessageKind::Candidate,
            MessageKind::Description,
        ]));
        let inner = Arc::new(HubInner {
            backend,
            relay,
            config,
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                declarations: Vec::new(),
            }),
            events,
            next_session_id: AtomicU64::new(0),
            span: span.clone(),
        });
        let router = tokio::spawn(route(inner.clone(), inbox).instrument(span));
        Self { inner, router }
    }

    pub fn identity(&self) -> &Identity {
        self.inner.relay.identity()
    }

    /// Declares a sub-channel: existing sessions get it now, later sessions
    /// when they are created.
    pub async fn add_data_channel(
        &self,
        label: impl Into<String>,
        config: DataChannelConfig,
    ) -> SessionResult<()> {
        let label = label.into();
        let sessions: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            if registry.declarations.iter().any(|declared| declared.label == label) {
                warn!(target = "peer_session", %label, "data channel already declared");
                return Err(SessionError::DuplicateDeclaration(label));
            }
            registry.declarations.push(ChannelDeclaration {
                label: label.clone(),
                config: config.clone(),
            });
            registry.sessions.values().cloned().collect()
        };
        debug!(target = "peer_session", %label, sessions = sessions.len(), "data channel declared");

        for session in sessions {
            if session.get_channel(&label).is_some() {
                continue;
            }
            match session.create_data_channel(label.clone(), config.clone()).await {
                Ok(()) | Err(SessionError::ChannelExists(_)) | Err(SessionError::Closed) => {}
                Err(err) => warn!(
                    target = "peer_session",
                    remote = %session.remote(),
                    %label,
                    error = %err,
                    "failed to add data channel"
                ),
            }
        }
        Ok(())
    }

    /// Sends `data` on `label` to every session where that channel is open.
    /// Returns how many sessions it was handed to.
    pub async fn send_data(&self, label: &str, data: impl Into<ChannelData>) -> usize {
        let data = data.into();
        let mut delivered = 0;
        for session in self.inner.snapshot() {
            let Some(channel) = session.get_channel(label) else {
                continue;
            };
            match channel.send(data.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => debug!(
                    target = "peer_session",
                    remote = %session.remote(),
                    label,
                    error = %err,
                    "skipping session"
                ),
            }
        }
        delivered
    }

    /// Adds `track` to every current session. Returns how many accepted it.
    pub async fn add_track(&self, track: B::LocalTrack, streams: Vec<String>) -> usize {
        let mut added = 0;
        for session in self.inner.snapshot() {
            match session.add_track(track.clone(), streams.clone()).await {
                Ok(()) => added += 1,
                Err(err) => warn!(
                    target = "peer_session",
                    remote = %session.remote(),
                    error = %err,
                    "failed to add track"
                ),
            }
        }
        added
    }

    /// Plain TEXT message to `to` over the relay.
    pub fn send_text(&self, to: impl Into<Identity>, text: &str) -> SessionResult<()> {
        self.inner
            .relay
            .publish(RelayMessage::new(to, MessageKind::Text, text)?)?;
        Ok(())
    }

    pub fn get_session(&self, remote: &str) -> Option<Arc<HubSession<B>>> {
        self.inner.registry.lock().sessions.get(remote).cloned()
    }

    pub fn sessions(&self) -> Vec<Identity> {
        let mut remotes: Vec<_> = self.inner.registry.lock().sessions.keys().cloned().collect();
        remotes.sort();
        remotes
    }

    pub fn declarations(&self) -> Vec<ChannelDeclaration> {
        self.inner.registry.lock().declarations.clone()
    }

    pub fn events(&self, filter: EventFilter) -> EventStream<B::RemoteTrack> {
        EventStream::new(self.inner.events.subscribe(), filter)
    }

    /// Stops accepting messages and closes every session.
    pub async fn shutdown(&self) {
        self.router.abort();
        let sessions: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            registry.sessions.drain().map(|(_, session)| session).collect()
        };
        info!(target = "peer_session", sessions = sessions.len(), "hub shutting down");
        for session in sessions {
            session.close().await;
        }
    }
}

impl<B: RtcBackend> Drop for SessionHub<B> {
    fn drop(&mut self) {
        self.router.abort();
        for session in self.inner.snapshot() {
            session.request_close();
        }
    }
}

impl<B: RtcBackend> HubInner<B> {
    fn snapshot(&self) -> Vec<Arc<HubSession<B>>> {
        self.registry.lock().sessions.values().cloned().collect()
    }

    async fn accept(self: &Arc<Self>, remote: Identity) {
        if self.registry.lock().sessions.contains_key(&remote) {
            warn!(target = "peer_session", %remote, "client already exists");
            return;
        }
        let id = self.next_session_id.fetch_add(1, Ordering::AcqRel) + 1;
        let hub = Arc::downgrade(self);
        let departing = remote.clone();
        let on_terminated = Box::new(move || {
            if let Some(hub) = hub.upgrade() {
                hub.forget(&departing, id);
            }
        });

        let mut config = self.config.session.clone();
        config.span = self.span.clone();
        let session = HubSession::spawn(
            id,
            self.backend.clone(),
            self.relay.clone(),
            remote.clone(),
            config,
            self.events.clone(),
            on_terminated,
        )
        .await;
        let session = match session {
            Ok(session) => session,
            Err(err) => {
                warn!(target = "peer_session", %remote, error = %err, "failed to create session");
                return;
            }
        };

        let declarations = {
            let mut registry = self.registry.lock();
            registry.sessions.insert(remote.clone(), session.clone());
            registry.declarations.clone()
        };
        info!(
            target = "peer_session",
            %remote,
            session_id = id,
            channels = declarations.len(),
            "session accepted"
        );
        for declaration in declarations {
            session.request_data_channel(declaration.label, declaration.config);
        }
        if let Err(err) = session.start() {
            warn!(target = "peer_session", %remote, error = %err, "failed to start session");
        }
    }

    fn forget(&self, remote: &Identity, id: u64) {
        let mut registry = self.registry.lock();
        if registry.sessions.get(remote).map(|session| session.id()) == Some(id) {
            registry.sessions.remove(remote);
            debug!(target = "peer_session", %remote, session_id = id, "session removed");
        }
    }
}

async fn route<B: RtcBackend>(inner: Arc<HubInner<B>>, mut inbox: RelaySubscription) {
    while let Some(message) = inbox.recv().await {
        let Some(remote) = message.origin().cloned() else {
            warn!(target = "peer_session", kind = %message.kind, "relay message without origin");
            continue;
        };
        let kind = message.kind;
        if kind == MessageKind::Connect {
            inner.accept(remote).await;
            continue;
        }
        if !kind.is_handshake() {
            trace!(target = "peer_session", %remote, %kind, "application message not routed");
            continue;
        }
        let session = inner.registry.lock().sessions.get(&remote).cloned();
        let Some(session) = session else {
            debug!(target = "peer_session", %remote, %kind, "message received for unknown client");
            continue;
        };
        let delivered = match kind {
            MessageKind::Answer => session.on_answer(message),
            MessageKind::Candidate => session.on_candidate(message),
            MessageKind::Description => session.on_description(message),
            MessageKind::Renegotiate => session.on_renegotiate(message),
            _ => Ok(()),
        };
        if let Err(err) = delivered {
            debug!(target = "peer_session", %remote, %kind, error = %err, "session gone");
        }
    }
    debug!(target = "peer_session", "hub relay subscription ended");
}
