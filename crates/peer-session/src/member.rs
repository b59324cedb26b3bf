use std::sync::Arc;

use relay_bus::{Identity, Relay, RelayMessage};
use tokio::sync::{broadcast, mpsc};

use crate::channel::SubChannel;
use crate::config::{DataChannelConfig, SessionConfig};
use crate::error::SessionResult;
use crate::events::{EventFilter, EventStream, SessionEvent};
use crate::negotiation::NegotiationState;
use crate::rtc::RtcBackend;
use crate::session::{self, Command, Input, Role, SessionSeed, SessionShared, TerminationHook};

/// The hub's side of one connected remote.
///
/// Created by [`crate::SessionHub`] when a CONNECT arrives. The hub sends
/// the initial offer and keeps its own offer when both sides collide.
pub struct HubSession<B: RtcBackend> {
    id: u64,
    shared: Arc<SessionShared<B>>,
}

impl<B: RtcBackend> HubSession<B> {
    pub(crate) async fn spawn(
        id: u64,
        backend: Arc<B>,
        relay: Arc<dyn Relay>,
        remote: Identity,
        config: SessionConfig,
        upstream: broadcast::Sender<SessionEvent<B::RemoteTrack>>,
        on_terminated: TerminationHook,
    ) -> SessionResult<Arc<Self>> {
        let (tx, events) = mpsc::unbounded_channel();
        let peer = backend.create_peer(&config.rtc, tx).await?;
        let (shared, _driver) = session::spawn(SessionSeed {
            role: Role::Member,
            backend,
            relay,
            remote,
            config,
            upstream: Some(upstream),
            on_terminated: Some(on_terminated),
            peer: Some((peer, events)),
        });
        Ok(Arc::new(Self { id, shared }))
    }

    /// Distinguishes successive sessions for the same remote.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &Identity {
        self.shared.remote()
    }

    /// Sends the initial offer. Queued behind any channel creation already
    /// requested, so the offer covers those channels.
    pub fn start(&self) -> SessionResult<()> {
        self.shared.command(Command::Start)
    }

    pub fn on_answer(&self, message: RelayMessage) -> SessionResult<()> {
        self.shared.enqueue(Input::Relay(message))
    }

    pub fn on_candidate(&self, message: RelayMessage) -> SessionResult<()> {
        self.shared.enqueue(Input::Relay(message))
    }

    pub fn on_description(&self, message: RelayMessage) -> SessionResult<()> {
        self.shared.enqueue(Input::Relay(message))
    }

    /// The client asks for a turn to offer.
    pub fn on_renegotiate(&self, message: RelayMessage) -> SessionResult<()> {
        self.shared.enqueue(Input::Relay(message))
    }

    pub async fn create_data_channel(
        &self,
        label: impl Into<String>,
        config: DataChannelConfig,
    ) -> SessionResult<()> {
        self.shared.create_data_channel(label.into(), config).await
    }

    /// Fire-and-forget variant used when replaying hub declarations.
    pub(crate) fn request_data_channel(&self, label: String, config: DataChannelConfig) {
        let _ = self.shared.command(Command::CreateDataChannel {
            label,
            config,
            reply: None,
        });
    }

    pub async fn add_track(&self, track: B::LocalTrack, streams: Vec<String>) -> SessionResult<()> {
        self.shared.add_track(track, streams).await
    }

    pub fn get_channel(&self, label: &str) -> Option<Arc<SubChannel<B>>> {
        self.shared.channel(label)
    }

    pub fn channel_labels(&self) -> Vec<String> {
        self.shared.channel_labels()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.shared.negotiation_state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn events(&self, filter: EventFilter) -> EventStream<B::RemoteTrack> {
        self.shared.subscribe(filter)
    }

    /// Closes the primitive; the session reports `Close` and leaves the hub.
    pub async fn close(&self) {
        self.shared.close().await
    }

    pub(crate) fn request_close(&self) {
        let _ = self.shared.command(Command::Shutdown);
    }
}
