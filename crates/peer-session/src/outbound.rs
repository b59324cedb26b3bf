use std::sync::Arc;

use relay_bus::{Identity, MessageKind, Relay, RelayFilter, RelayMessage};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::SubChannel;
use crate::config::SessionConfig;
use crate::error::SessionResult;
use crate::events::{EventFilter, EventStream};
use crate::negotiation::NegotiationState;
use crate::rtc::RtcBackend;
use crate::session::{self, Command, Input, Role, SessionSeed, SessionShared};

/// Connecting side of a session with a hub.
///
/// Nothing is negotiated until [`OutboundSession::connect`] asks the hub to
/// open a session; the peer is created when the hub's offer arrives. A later
/// offer with different content replaces the session.
pub struct OutboundSession<B: RtcBackend> {
    hub: Identity,
    relay: Arc<dyn Relay>,
    shared: Arc<SessionShared<B>>,
    pump: JoinHandle<()>,
}

impl<B: RtcBackend> OutboundSession<B> {
    /// Subscribes to the hub's messages right away so that no offer is
    /// missed between here and [`OutboundSession::connect`].
    pub fn new(
        backend: Arc<B>,
        relay: Arc<dyn Relay>,
        hub: impl Into<Identity>,
        config: SessionConfig,
    ) -> Self {
        let hub = hub.into();
        let mut inbox = relay.subscribe(RelayFilter::origin(hub.clone()).with_kinds([
            MessageKind::Offer,
            MessageKind::Answer,
            MessageKind::Candidate,
            MessageKind::Description,
            MessageKind::Renegotiate,
        ]));
        let (shared, _driver) = session::spawn(SessionSeed {
            role: Role::Outbound,
            backend,
            relay: relay.clone(),
            remote: hub.clone(),
            config,
            upstream: None,
            on_terminated: None,
            peer: None,
        });

        let sink = shared.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                if sink.enqueue(Input::Relay(message)).is_err() {
                    break;
                }
            }
            debug!(target = "peer_session", "relay subscription ended");
        });

        Self {
            hub,
            relay,
            shared,
            pump,
        }
    }

    pub fn hub(&self) -> &Identity {
        &self.hub
    }

    /// Asks the hub to open a session.
    pub fn connect(&self) -> SessionResult<()> {
        info!(target = "peer_session", hub = %self.hub, "requesting session");
        self.relay
            .publish(RelayMessage::empty(self.hub.clone(), MessageKind::Connect))?;
        Ok(())
    }

    /// Plain TEXT message to the hub over the relay.
    pub fn send_text(&self, text: &str) -> SessionResult<()> {
        self.relay
            .publish(RelayMessage::new(self.hub.clone(), MessageKind::Text, text)?)?;
        Ok(())
    }

    /// Fails with [`crate::SessionError::NoSession`] before the hub's offer
    /// has arrived.
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

    /// Closes the current session, if any. The hub may offer again later.
    pub async fn close(&self) {
        self.shared.close().await
    }
}

impl<B: RtcBackend> Drop for OutboundSession<B> {
    fn drop(&mut self) {
        self.pump.abort();
        let _ = self.shared.command(Command::Shutdown);
    }
}
