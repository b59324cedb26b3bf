#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use peer_session::mock::MockBackend;
use peer_session::relay_bus::{LocalRelay, Relay};
use peer_session::{
    EventFilter, EventKind, EventStream, HubConfig, OutboundSession, RtcBackend, SessionConfig,
    SessionEvent, SessionHub,
};

pub const HUB: &str = "hub";
const WAIT: Duration = Duration::from_secs(5);

/// One relay plus one backend shared by every participant.
pub struct Net<B: RtcBackend = MockBackend> {
    pub relay: LocalRelay,
    pub backend: Arc<B>,
    pub session: SessionConfig,
}

impl Net<MockBackend> {
    pub fn new() -> Self {
        Self::on(MockBackend::new(), SessionConfig::default())
    }
}

impl<B: RtcBackend> Net<B> {
    pub fn on(backend: B, session: SessionConfig) -> Self {
        Self {
            relay: LocalRelay::new(),
            backend: Arc::new(backend),
            session,
        }
    }

    pub fn port(&self, identity: &str) -> Arc<dyn Relay> {
        Arc::new(self.relay.attach(identity))
    }

    pub fn hub(&self) -> SessionHub<B> {
        self.hub_with(HubConfig::default().with_session(self.session.clone()))
    }

    pub fn hub_with(&self, config: HubConfig) -> SessionHub<B> {
        SessionHub::new(self.backend.clone(), self.port(HUB), config)
    }

    pub fn client(&self, identity: &str) -> OutboundSession<B> {
        OutboundSession::new(
            self.backend.clone(),
            self.port(identity),
            HUB,
            self.session.clone(),
        )
    }
}

pub async fn next_event<T: Clone>(stream: &mut EventStream<T>) -> Result<SessionEvent<T>> {
    tokio::time::timeout(WAIT, stream.recv())
        .await
        .map_err(|_| anyhow!("timed out waiting for event"))?
        .context("event stream closed")
}

/// Skips events until one of `kind` arrives.
pub async fn expect_kind<T: Clone>(
    stream: &mut EventStream<T>,
    kind: EventKind,
) -> Result<SessionEvent<T>> {
    loop {
        let event = next_event(stream).await?;
        if event.kind() == kind {
            return Ok(event);
        }
    }
}

pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            bail!("condition never held: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Connects `client` and waits until both sides report the session open.
pub async fn connect<B: RtcBackend>(
    hub: &SessionHub<B>,
    client: &OutboundSession<B>,
    remote: &str,
) -> Result<()> {
    let mut hub_events = hub.events(EventFilter::kind(EventKind::SessionOpen).from_remote(remote));
    let mut client_events = client.events(EventFilter::kind(EventKind::SessionOpen));
    client.connect()?;
    next_event(&mut hub_events).await?;
    next_event(&mut client_events).await?;
    Ok(())
}

pub fn message_text<T>(event: &SessionEvent<T>) -> Option<String> {
    match event {
        SessionEvent::Channel {
            event: peer_session::ChannelEvent::Message { data, .. },
            ..
        } => data.as_text().map(str::to_string),
        _ => None,
    }
}
