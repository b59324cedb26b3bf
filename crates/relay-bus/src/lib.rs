use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Opaque name of a participant on the relay bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&Identity> for Identity {
    fn from(value: &Identity) -> Self {
        value.clone()
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Connect,
    Offer,
    Answer,
    Candidate,
    Description,
    /// Turn request from the polite side; the same kind echoed back grants it.
    Renegotiate,
    Text,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Connect => "CONNECT",
            MessageKind::Offer => "OFFER",
            MessageKind::Answer => "ANSWER",
            MessageKind::Candidate => "CANDIDATE",
            MessageKind::Description => "DESCRIPTION",
            MessageKind::Renegotiate => "RENEGOTIATE",
            MessageKind::Text => "TEXT",
        }
    }

    /// Everything except application text belongs to session setup.
    pub fn is_handshake(self) -> bool {
        !matches!(self, MessageKind::Text)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope exchanged over the relay. `from` is absent on messages we
/// originate; the relay stamps it on delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Identity>,
    pub to: Identity,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: Value,
}

impl RelayMessage {
    pub fn new<T: Serialize + ?Sized>(
        to: impl Into<Identity>,
        kind: MessageKind,
        payload: &T,
    ) -> RelayResult<Self> {
        Ok(Self {
            from: None,
            to: to.into(),
            kind,
            data: serde_json::to_value(payload)?,
        })
    }

    /// Message with an empty object payload, as used by CONNECT.
    pub fn empty(to: impl Into<Identity>, kind: MessageKind) -> Self {
        Self {
            from: None,
            to: to.into(),
            kind,
            data: Value::Object(Default::default()),
        }
    }

    pub fn origin(&self) -> Option<&Identity> {
        self.from.as_ref()
    }

    pub fn payload<T: DeserializeOwned>(&self) -> RelayResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|err| {
            RelayError::Payload(format!("{} payload from {:?}: {err}", self.kind, self.from))
        })
    }

    pub fn has_payload(&self) -> bool {
        !self.data.is_null()
    }

    pub fn encode(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> RelayResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay channel closed")]
    Closed,
    #[error("no subscriber for {0}")]
    UnknownRecipient(Identity),
    #[error("relay codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("malformed {0}")]
    Payload(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Predicate over `{from, kind}` applied to a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayFilter {
    origin: Option<Identity>,
    kinds: Option<Vec<MessageKind>>,
}

impl RelayFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn origin(identity: impl Into<Identity>) -> Self {
        Self {
            origin: Some(identity.into()),
            kinds: None,
        }
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn matches(&self, message: &RelayMessage) -> bool {
        if let Some(origin) = &self.origin {
            if message.from.as_ref() != Some(origin) {
                return false;
            }
        }
        match &self.kinds {
            Some(kinds) => kinds.contains(&message.kind),
            None => true,
        }
    }
}

/// Filtered view over one identity's mailbox.
pub struct RelaySubscription {
    rx: broadcast::Receiver<RelayMessage>,
    filter: RelayFilter,
}

impl RelaySubscription {
    pub fn new(rx: broadcast::Receiver<RelayMessage>, filter: RelayFilter) -> Self {
        Self { rx, filter }
    }

    pub fn filter(&self) -> &RelayFilter {
        &self.filter
    }

    /// Next matching message, or `None` once the relay is gone.
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) if self.filter.matches(&message) => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(target = "relay_bus", skipped, "relay subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<RelayMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(message) if self.filter.matches(&message) => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!(target = "relay_bus", skipped, "relay subscriber lagged");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}

/// A relay endpoint bound to the local identity.
pub trait Relay: Send + Sync {
    fn identity(&self) -> &Identity;
    fn subscribe(&self, filter: RelayFilter) -> RelaySubscription;
    fn publish(&self, message: RelayMessage) -> RelayResult<()>;
}

/// In-memory relay routing messages by recipient identity. Used by tests and
/// by in-process deployments.
#[derive(Debug, Clone)]
pub struct LocalRelay {
    inner: Arc<LocalRelayInner>,
}

#[derive(Debug)]
struct LocalRelayInner {
    capacity: usize,
    mailboxes: RwLock<HashMap<Identity, broadcast::Sender<RelayMessage>>>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAILBOX_CAPACITY)
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LocalRelayInner {
                capacity,
                mailboxes: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn attach(&self, identity: impl Into<Identity>) -> LocalRelayPort {
        LocalRelayPort {
            identity: identity.into(),
            relay: self.clone(),
        }
    }

    fn mailbox(&self, identity: &Identity) -> broadcast::Sender<RelayMessage> {
        if let Some(sender) = self.inner.mailboxes.read().get(identity) {
            return sender.clone();
        }
        let mut guard = self.inner.mailboxes.write();
        guard
            .entry(identity.clone())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone()
    }

    pub fn deliver(&self, message: RelayMessage) -> RelayResult<()> {
        let sender = self.mailbox(&message.to);
        trace!(
            target = "relay_bus",
            from = ?message.from,
            to = %message.to,
            kind = %message.kind,
            "relay deliver"
        );
        let recipient = message.to.clone();
        sender
            .send(message)
            .map(|_| ())
            .map_err(|_| RelayError::UnknownRecipient(recipient))
    }
}

#[derive(Debug, Clone)]
pub struct LocalRelayPort {
    identity: Identity,
    relay: LocalRelay,
}

impl LocalRelayPort {
    pub fn relay(&self) -> &LocalRelay {
        &self.relay
    }
}

impl Relay for LocalRelayPort {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn subscribe(&self, filter: RelayFilter) -> RelaySubscription {
        RelaySubscription::new(self.relay.mailbox(&self.identity).subscribe(), filter)
    }

    fn publish(&self, mut message: RelayMessage) -> RelayResult<()> {
        message.from = Some(self.identity.clone());
        self.relay.deliver(message)
    }
}
