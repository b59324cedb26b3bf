use relay_bus::Identity;
use tokio::sync::broadcast;
use tracing::warn;

use crate::rtc::ChannelData;

/// Normalized lifecycle of one data sub-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open { label: String },
    Message { label: String, data: ChannelData },
    Error { label: String, error: String },
    Close { label: String },
}

impl ChannelEvent {
    pub fn label(&self) -> &str {
        match self {
            ChannelEvent::Open { label }
            | ChannelEvent::Message { label, .. }
            | ChannelEvent::Error { label, .. }
            | ChannelEvent::Close { label } => label,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Open { .. } => EventKind::ChannelOpen,
            ChannelEvent::Message { .. } => EventKind::ChannelMessage,
            ChannelEvent::Error { .. } => EventKind::ChannelError,
            ChannelEvent::Close { .. } => EventKind::ChannelClose,
        }
    }
}

/// Everything a session reports, tagged with the remote it concerns.
/// `T` is the backend's remote track type.
#[derive(Debug, Clone)]
pub enum SessionEvent<T> {
    Open {
        remote: Identity,
    },
    Track {
        remote: Identity,
        track: T,
        streams: Vec<String>,
    },
    Close {
        remote: Identity,
    },
    Channel {
        remote: Identity,
        event: ChannelEvent,
    },
}

impl<T> SessionEvent<T> {
    pub fn remote(&self) -> &Identity {
        match self {
            SessionEvent::Open { remote }
            | SessionEvent::Track { remote, .. }
            | SessionEvent::Close { remote }
            | SessionEvent::Channel { remote, .. } => remote,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Open { .. } => EventKind::SessionOpen,
            SessionEvent::Track { .. } => EventKind::SessionTrack,
            SessionEvent::Close { .. } => EventKind::SessionClose,
            SessionEvent::Channel { event, .. } => event.kind(),
        }
    }

    pub fn channel_label(&self) -> Option<&str> {
        match self {
            SessionEvent::Channel { event, .. } => Some(event.label()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionOpen,
    SessionTrack,
    SessionClose,
    ChannelOpen,
    ChannelMessage,
    ChannelError,
    ChannelClose,
}

/// Selects which session events a stream yields. The default passes all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    kinds: Option<Vec<EventKind>>,
    remote: Option<Identity>,
    label: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(kind: EventKind) -> Self {
        Self::kinds([kind])
    }

    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn from_remote(mut self, remote: impl Into<Identity>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    /// Only channel events for `label`.
    pub fn on_channel(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn matches<T>(&self, event: &SessionEvent<T>) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        if let Some(remote) = &self.remote {
            if event.remote() != remote {
                return false;
            }
        }
        match &self.label {
            Some(label) => event.channel_label() == Some(label.as_str()),
            None => true,
        }
    }
}

/// Filtered subscription over a session's or hub's event broadcast.
pub struct EventStream<T> {
    rx: broadcast::Receiver<SessionEvent<T>>,
    filter: EventFilter,
}

impl<T: Clone> EventStream<T> {
    pub(crate) fn new(rx: broadcast::Receiver<SessionEvent<T>>, filter: EventFilter) -> Self {
        Self { rx, filter }
    }

    /// Next matching event, or `None` once the emitter is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent<T>> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target = "peer_session", skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(target = "peer_session", skipped, "event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

/// Fan-out point for one session: its own subscribers plus, for hub members,
/// the hub's aggregate stream.
pub(crate) struct EventSink<T> {
    local: broadcast::Sender<SessionEvent<T>>,
    upstream: Option<broadcast::Sender<SessionEvent<T>>>,
}

impl<T: Clone> EventSink<T> {
    pub(crate) fn new(
        capacity: usize,
        upstream: Option<broadcast::Sender<SessionEvent<T>>>,
    ) -> Self {
        let (local, _) = broadcast::channel(capacity.max(1));
        Self { local, upstream }
    }

    pub(crate) fn emit(&self, event: SessionEvent<T>) {
        if let Some(upstream) = &self.upstream {
            let _ = upstream.send(event.clone());
        }
        let _ = self.local.send(event);
    }

    pub(crate) fn subscribe(&self, filter: EventFilter) -> EventStream<T> {
        EventStream::new(self.local.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(remote: &str, label: &str) -> SessionEvent<()> {
        SessionEvent::Channel {
            remote: Identity::new(remote),
            event: ChannelEvent::Message {
                label: label.into(),
                data: ChannelData::from("hi"),
            },
        }
    }

    #[test]
    fn filter_by_kind_remote_and_label() {
        let filter = EventFilter::kind(EventKind::ChannelMessage)
            .from_remote("alice")
            .on_channel("chat");
        assert!(filter.matches(&message("alice", "chat")));
        assert!(!filter.matches(&message("bob", "chat")));
        assert!(!filter.matches(&message("alice", "files")));
        assert!(!filter.matches(&SessionEvent::<()>::Open {
            remote: Identity::new("alice")
        }));
    }

    #[test]
    fn label_filter_rejects_session_events() {
        let filter = EventFilter::all().on_channel("chat");
        assert!(!filter.matches(&SessionEvent::<()>::Close {
            remote: Identity::new("alice")
        }));
    }

    #[tokio::test]
    async fn sink_reaches_local_and_upstream() {
        let (upstream, mut upstream_rx) = broadcast::channel(8);
        let sink = EventSink::new(8, Some(upstream));
        let mut stream = sink.subscribe(EventFilter::kind(EventKind::SessionOpen));

        sink.emit(message("alice", "chat"));
        sink.emit(SessionEvent::Open {
            remote: Identity::new("alice"),
        });

        let event = stream.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::SessionOpen);
        assert_eq!(upstream_rx.recv().await.unwrap().kind(), EventKind::ChannelMessage);
        assert_eq!(upstream_rx.recv().await.unwrap().kind(), EventKind::SessionOpen);
    }
}
