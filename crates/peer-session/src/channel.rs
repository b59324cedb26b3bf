use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, mpsc};
use tracing::{trace, Instrument, Span};

use crate::error::ChannelError;
use crate::events::ChannelEvent;
use crate::rtc::{ChannelData, DataChannelTransport, RawChannelEvent, RtcBackend};

const CHANNEL_EVENT_CAPACITY: usize = 256;

/// Callback receiving every normalized event of a channel, used by the
/// owning session to keep its channel map and event stream in step.
pub(crate) type ChannelOwner = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// A named, independently ordered message stream inside a session.
///
/// Wraps the primitive's channel and guarantees that subscribers see at most
/// one `Open`, at most one `Close`, and nothing after `Close`.
pub struct SubChannel<B: RtcBackend> {
    label: String,
    transport: Arc<B::Channel>,
    open: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ChannelEvent>,
}

impl<B: RtcBackend> SubChannel<B> {
    pub(crate) fn wrap(transport: Arc<B::Channel>, owner: ChannelOwner, span: &Span) -> Arc<Self> {
        let label = transport.label().to_string();
        let (events, _) = broadcast::channel(CHANNEL_EVENT_CAPACITY);
        let channel = Arc::new(Self {
            label: label.clone(),
            transport: transport.clone(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
        });

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let span = tracing::debug_span!(parent: span, "sub_channel", label = %label);
        tokio::spawn(pump(Arc::downgrade(&channel), raw_rx, owner).instrument(span));
        transport.attach(raw_tx);
        channel
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub async fn send(&self, data: impl Into<ChannelData>) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen(self.label.clone()));
        }
        self.transport.send(data.into()).await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), ChannelError> {
        self.transport.close().await?;
        Ok(())
    }

    /// Marks the channel closed without waiting for the primitive. Returns
    /// the `Close` event if this call performed the transition.
    pub(crate) fn terminate(&self) -> Option<ChannelEvent> {
        let event = self.normalize(RawChannelEvent::Close)?;
        let _ = self.events.send(event.clone());
        Some(event)
    }

    fn normalize(&self, raw: RawChannelEvent) -> Option<ChannelEvent> {
        let label = self.label.clone();
        match raw {
            RawChannelEvent::Close => {
                if self.closed.swap(true, Ordering::AcqRel) {
                    return None;
                }
                self.open.store(false, Ordering::Release);
                Some(ChannelEvent::Close { label })
            }
            _ if self.is_closed() => None,
            RawChannelEvent::Open => {
                if self.open.swap(true, Ordering::AcqRel) {
                    return None;
                }
                Some(ChannelEvent::Open { label })
            }
            RawChannelEvent::Message(data) => Some(ChannelEvent::Message { label, data }),
            RawChannelEvent::Error(error) => Some(ChannelEvent::Error { label, error }),
        }
    }
}

async fn pump<B: RtcBackend>(
    channel: Weak<SubChannel<B>>,
    mut raw: mpsc::UnboundedReceiver<RawChannelEvent>,
    owner: ChannelOwner,
) {
    while let Some(event) = raw.recv().await {
        let Some(channel) = channel.upgrade() else {
            break;
        };
        let Some(event) = channel.normalize(event) else {
            trace!(target = "peer_session", "dropping redundant channel event");
            continue;
        };
        let terminal = matches!(event, ChannelEvent::Close { .. });
        let _ = channel.events.send(event.clone());
        owner(event);
        if terminal {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockChannel};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn recording_owner() -> (ChannelOwner, Arc<Mutex<Vec<ChannelEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |event| sink.lock().push(event)), seen)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn duplicate_and_late_events_are_suppressed() {
        let transport = MockChannel::detached("chat");
        let (owner, seen) = recording_owner();
        let channel = SubChannel::<MockBackend>::wrap(transport.clone(), owner, &Span::none());

        transport.inject(RawChannelEvent::Open);
        transport.inject(RawChannelEvent::Open);
        transport.inject(RawChannelEvent::Message(ChannelData::from("one")));
        transport.inject(RawChannelEvent::Close);
        transport.inject(RawChannelEvent::Message(ChannelData::from("late")));
        transport.inject(RawChannelEvent::Close);
        settle().await;

        let seen = seen.lock().clone();
        assert_eq!(
            seen,
            vec![
                ChannelEvent::Open {
                    label: "chat".into()
                },
                ChannelEvent::Message {
                    label: "chat".into(),
                    data: ChannelData::from("one")
                },
                ChannelEvent::Close {
                    label: "chat".into()
                },
            ]
        );
        assert!(channel.is_closed());
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn send_requires_open_channel() {
        let transport = MockChannel::detached("files");
        let (owner, _) = recording_owner();
        let channel = SubChannel::<MockBackend>::wrap(transport, owner, &Span::none());

        let err = channel.send("too early").await.unwrap_err();
        assert!(matches!(err, ChannelError::NotOpen(label) if label == "files"));
    }

    #[tokio::test]
    async fn terminate_emits_close_once() {
        let transport = MockChannel::detached("chat");
        let (owner, seen) = recording_owner();
        let channel = SubChannel::<MockBackend>::wrap(transport.clone(), owner, &Span::none());
        let mut rx = channel.subscribe();

        assert!(channel.terminate().is_some());
        assert!(channel.terminate().is_none());
        transport.inject(RawChannelEvent::Close);
        settle().await;

        assert!(matches!(rx.recv().await.unwrap(), ChannelEvent::Close { .. }));
        assert!(rx.try_recv().is_err());
        assert!(seen.lock().is_empty());
    }
}
