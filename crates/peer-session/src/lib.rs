//! Peer-to-peer sessions negotiated over a signaling relay.
//!
//! A [`SessionHub`] accepts CONNECT requests from remote identities and runs
//! one [`HubSession`] per remote; an [`OutboundSession`] is the connecting
//! side. Both negotiate media and data sub-channels over a transport
//! primitive ([`RtcBackend`]) using perfect negotiation. The outbound side
//! asks the hub for a turn (RENEGOTIATE) before offering, so offers do not
//! collide on primitives that cannot roll back; when they do collide anyway
//! the hub's offer wins and the outbound side rolls back if it can.
//!
//! The `webrtc-backend` feature (on by default) provides [`WebRtcBackend`];
//! [`mock::MockBackend`] is an in-memory primitive for tests.

mod channel;
mod config;
mod error;
mod events;
mod hub;
mod member;
pub mod mock;
mod negotiation;
mod outbound;
mod rtc;
mod session;
#[cfg(feature = "webrtc-backend")]
mod webrtc_backend;

pub use relay_bus;

pub use channel::SubChannel;
pub use config::{
    DataChannelConfig, HubConfig, IceServer, RtcConfig, RtcConfigBuilder, SessionConfig,
    DEFAULT_STUN_SERVER,
};
pub use error::{ChannelError, RtcError, SessionError, SessionResult};
pub use events::{ChannelEvent, EventFilter, EventKind, EventStream, SessionEvent};
pub use hub::{ChannelDeclaration, SessionHub};
pub use member::HubSession;
pub use negotiation::NegotiationState;
pub use outbound::OutboundSession;
pub use rtc::{
    ChannelData, ConnectionState, DataChannelTransport, IceCandidate, OfferOptions,
    PeerConnection, PeerEvent, PeerEventSender, RawChannelEvent, RawChannelSink, RtcBackend,
    SdpType, SessionDescription, SignalingState,
};
#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::{RemoteMediaTrack, WebRtcBackend, WebRtcChannel, WebRtcPeer};
