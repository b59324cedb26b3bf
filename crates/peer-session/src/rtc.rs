//! Contract between the negotiation engine and the transport primitive that
//! actually performs ICE, DTLS and SCTP.
//!
//! A backend is a factory ([`RtcBackend`]) for peer connections
//! ([`PeerConnection`]) and names the concrete channel and track types it
//! hands out. Everything the primitive reports asynchronously arrives as a
//! [`PeerEvent`] on the sender passed to [`RtcBackend::create_peer`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{DataChannelConfig, RtcConfig};
use crate::error::RtcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

/// Network-path candidate in the browser JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States the primitive never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
    pub ice_restart: bool,
}

impl OfferOptions {
    /// Options for the hub's first offer: receive audio and video, fresh ICE.
    pub fn initial() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
            ice_restart: true,
        }
    }
}

/// One message on a data sub-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelData {
    Text(String),
    Binary(Bytes),
}

impl ChannelData {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ChannelData::Text(text) => Some(text),
            ChannelData::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ChannelData::Text(text) => text.len(),
            ChannelData::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for ChannelData {
    fn from(value: &str) -> Self {
        ChannelData::Text(value.to_string())
    }
}

impl From<String> for ChannelData {
    fn from(value: String) -> Self {
        ChannelData::Text(value)
    }
}

impl From<Bytes> for ChannelData {
    fn from(value: Bytes) -> Self {
        ChannelData::Binary(value)
    }
}

impl From<Vec<u8>> for ChannelData {
    fn from(value: Vec<u8>) -> Self {
        ChannelData::Binary(Bytes::from(value))
    }
}

/// Lifecycle notifications straight from the primitive's data channel,
/// before any normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChannelEvent {
    Open,
    Message(ChannelData),
    Error(String),
    Close,
}

pub type RawChannelSink = mpsc::UnboundedSender<RawChannelEvent>;

#[async_trait]
pub trait DataChannelTransport: Send + Sync + 'static {
    fn label(&self) -> &str;

    /// Start delivering raw events to `sink`. Called once per channel.
    fn attach(&self, sink: RawChannelSink);

    async fn send(&self, data: ChannelData) -> Result<(), RtcError>;

    async fn close(&self) -> Result<(), RtcError>;
}

/// Callbacks of the primitive, delivered in the order it raised them.
pub enum PeerEvent<B: RtcBackend> {
    /// `None` marks the end of candidate gathering.
    IceCandidate(Option<IceCandidate>),
    ConnectionState(ConnectionState),
    Track {
        track: B::RemoteTrack,
        streams: Vec<String>,
    },
    DataChannel(Arc<B::Channel>),
    NegotiationNeeded,
}

impl<B: RtcBackend> fmt::Debug for PeerEvent<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            PeerEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
            PeerEvent::Track { track, streams } => f
                .debug_struct("Track")
                .field("track", track)
                .field("streams", streams)
                .finish(),
            PeerEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            PeerEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
        }
    }
}

pub type PeerEventSender<B> = mpsc::UnboundedSender<PeerEvent<B>>;

#[async_trait]
pub trait RtcBackend: Send + Sync + Sized + 'static {
    type Peer: PeerConnection<Self>;
    type Channel: DataChannelTransport;
    type LocalTrack: Clone + Send + Sync + 'static;
    type RemoteTrack: Clone + Send + Sync + fmt::Debug + 'static;

    async fn create_peer(
        &self,
        config: &RtcConfig,
        events: PeerEventSender<Self>,
    ) -> Result<Arc<Self::Peer>, RtcError>;
}

#[async_trait]
pub trait PeerConnection<B: RtcBackend>: Send + Sync + 'static {
    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, RtcError>;

    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;

    async fn apply_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError>;

    /// Implicit local description: an answer when a remote offer is pending,
    /// an offer otherwise.
    async fn set_local_description(&self) -> Result<SessionDescription, RtcError> {
        let description = match self.signaling_state() {
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer => {
                self.create_answer().await?
            }
            SignalingState::Closed => return Err(RtcError::Closed),
            _ => self.create_offer(OfferOptions::default()).await?,
        };
        self.apply_local_description(description.clone()).await?;
        Ok(description)
    }

    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), RtcError>;

    /// Discard a pending local offer and return to `Stable`.
    async fn rollback(&self) -> Result<(), RtcError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;

    async fn create_data_channel(
        &self,
        label: &str,
        config: &DataChannelConfig,
    ) -> Result<Arc<B::Channel>, RtcError>;

    async fn add_track(&self, track: B::LocalTrack, streams: &[String]) -> Result<(), RtcError>;

    async fn close(&self) -> Result<(), RtcError>;
}
