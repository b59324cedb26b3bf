//! Transport primitive backed by `webrtc-rs`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{DataChannelConfig, RtcConfig};
use crate::error::RtcError;
use crate::rtc::{
    ChannelData, ConnectionState, DataChannelTransport, IceCandidate, OfferOptions,
    PeerConnection, PeerEvent, PeerEventSender, RawChannelEvent, RawChannelSink, RtcBackend,
    SdpType, SessionDescription, SignalingState,
};

impl From<webrtc::Error> for RtcError {
    fn from(err: webrtc::Error) -> Self {
        RtcError::Backend(err.to_string())
    }
}

/// Remote media track surfaced by `webrtc-rs`.
#[derive(Clone)]
pub struct RemoteMediaTrack(pub Arc<TrackRemote>);

impl fmt::Debug for RemoteMediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMediaTrack")
            .field("id", &self.0.id())
            .field("kind", &self.0.kind().to_string())
            .finish()
    }
}

pub struct WebRtcBackend {
    api: API,
}

impl WebRtcBackend {
    pub fn new() -> Result<Self, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl RtcBackend for WebRtcBackend {
    type Peer = WebRtcPeer;
    type Channel = WebRtcChannel;
    type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;
    type RemoteTrack = RemoteMediaTrack;

    async fn create_peer(
        &self,
        config: &RtcConfig,
        events: PeerEventSender<Self>,
    ) -> Result<Arc<WebRtcPeer>, RtcError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|err| RtcError::Setup(err.to_string()))?,
        );
        wire_callbacks(&pc, events);
        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: PeerEventSender<WebRtcBackend>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let candidate = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => Some(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(err) => {
                        warn!(target = "peer_session", error = %err, "failed to encode local candidate");
                        return;
                    }
                },
                None => None,
            };
            let _ = tx.send(PeerEvent::IceCandidate(candidate));
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(state) = connection_state(state) {
                let _ = tx.send(PeerEvent::ConnectionState(state));
            }
        })
    }));

    let tx = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let tx = tx.clone();
            Box::pin(async move {
                let streams = vec![track.stream_id()];
                let _ = tx.send(PeerEvent::Track {
                    track: RemoteMediaTrack(track),
                    streams,
                });
            })
        },
    ));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::DataChannel(Arc::new(WebRtcChannel::new(channel))));
        })
    }));

    pc.on_negotiation_needed(Box::new(move || {
        let tx = events.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::NegotiationNeeded);
        })
    }));
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, RtcError> {
    let converted = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = description.sdp;
            rollback
        }
    };
    Ok(converted)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, RtcError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(RtcError::Sdp("unspecified description type".into()));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Adds a receive-only transceiver for `kind` unless one exists.
    async fn ensure_receiver(&self, kind: RTPCodecType) -> Result<(), RtcError> {
        let transceivers = self.pc.get_transceivers().await;
        if transceivers.iter().any(|transceiver| transceiver.kind() == kind) {
            return Ok(());
        }
        self.pc
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PeerConnection<WebRtcBackend> for WebRtcPeer {
    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state(self.pc.connection_state()).unwrap_or(ConnectionState::New)
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, RtcError> {
        if options.receive_audio {
            self.ensure_receiver(RTPCodecType::Audio).await?;
        }
        if options.receive_video {
            self.ensure_receiver(RTPCodecType::Video).await?;
        }
        // webrtc-rs has no ICE agent to restart before the first exchange.
        let ice_restart =
            options.ice_restart && self.pc.current_local_description().await.is_some();
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart,
                ..Default::default()
            }))
            .await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn apply_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    /// webrtc-rs refuses this from `HaveLocalOffer`; the error is returned
    /// as is and the pending offer stays in place.
    async fn rollback(&self) -> Result<(), RtcError> {
        if self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            return Ok(());
        }
        let pending = self
            .pc
            .pending_local_description()
            .await
            .map(|description| description.sdp)
            .unwrap_or_default();
        self.apply_local_description(SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: pending,
        })
        .await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| RtcError::Candidate(err.to_string()))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        config: &DataChannelConfig,
    ) -> Result<Arc<WebRtcChannel>, RtcError> {
        let init = RTCDataChannelInit {
            ordered: Some(config.ordered),
            max_retransmits: config.max_retransmits,
            max_packet_life_time: config.max_packet_life_time,
            protocol: config.protocol.clone(),
            negotiated: config.negotiated,
        };
        let channel = self.pc.create_data_channel(label, Some(init)).await?;
        Ok(Arc::new(WebRtcChannel::new(channel)))
    }

    async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
        streams: &[String],
    ) -> Result<(), RtcError> {
        if !streams.is_empty() {
            debug!(target = "peer_session", ?streams, "stream ids come from the local track");
        }
        let sender = self.pc.add_track(track).await?;
        // Drain RTCP so interceptors keep running.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.pc.close().await?;
        Ok(())
    }
}

pub struct WebRtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

impl WebRtcChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self {
            label: dc.label().to_string(),
            dc,
        }
    }
}

#[async_trait]
impl DataChannelTransport for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn attach(&self, sink: RawChannelSink) {
        let tx = sink.clone();
        self.dc.on_open(Box::new(move || {
            Box::pin(async move {
                let _ = tx.send(RawChannelEvent::Open);
            })
        }));

        let tx = sink.clone();
        self.dc.on_message(Box::new(move |message: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                let data = if message.is_string {
                    ChannelData::Text(String::from_utf8_lossy(&message.data).into_owned())
                } else {
                    ChannelData::Binary(message.data)
                };
                let _ = tx.send(RawChannelEvent::Message(data));
            })
        }));

        let tx = sink.clone();
        self.dc.on_error(Box::new(move |err: webrtc::Error| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(RawChannelEvent::Error(err.to_string()));
            })
        }));

        let tx = sink.clone();
        self.dc.on_close(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(RawChannelEvent::Close);
            })
        }));

        // Remote channels may already be open by the time they are attached.
        if self.dc.ready_state() == RTCDataChannelState::Open {
            trace!(target = "peer_session", label = %self.label, "channel open before attach");
            let _ = sink.send(RawChannelEvent::Open);
        }
    }

    async fn send(&self, data: ChannelData) -> Result<(), RtcError> {
        let result = match data {
            ChannelData::Text(text) => self.dc.send_text(text).await,
            ChannelData::Binary(bytes) => self.dc.send(&bytes).await,
        };
        result.map(|_| ()).map_err(|err| RtcError::Backend(err.to_string()))
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.dc.close().await?;
        Ok(())
    }
}
