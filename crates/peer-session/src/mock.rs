//! In-memory transport primitive.
//!
//! Peers created from the same [`MockNetwork`] find each other through the
//! endpoint id carried in their fake SDP. The mock follows the browser
//! signaling state machine closely enough to exercise glare, rollback and
//! renegotiation: negotiation-needed fires whenever local content (tracks,
//! data) differs from what has been negotiated and the peer is stable; a
//! side connects once it is stable, holds a remote description and has seen
//! a remote candidate; channels announce themselves in-band once both sides
//! are connected and have negotiated data.
//!
//! Like `webrtc-rs`, a peer refuses an ICE restart before it has gathered
//! and refuses to roll back a local offer. [`MockBackend::with_rollback`]
//! builds peers that accept rollback, as browsers do.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{DataChannelConfig, RtcConfig};
use crate::error::RtcError;
use crate::rtc::{
    ChannelData, ConnectionState, DataChannelTransport, IceCandidate, OfferOptions,
    PeerConnection, PeerEvent, PeerEventSender, RawChannelEvent, RawChannelSink, RtcBackend,
    SdpType, SessionDescription, SignalingState,
};

const CANDIDATE_PREFIX: &str = "candidate:mock ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MockTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl MockTrack {
    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MediaKind::Audio,
        }
    }

    pub fn video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MediaKind::Video,
        }
    }
}

/// Registry through which mock peers reach each other.
#[derive(Default)]
pub struct MockNetwork {
    peers: Mutex<HashMap<u64, Weak<MockPeer>>>,
    next_id: AtomicU64,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Live peers in creation order.
    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        let peers = self.peers.lock();
        let mut live: Vec<_> = peers.values().filter_map(Weak::upgrade).collect();
        live.sort_by_key(|peer| peer.id);
        live
    }

    fn lookup(&self, id: u64) -> Option<Arc<MockPeer>> {
        self.peers.lock().get(&id).and_then(Weak::upgrade)
    }
}

#[derive(Clone)]
pub struct MockBackend {
    network: Arc<MockNetwork>,
    rollback: bool,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            network: MockNetwork::new(),
            rollback: false,
        }
    }

    /// Peers that can roll back a local offer.
    pub fn with_rollback() -> Self {
        Self {
            rollback: true,
            ..Self::new()
        }
    }

    pub fn network(&self) -> &Arc<MockNetwork> {
        &self.network
    }

    pub fn peers_created(&self) -> u64 {
        self.network.next_id.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RtcBackend for MockBackend {
    type Peer = MockPeer;
    type Channel = MockChannel;
    type LocalTrack = MockTrack;
    type RemoteTrack = MockTrack;

    async fn create_peer(
        &self,
        _config: &RtcConfig,
        events: PeerEventSender<Self>,
    ) -> Result<Arc<MockPeer>, RtcError> {
        let id = self.network.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let peer = Arc::new(MockPeer {
            id,
            network: Arc::downgrade(&self.network),
            rollback: self.rollback,
            events,
            state: Mutex::new(PeerState::default()),
        });
        self.network
            .peers
            .lock()
            .insert(id, Arc::downgrade(&peer));
        Ok(peer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TrackInfo {
    id: String,
    kind: MediaKind,
    streams: Vec<String>,
}

/// What the fake SDP carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MockSdp {
    endpoint: u64,
    version: u64,
    data: bool,
    tracks: Vec<TrackInfo>,
    ice_restart: bool,
}

impl MockSdp {
    fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn decode(sdp: &str) -> Result<Self, RtcError> {
        serde_json::from_str(sdp).map_err(|err| RtcError::Sdp(err.to_string()))
    }
}

struct PeerState {
    signaling: SignalingState,
    connection: ConnectionState,
    version: u64,
    local_tracks: Vec<TrackInfo>,
    negotiated_tracks: HashSet<String>,
    wants_data: bool,
    data_negotiated: bool,
    pending_local: Option<MockSdp>,
    local: Option<MockSdp>,
    remote: Option<MockSdp>,
    remote_candidate: bool,
    candidates_sent: bool,
    negotiation_pending: bool,
    surfaced_tracks: HashSet<String>,
    channels: Vec<Arc<MockChannel>>,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            version: 0,
            local_tracks: Vec::new(),
            negotiated_tracks: HashSet::new(),
            wants_data: false,
            data_negotiated: false,
            pending_local: None,
            local: None,
            remote: None,
            remote_candidate: false,
            candidates_sent: false,
            negotiation_pending: false,
            surfaced_tracks: HashSet::new(),
            channels: Vec::new(),
        }
    }
}

impl PeerState {
    fn ensure_open(&self) -> Result<(), RtcError> {
        if self.signaling == SignalingState::Closed {
            return Err(RtcError::Closed);
        }
        Ok(())
    }

    fn needs_negotiation(&self) -> bool {
        let new_track = self
            .local_tracks
            .iter()
            .any(|track| !self.negotiated_tracks.contains(&track.id));
        new_track || (self.wants_data && !self.data_negotiated)
    }

    /// Returns true when a negotiation-needed event should be raised now.
    fn poke(&mut self) -> bool {
        if self.signaling != SignalingState::Stable
            || self.negotiation_pending
            || !self.needs_negotiation()
        {
            return false;
        }
        self.negotiation_pending = true;
        true
    }

    fn enter_stable(&mut self) {
        self.signaling = SignalingState::Stable;
        self.negotiation_pending = false;
    }

    fn association_ready(&self) -> bool {
        self.connection == ConnectionState::Connected && self.data_negotiated
    }

    fn invalid(&self) -> RtcError {
        RtcError::InvalidState(format!("{:?}", self.signaling))
    }
}

pub struct MockPeer {
    id: u64,
    network: Weak<MockNetwork>,
    rollback: bool,
    events: PeerEventSender<MockBackend>,
    state: Mutex<PeerState>,
}

impl MockPeer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Endpoint id of the peer this one negotiated with.
    pub fn remote_endpoint(&self) -> Option<u64> {
        self.state.lock().remote.as_ref().map(|sdp| sdp.endpoint)
    }

    pub fn data_negotiated(&self) -> bool {
        self.state.lock().data_negotiated
    }

    /// Simulates a network failure seen only by this side.
    pub fn fail(&self) {
        let changed = {
            let mut state = self.state.lock();
            if state.connection.is_terminal() {
                false
            } else {
                state.connection = ConnectionState::Failed;
                true
            }
        };
        if changed {
            self.emit(PeerEvent::ConnectionState(ConnectionState::Failed));
        }
    }

    fn emit(&self, event: PeerEvent<MockBackend>) {
        let _ = self.events.send(event);
    }

    fn remote_peer(&self) -> Option<Arc<MockPeer>> {
        let endpoint = self.remote_endpoint()?;
        self.network.upgrade()?.lookup(endpoint)
    }

    fn gather(&self, state: &mut PeerState, ice_restart: bool) {
        if state.candidates_sent && !ice_restart {
            return;
        }
        state.candidates_sent = true;
        self.emit(PeerEvent::IceCandidate(Some(IceCandidate {
            candidate: format!("{CANDIDATE_PREFIX}{} 1 udp 2122260223 127.0.0.1 9 typ host", self.id),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })));
        self.emit(PeerEvent::IceCandidate(None));
    }

    fn surface_tracks(&self, state: &mut PeerState, sdp: &MockSdp) {
        for track in &sdp.tracks {
            if state.surfaced_tracks.insert(track.id.clone()) {
                self.emit(PeerEvent::Track {
                    track: MockTrack {
                        id: track.id.clone(),
                        kind: track.kind,
                    },
                    streams: track.streams.clone(),
                });
            }
        }
    }

    fn raise_negotiation(&self, state: &mut PeerState) {
        if state.poke() {
            self.emit(PeerEvent::NegotiationNeeded);
        }
    }

    /// Connects when possible, then lets both sides announce pending channels.
    fn progress(&self) {
        let connected = {
            let mut state = self.state.lock();
            let ready = matches!(
                state.connection,
                ConnectionState::New | ConnectionState::Connecting
            ) && state.signaling == SignalingState::Stable
                && state.remote.is_some()
                && state.remote_candidate;
            if ready {
                if state.connection == ConnectionState::New {
                    self.emit(PeerEvent::ConnectionState(ConnectionState::Connecting));
                }
                state.connection = ConnectionState::Connected;
                self.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
            }
            state.connection == ConnectionState::Connected
        };
        if !connected {
            return;
        }
        self.flush_channels();
        if let Some(remote) = self.remote_peer() {
            remote.flush_channels();
        }
    }

    fn flush_channels(&self) {
        let pending: Vec<_> = {
            let state = self.state.lock();
            if !state.association_ready() {
                return;
            }
            state
                .channels
                .iter()
                .filter(|channel| channel.awaiting_announce())
                .cloned()
                .collect()
        };
        if pending.is_empty() {
            return;
        }
        let Some(remote) = self.remote_peer() else {
            return;
        };
        if !remote.state.lock().association_ready() {
            return;
        }
        for channel in pending {
            if channel.mark_announced() {
                remote.accept_channel(&channel);
            }
        }
    }

    fn accept_channel(&self, local: &Arc<MockChannel>) {
        let channel = MockChannel::new(local.label.clone(), local.config.clone(), true);
        channel.link(local);
        local.link(&channel);
        self.state.lock().channels.push(channel.clone());
        self.emit(PeerEvent::DataChannel(channel.clone()));
        local.mark_open();
        channel.mark_open();
    }

    fn remote_closed(&self) {
        let channels = {
            let mut state = self.state.lock();
            if state.connection.is_terminal() {
                return;
            }
            state.connection = ConnectionState::Failed;
            std::mem::take(&mut state.channels)
        };
        self.emit(PeerEvent::ConnectionState(ConnectionState::Disconnected));
        self.emit(PeerEvent::ConnectionState(ConnectionState::Failed));
        for channel in channels {
            channel.shut();
        }
    }
}

#[async_trait]
impl PeerConnection<MockBackend> for MockPeer {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, RtcError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if !matches!(
            state.signaling,
            SignalingState::Stable | SignalingState::HaveLocalOffer
        ) {
            return Err(state.invalid());
        }
        if options.ice_restart && !state.candidates_sent {
            return Err(RtcError::InvalidState("ICE restart before gathering".into()));
        }
        state.version += 1;
        let sdp = MockSdp {
            endpoint: self.id,
            version: state.version,
            data: state.wants_data || state.data_negotiated,
            tracks: state.local_tracks.clone(),
            ice_restart: options.ice_restart,
        };
        Ok(SessionDescription::offer(sdp.encode()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let Some(remote) = state.remote.clone() else {
            return Err(state.invalid());
        };
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(state.invalid());
        }
        state.version += 1;
        let tracks = state
            .local_tracks
            .iter()
            .filter(|track| state.negotiated_tracks.contains(&track.id))
            .cloned()
            .collect();
        let sdp = MockSdp {
            endpoint: self.id,
            version: state.version,
            data: remote.data,
            tracks,
            ice_restart: false,
        };
        Ok(SessionDescription::answer(sdp.encode()))
    }

    async fn apply_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        if description.sdp_type == SdpType::Rollback {
            return self.rollback().await;
        }
        let sdp = MockSdp::decode(&description.sdp)?;
        if sdp.endpoint != self.id {
            return Err(RtcError::Sdp("description belongs to another endpoint".into()));
        }
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            match description.sdp_type {
                SdpType::Offer => {
                    if !matches!(
                        state.signaling,
                        SignalingState::Stable | SignalingState::HaveLocalOffer
                    ) {
                        return Err(state.invalid());
                    }
                    state.signaling = SignalingState::HaveLocalOffer;
                    state.negotiation_pending = false;
                    self.gather(&mut state, sdp.ice_restart);
                    state.pending_local = Some(sdp);
                }
                SdpType::Answer => {
                    if state.signaling != SignalingState::HaveRemoteOffer {
                        return Err(state.invalid());
                    }
                    state.data_negotiated =
                        state.remote.as_ref().map(|remote| remote.data).unwrap_or(false);
                    state.enter_stable();
                    self.gather(&mut state, false);
                    state.local = Some(sdp);
                    self.raise_negotiation(&mut state);
                }
                SdpType::Pranswer | SdpType::Rollback => return Err(state.invalid()),
            }
        }
        self.progress();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        if description.sdp_type == SdpType::Rollback {
            return Err(RtcError::Sdp("remote rollback is not supported".into()));
        }
        let sdp = MockSdp::decode(&description.sdp)?;
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            match description.sdp_type {
                SdpType::Offer => {
                    if state.signaling != SignalingState::Stable {
                        return Err(state.invalid());
                    }
                    state.signaling = SignalingState::HaveRemoteOffer;
                    self.surface_tracks(&mut state, &sdp);
                    state.remote = Some(sdp);
                }
                SdpType::Answer => {
                    if state.signaling != SignalingState::HaveLocalOffer {
                        return Err(state.invalid());
                    }
                    let Some(offer) = state.pending_local.take() else {
                        return Err(state.invalid());
                    };
                    state
                        .negotiated_tracks
                        .extend(offer.tracks.iter().map(|track| track.id.clone()));
                    state.data_negotiated = offer.data && sdp.data;
                    state.local = Some(offer);
                    state.enter_stable();
                    self.surface_tracks(&mut state, &sdp);
                    state.remote = Some(sdp);
                    self.raise_negotiation(&mut state);
                }
                SdpType::Pranswer | SdpType::Rollback => return Err(state.invalid()),
            }
        }
        self.progress();
        Ok(())
    }

    async fn rollback(&self) -> Result<(), RtcError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        match state.signaling {
            SignalingState::Stable => Ok(()),
            SignalingState::HaveLocalOffer if !self.rollback => Err(RtcError::InvalidState(
                "rollback from HaveLocalOffer".into(),
            )),
            SignalingState::HaveLocalOffer => {
                state.pending_local = None;
                state.enter_stable();
                self.raise_negotiation(&mut state);
                Ok(())
            }
            _ => Err(state.invalid()),
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            let Some(remote) = state.remote.as_ref() else {
                return Err(RtcError::Candidate("no remote description".into()));
            };
            let endpoint = candidate
                .candidate
                .strip_prefix(CANDIDATE_PREFIX)
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|id| id.parse::<u64>().ok());
            if endpoint != Some(remote.endpoint) {
                return Err(RtcError::Candidate(candidate.candidate));
            }
            state.remote_candidate = true;
        }
        self.progress();
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        config: &DataChannelConfig,
    ) -> Result<Arc<MockChannel>, RtcError> {
        let channel = MockChannel::new(label.to_string(), config.clone(), false);
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            state.wants_data = true;
            state.channels.push(channel.clone());
            self.raise_negotiation(&mut state);
        }
        self.flush_channels();
        Ok(channel)
    }

    async fn add_track(&self, track: MockTrack, streams: &[String]) -> Result<(), RtcError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.local_tracks.iter().any(|existing| existing.id == track.id) {
            return Err(RtcError::Backend(format!("track {} already added", track.id)));
        }
        state.local_tracks.push(TrackInfo {
            id: track.id,
            kind: track.kind,
            streams: streams.to_vec(),
        });
        self.raise_negotiation(&mut state);
        Ok(())
    }

    async fn close(&self) -> Result<(), RtcError> {
        let channels = {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return Ok(());
            }
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            std::mem::take(&mut state.channels)
        };
        self.emit(PeerEvent::ConnectionState(ConnectionState::Closed));
        for channel in channels {
            channel.shut();
        }
        if let Some(remote) = self.remote_peer() {
            remote.remote_closed();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyState {
    Connecting,
    Open,
    Closed,
}

struct ChannelState {
    ready: ReadyState,
    announced: bool,
    sink: Option<RawChannelSink>,
    backlog: Vec<RawChannelEvent>,
    remote: Weak<MockChannel>,
}

/// Mock data channel. Events raised before [`DataChannelTransport::attach`]
/// are buffered and replayed on attach.
pub struct MockChannel {
    label: String,
    config: DataChannelConfig,
    state: Mutex<ChannelState>,
}

impl MockChannel {
    fn new(label: String, config: DataChannelConfig, announced: bool) -> Arc<Self> {
        Arc::new(Self {
            label,
            config,
            state: Mutex::new(ChannelState {
                ready: ReadyState::Connecting,
                announced,
                sink: None,
                backlog: Vec::new(),
                remote: Weak::new(),
            }),
        })
    }

    /// A channel with no peer behind it; drive it with [`MockChannel::inject`].
    pub fn detached(label: impl Into<String>) -> Arc<Self> {
        Self::new(label.into(), DataChannelConfig::default(), true)
    }

    pub fn config(&self) -> &DataChannelConfig {
        &self.config
    }

    /// Raise `event` as if the primitive had.
    pub fn inject(&self, event: RawChannelEvent) {
        {
            let mut state = self.state.lock();
            match event {
                RawChannelEvent::Open if state.ready == ReadyState::Connecting => {
                    state.ready = ReadyState::Open;
                }
                RawChannelEvent::Close => state.ready = ReadyState::Closed,
                _ => {}
            }
        }
        self.raise(event);
    }

    fn raise(&self, event: RawChannelEvent) {
        let mut state = self.state.lock();
        match &state.sink {
            Some(sink) => {
                let _ = sink.send(event);
            }
            None => state.backlog.push(event),
        }
    }

    fn link(&self, remote: &Arc<MockChannel>) {
        self.state.lock().remote = Arc::downgrade(remote);
    }

    fn awaiting_announce(&self) -> bool {
        let state = self.state.lock();
        !state.announced && state.ready == ReadyState::Connecting
    }

    fn mark_announced(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.announced, true)
    }

    fn mark_open(&self) {
        {
            let mut state = self.state.lock();
            if state.ready != ReadyState::Connecting {
                return;
            }
            state.ready = ReadyState::Open;
        }
        self.raise(RawChannelEvent::Open);
    }

    /// Close this end only.
    fn shut(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.ready == ReadyState::Closed {
                return false;
            }
            state.ready = ReadyState::Closed;
        }
        self.raise(RawChannelEvent::Close);
        true
    }
}

#[async_trait]
impl DataChannelTransport for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn attach(&self, sink: RawChannelSink) {
        let mut state = self.state.lock();
        for event in state.backlog.drain(..) {
            let _ = sink.send(event);
        }
        state.sink = Some(sink);
    }

    async fn send(&self, data: ChannelData) -> Result<(), RtcError> {
        let remote = {
            let state = self.state.lock();
            if state.ready != ReadyState::Open {
                return Err(RtcError::ChannelClosed);
            }
            state.remote.upgrade()
        };
        let Some(remote) = remote else {
            return Err(RtcError::ChannelClosed);
        };
        remote.raise(RawChannelEvent::Message(data));
        Ok(())
    }

    async fn close(&self) -> Result<(), RtcError> {
        let remote = self.state.lock().remote.upgrade();
        if self.shut() {
            if let Some(remote) = remote {
                remote.shut();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Side {
        peer: Arc<MockPeer>,
        events: mpsc::UnboundedReceiver<PeerEvent<MockBackend>>,
    }

    impl Side {
        async fn new(backend: &MockBackend) -> Self {
            let (tx, events) = mpsc::unbounded_channel();
            let peer = backend.create_peer(&RtcConfig::localhost(), tx).await.unwrap();
            Self { peer, events }
        }

        fn drain(&mut self) -> Vec<PeerEvent<MockBackend>> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn candidates(&mut self) -> Vec<IceCandidate> {
            self.drain()
                .into_iter()
                .filter_map(|event| match event {
                    PeerEvent::IceCandidate(candidate) => candidate,
                    _ => None,
                })
                .collect()
        }
    }

    fn first_offer() -> OfferOptions {
        OfferOptions {
            ice_restart: false,
            ..OfferOptions::initial()
        }
    }

    async fn connect(offerer: &mut Side, answerer: &mut Side) {
        let offer = offerer.peer.create_offer(first_offer()).await.unwrap();
        offerer.peer.apply_local_description(offer.clone()).await.unwrap();
        answerer.peer.set_remote_description(offer).await.unwrap();
        let answer = answerer.peer.set_local_description().await.unwrap();
        offerer.peer.set_remote_description(answer).await.unwrap();
        for candidate in offerer.candidates() {
            answerer.peer.add_ice_candidate(candidate).await.unwrap();
        }
        for candidate in answerer.candidates() {
            offerer.peer.add_ice_candidate(candidate).await.unwrap();
        }
    }

    #[tokio::test]
    async fn offer_answer_connects_and_opens_channels() {
        let backend = MockBackend::new();
        let mut hub = Side::new(&backend).await;
        let mut client = Side::new(&backend).await;

        let channel = hub
            .peer
            .create_data_channel("chat", &DataChannelConfig::default())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.attach(tx);

        connect(&mut hub, &mut client).await;

        assert_eq!(hub.peer.connection_state(), ConnectionState::Connected);
        assert_eq!(client.peer.connection_state(), ConnectionState::Connected);
        assert_eq!(rx.recv().await, Some(RawChannelEvent::Open));

        let surfaced = client
            .drain()
            .into_iter()
            .find_map(|event| match event {
                PeerEvent::DataChannel(channel) => Some(channel),
                _ => None,
            })
            .expect("client should see the hub's channel");
        assert_eq!(surfaced.label(), "chat");

        let (tx, mut remote_rx) = mpsc::unbounded_channel();
        surfaced.attach(tx);
        assert_eq!(remote_rx.recv().await, Some(RawChannelEvent::Open));
        channel.send(ChannelData::from("hello")).await.unwrap();
        assert_eq!(
            remote_rx.recv().await,
            Some(RawChannelEvent::Message(ChannelData::from("hello")))
        );
    }

    #[tokio::test]
    async fn rollback_returns_to_stable_and_renegotiates() {
        let backend = MockBackend::with_rollback();
        let mut hub = Side::new(&backend).await;
        let mut client = Side::new(&backend).await;
        connect(&mut hub, &mut client).await;
        client.drain();

        client.peer.add_track(MockTrack::audio("mic"), &["stream".into()]).await.unwrap();
        assert!(client
            .drain()
            .iter()
            .any(|event| matches!(event, PeerEvent::NegotiationNeeded)));

        client.peer.set_local_description().await.unwrap();
        assert_eq!(client.peer.signaling_state(), SignalingState::HaveLocalOffer);
        client.peer.rollback().await.unwrap();
        assert_eq!(client.peer.signaling_state(), SignalingState::Stable);
        assert!(client
            .drain()
            .iter()
            .any(|event| matches!(event, PeerEvent::NegotiationNeeded)));
    }

    #[tokio::test]
    async fn refuses_what_webrtc_rs_refuses() {
        let backend = MockBackend::new();
        let mut hub = Side::new(&backend).await;
        let mut client = Side::new(&backend).await;
        assert!(matches!(
            hub.peer.create_offer(OfferOptions::initial()).await,
            Err(RtcError::InvalidState(_))
        ));

        connect(&mut hub, &mut client).await;
        hub.peer.create_offer(OfferOptions::initial()).await.unwrap();

        client.peer.add_track(MockTrack::audio("mic"), &[]).await.unwrap();
        client.peer.set_local_description().await.unwrap();
        assert!(matches!(
            client.peer.rollback().await,
            Err(RtcError::InvalidState(_))
        ));
        assert_eq!(client.peer.signaling_state(), SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn close_fails_the_remote_side() {
        let backend = MockBackend::new();
        let mut hub = Side::new(&backend).await;
        let mut client = Side::new(&backend).await;
        connect(&mut hub, &mut client).await;
        client.drain();

        hub.peer.close().await.unwrap();
        assert_eq!(client.peer.connection_state(), ConnectionState::Failed);
        assert!(client.drain().iter().any(|event| matches!(
            event,
            PeerEvent::ConnectionState(ConnectionState::Failed)
        )));
        assert!(matches!(
            hub.peer.create_offer(OfferOptions::default()).await,
            Err(RtcError::Closed)
        ));
    }

    #[tokio::test]
    async fn candidate_before_remote_description_is_rejected() {
        let backend = MockBackend::new();
        let hub = Side::new(&backend).await;
        let candidate = IceCandidate {
            candidate: format!("{CANDIDATE_PREFIX}7 1 udp 1 127.0.0.1 9 typ host"),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        assert!(matches!(
            hub.peer.add_ice_candidate(candidate).await,
            Err(RtcError::Candidate(_))
        ));
    }
}
