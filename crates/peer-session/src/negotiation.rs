//! Perfect-negotiation bookkeeping shared by both session roles.

use std::sync::Arc;

use relay_bus::{Identity, MessageKind, Relay, RelayMessage, RelayResult};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SessionResult;
use crate::rtc::{
    IceCandidate, OfferOptions, PeerConnection, RtcBackend, SdpType, SessionDescription,
    SignalingState,
};

/// Coarse handshake phase exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No description exchanged yet.
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

/// How a side resolves an offer collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Politeness {
    /// Rolls back its own offer and accepts the remote one.
    Polite,
    /// Keeps its own offer and ignores the remote one.
    Impolite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionOutcome {
    /// Colliding offer dropped by the impolite side.
    IgnoredCollision,
    /// Same description delivered twice.
    Duplicate,
    AppliedAnswer,
    Answered { rolled_back: bool },
}

/// Sends negotiation messages to one fixed remote.
#[derive(Clone)]
pub(crate) struct Signaler {
    relay: Arc<dyn Relay>,
    remote: Identity,
}

impl Signaler {
    pub(crate) fn new(relay: Arc<dyn Relay>, remote: Identity) -> Self {
        Self { relay, remote }
    }

    pub(crate) fn remote(&self) -> &Identity {
        &self.remote
    }

    pub(crate) fn send<T: Serialize + ?Sized>(
        &self,
        kind: MessageKind,
        payload: &T,
    ) -> RelayResult<()> {
        self.relay
            .publish(RelayMessage::new(self.remote.clone(), kind, payload)?)
    }
}

/// Per-peer negotiation bookkeeping.
///
/// Collisions are avoided before they are resolved: the polite side does not
/// offer on its own but asks for a turn with RENEGOTIATE, and offers once the
/// impolite side echoes RENEGOTIATE back. While a turn is granted the
/// impolite side defers its own negotiation until it has answered. Rollback
/// stays as the fallback when an offer collides anyway.
pub(crate) struct Negotiator {
    politeness: Politeness,
    making_offer: bool,
    setting_remote_answer_pending: bool,
    negotiated: bool,
    last_remote: Option<SessionDescription>,
    turn: Turn,
}

/// Who may offer next, beyond what the signaling state says.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Turn {
    /// Polite: RENEGOTIATE sent, grant not received yet.
    requested: bool,
    /// Polite: grant received while an exchange was still open.
    held: bool,
    /// Impolite: the remote holds the turn.
    granted: bool,
    /// Impolite: the remote asked while an exchange was open.
    grant_pending: bool,
    /// Impolite: local negotiation postponed while the remote holds the turn.
    deferred: bool,
}

impl Negotiator {
    pub(crate) fn new(politeness: Politeness) -> Self {
        Self {
            politeness,
            making_offer: false,
            setting_remote_answer_pending: false,
            negotiated: false,
            last_remote: None,
            turn: Turn::default(),
        }
    }

    pub(crate) fn state(&self, signaling: SignalingState) -> NegotiationState {
        match signaling {
            SignalingState::Closed => NegotiationState::Closed,
            SignalingState::HaveLocalOffer | SignalingState::HaveLocalPranswer => {
                NegotiationState::HaveLocalOffer
            }
            SignalingState::HaveRemoteOffer | SignalingState::HaveRemotePranswer => {
                NegotiationState::HaveRemoteOffer
            }
            SignalingState::Stable if self.negotiated => NegotiationState::Stable,
            SignalingState::Stable => NegotiationState::Idle,
        }
    }

    fn ready_for_offer(&self, signaling: SignalingState) -> bool {
        !self.making_offer
            && (signaling == SignalingState::Stable || self.setting_remote_answer_pending)
    }

    fn idle(&self, peer_signaling: SignalingState) -> bool {
        !self.making_offer && peer_signaling == SignalingState::Stable
    }

    /// Creates an explicit offer with `options` and sends it as `kind`. An
    /// ICE restart is only requested once the peer has negotiated before; a
    /// fresh peer gathers fresh credentials anyway.
    pub(crate) async fn offer<B: RtcBackend>(
        &mut self,
        peer: &B::Peer,
        mut options: OfferOptions,
        kind: MessageKind,
        signaler: &Signaler,
    ) -> SessionResult<()> {
        options.ice_restart &= self.negotiated;
        self.making_offer = true;
        let result: SessionResult<()> = async {
            let offer = peer.create_offer(options).await?;
            peer.apply_local_description(offer.clone()).await?;
            signaler.send(kind, &offer)?;
            Ok(())
        }
        .await;
        self.making_offer = false;
        self.negotiated |= result.is_ok();
        result
    }

    /// Offers with the primitive's implicit description, as DESCRIPTION.
    async fn implicit_offer<B: RtcBackend>(
        &mut self,
        peer: &B::Peer,
        signaler: &Signaler,
    ) -> SessionResult<()> {
        self.making_offer = true;
        let result: SessionResult<()> = async {
            let description = peer.set_local_description().await?;
            signaler.send(MessageKind::Description, &description)?;
            Ok(())
        }
        .await;
        self.making_offer = false;
        result
    }

    /// Reacts to the primitive asking for renegotiation. Returns true when an
    /// offer or a turn request went out, false when the request was skipped
    /// or postponed.
    pub(crate) async fn negotiation_needed<B: RtcBackend>(
        &mut self,
        peer: &B::Peer,
        signaler: &Signaler,
    ) -> SessionResult<bool> {
        let signaling = peer.signaling_state();
        if signaling != SignalingState::Stable {
            debug!(target = "peer_session", ?signaling, "skipping negotiation-needed");
            return Ok(false);
        }
        match self.politeness {
            Politeness::Impolite if self.turn.granted => {
                debug!(target = "peer_session", "remote holds the turn; deferring negotiation");
                self.turn.deferred = true;
                Ok(false)
            }
            Politeness::Impolite => self.implicit_offer::<B>(peer, signaler).await.map(|_| true),
            Politeness::Polite if self.turn.held => {
                self.turn.held = false;
                self.implicit_offer::<B>(peer, signaler).await.map(|_| true)
            }
            Politeness::Polite if self.turn.requested => Ok(false),
            Politeness::Polite => {
                debug!(target = "peer_session", remote = %signaler.remote(), "requesting a turn to offer");
                signaler.send(MessageKind::Renegotiate, &())?;
                self.turn.requested = true;
                Ok(true)
            }
        }
    }

    /// Handles RENEGOTIATE: a turn request on the impolite side, a grant on
    /// the polite side.
    pub(crate) async fn renegotiate<B: RtcBackend>(
        &mut self,
        peer: &B::Peer,
        signaler: &Signaler,
    ) -> SessionResult<()> {
        match self.politeness {
            Politeness::Impolite => self.turn.grant_pending = true,
            Politeness::Polite => {
                self.turn.requested = false;
                self.turn.held = true;
            }
        }
        self.settle::<B>(peer, signaler).await
    }

    /// Acts on turn bookkeeping that was waiting for a stable exchange.
    async fn settle<B: RtcBackend>(
        &mut self,
        peer: &B::Peer,
        signaler: &Signaler,
    ) -> SessionResult<()> {
        if !self.idle(peer.signaling_state()) {
            return Ok(());
        }
        match self.politeness {
            Politeness::Polite if self.turn.held => {
                self.turn.held = false;
                self.implicit_offer::<B>(peer, signaler).await
            }
            Politeness::Polite => Ok(()),
            Politeness::Impolite if self.turn.granted => Ok(()),
            Politeness::Impolite if self.turn.deferred => {
                self.turn.deferred = false;
                self.implicit_offer::<B>(peer, signaler).await
            }
            Politeness::Impolite if self.turn.grant_pending => {
                debug!(target = "peer_session", remote = %signaler.remote(), "granting the turn");
                signaler.send(MessageKind::Renegotiate, &())?;
                self.turn.grant_pending = false;
                self.turn.granted = true;
                Ok(())
            }
            Politeness::Impolite => Ok(()),
        }
    }

    /// Applies a remote offer or answer. Offers are answered with a message
    /// of kind `answer_kind`.
    pub(crate) async fn remote_description<B: RtcBackend>(
        &mut self,
        peer: &B::Peer,
        description: SessionDescription,
        answer_kind: MessageKind,
        signaler: &Signaler,
    ) -> SessionResult<DescriptionOutcome> {
        if self.last_remote.as_ref() == Some(&description) {
            return Ok(DescriptionOutcome::Duplicate);
        }
        let is_offer = description.is_offer();
        let signaling = peer.signaling_state();
        let collision = is_offer && !self.ready_for_offer(signaling);
        if collision {
            match self.politeness {
                Politeness::Impolite => {
                    info!(target = "peer_session", remote = %signaler.remote(), "ignoring colliding offer");
                    return Ok(DescriptionOutcome::IgnoredCollision);
                }
                Politeness::Polite => {
                    info!(target = "peer_session", remote = %signaler.remote(), "rolling back local offer");
                    if let Err(err) = peer.rollback().await {
                        warn!(target = "peer_session", error = %err, "rollback refused; dropping remote offer");
                        return Ok(DescriptionOutcome::IgnoredCollision);
                    }
                }
            }
        }

        self.setting_remote_answer_pending = description.sdp_type == SdpType::Answer;
        let applied = peer.set_remote_description(description.clone()).await;
        self.setting_remote_answer_pending = false;
        applied?;
        self.negotiated = true;
        self.last_remote = Some(description);

        let outcome = if is_offer {
            let answer = peer.set_local_description().await?;
            signaler.send(answer_kind, &answer)?;
            // The remote used its turn.
            self.turn.granted = false;
            DescriptionOutcome::Answered {
                rolled_back: collision,
            }
        } else {
            DescriptionOutcome::AppliedAnswer
        };
        if let Err(err) = self.settle::<B>(peer, signaler).await {
            warn!(target = "peer_session", error = %err, "follow-up negotiation failed");
        }
        Ok(outcome)
    }

    pub(crate) async fn remote_candidate<B: RtcBackend>(
        &self,
        peer: &B::Peer,
        candidate: IceCandidate,
    ) {
        if let Err(err) = peer.add_ice_candidate(candidate).await {
            debug!(target = "peer_session", error = %err, "ignoring remote candidate");
        }
    }
}
