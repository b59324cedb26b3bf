#![cfg(feature = "webrtc-backend")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use common::{connect, eventually, expect_kind, message_text, next_event, Net};
use peer_session::{
    DataChannelConfig, EventFilter, EventKind, NegotiationState, RtcConfig, SessionConfig,
    SessionEvent, WebRtcBackend,
};
use tokio::task::JoinHandle;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn loopback() -> Result<Net<WebRtcBackend>> {
    Ok(Net::on(
        WebRtcBackend::new()?,
        SessionConfig::default().with_rtc(RtcConfig::localhost()),
    ))
}

fn opus(id: &str, stream: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        id.to_owned(),
        stream.to_owned(),
    ))
}

/// Remote tracks only surface once packets arrive, so keep some flowing.
fn feed(track: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let frame = Duration::from_millis(20);
        loop {
            let sample = Sample {
                data: Bytes::from_static(&[0xf8, 0xff, 0xfe]),
                duration: frame,
                ..Default::default()
            };
            if track.write_sample(&sample).await.is_err() {
                return;
            }
            tokio::time::sleep(frame).await;
        }
    })
}

#[test_timeout::tokio_timeout_test]
async fn declared_channel_carries_text_over_webrtc() -> Result<()> {
    let net = loopback()?;
    let hub = net.hub();
    hub.add_data_channel("chat", DataChannelConfig::ordered()).await?;

    let alice = net.client("alice");
    let mut alice_chat = alice.events(EventFilter::all().on_channel("chat"));
    connect(&hub, &alice, "alice").await?;
    expect_kind(&mut alice_chat, EventKind::ChannelOpen).await?;
    eventually("hub side of chat open", || {
        hub.get_session("alice")
            .and_then(|session| session.get_channel("chat"))
            .map(|channel| channel.is_open())
            .unwrap_or(false)
    })
    .await?;

    assert_eq!(hub.send_data("chat", "hi").await, 1);
    let received = expect_kind(&mut alice_chat, EventKind::ChannelMessage).await?;
    assert_eq!(message_text(&received).as_deref(), Some("hi"));

    let session = hub.get_session("alice").context("hub session")?;
    eventually("both sides stable", || {
        session.negotiation_state() == NegotiationState::Stable
            && alice.negotiation_state() == NegotiationState::Stable
    })
    .await?;

    alice.close().await;
    hub.shutdown().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn simultaneous_tracks_converge_over_webrtc() -> Result<()> {
    let net = loopback()?;
    let hub = net.hub();
    hub.add_data_channel("chat", DataChannelConfig::ordered()).await?;
    let alice = net.client("alice");
    connect(&hub, &alice, "alice").await?;

    let mut hub_tracks = hub.events(EventFilter::kind(EventKind::SessionTrack));
    let mut alice_tracks = alice.events(EventFilter::kind(EventKind::SessionTrack));
    let speaker = opus("speaker", "hub");
    let mic = opus("mic", "alice");
    let (hub_added, alice_added) = tokio::join!(
        hub.add_track(speaker.clone() as Arc<dyn TrackLocal + Send + Sync>, vec![]),
        alice.add_track(mic.clone() as Arc<dyn TrackLocal + Send + Sync>, vec![]),
    );
    assert_eq!(hub_added, 1);
    alice_added?;
    let feeders = [feed(speaker), feed(mic)];

    match next_event(&mut hub_tracks).await? {
        SessionEvent::Track { remote, track, .. } => {
            assert_eq!(remote.as_str(), "alice");
            assert_eq!(track.0.id(), "mic");
        }
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&mut alice_tracks).await? {
        SessionEvent::Track { track, .. } => assert_eq!(track.0.id(), "speaker"),
        other => panic!("unexpected event {other:?}"),
    }

    let session = hub.get_session("alice").context("session")?;
    eventually("both sides stable", || {
        session.negotiation_state() == NegotiationState::Stable
            && alice.negotiation_state() == NegotiationState::Stable
    })
    .await?;
    assert!(session.is_connected());
    assert!(alice.is_connected());

    for feeder in feeders {
        feeder.abort();
    }
    alice.close().await;
    hub.shutdown().await;
    Ok(())
}
