mod common;

use std::time::Duration;

use anyhow::{Context, Result};
use common::{connect, eventually, expect_kind, message_text, next_event, Net};
use peer_session::mock::MockTrack;
use peer_session::relay_bus::{MessageKind, RelayFilter, RelayMessage};
use peer_session::{
    ChannelEvent, DataChannelConfig, EventFilter, EventKind, HubConfig, NegotiationState,
    SessionConfig, SessionError, SessionEvent,
};

#[test_timeout::tokio_timeout_test]
async fn declared_channel_carries_chat_both_ways() -> Result<()> {
    let net = Net::new();
    let hub = net.hub();
    hub.add_data_channel("chat", DataChannelConfig::ordered()).await?;

    let alice = net.client("alice");
    let mut hub_chat = hub.events(EventFilter::all().from_remote("alice").on_channel("chat"));
    let mut alice_chat = alice.events(EventFilter::all().on_channel("chat"));
    connect(&hub, &alice, "alice").await?;

    expect_kind(&mut hub_chat, EventKind::ChannelOpen).await?;
    expect_kind(&mut alice_chat, EventKind::ChannelOpen).await?;

    assert_eq!(hub.send_data("chat", "hello").await, 1);
    let received = expect_kind(&mut alice_chat, EventKind::ChannelMessage).await?;
    assert_eq!(message_text(&received).as_deref(), Some("hello"));

    let channel = alice.get_channel("chat").context("alice has chat")?;
    channel.send("hi hub").await?;
    let received = expect_kind(&mut hub_chat, EventKind::ChannelMessage).await?;
    assert_eq!(received.remote().as_str(), "alice");
    assert_eq!(message_text(&received).as_deref(), Some("hi hub"));

    let session = hub.get_session("alice").context("hub session")?;
    assert_eq!(session.channel_labels(), vec!["chat".to_string()]);
    assert_eq!(session.negotiation_state(), NegotiationState::Stable);
    assert_eq!(alice.negotiation_state(), NegotiationState::Stable);
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_connect_keeps_the_first_session() -> Result<()> {
    let net = Net::new();
    let hub = net.hub();
    let alice = net.client("alice");

    let mut opened = hub.events(EventFilter::kind(EventKind::SessionOpen));
    alice.connect()?;
    alice.connect()?;
    next_event(&mut opened).await?;

    assert_eq!(hub.sessions().len(), 1);
    assert_eq!(hub.get_session("alice").context("session")?.id(), 1);
    // One peer on each side.
    assert_eq!(net.backend.peers_created(), 2);
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn early_declarations_open_once_each() -> Result<()> {
    let net = Net::new();
    let hub = net.hub();
    hub.add_data_channel("chat", DataChannelConfig::ordered()).await?;
    hub.add_data_channel("telemetry", DataChannelConfig::unordered()).await?;

    let alice = net.client("alice");
    let mut opened = alice.events(EventFilter::kind(EventKind::ChannelOpen));
    connect(&hub, &alice, "alice").await?;

    let mut labels = vec![
        next_event(&mut opened).await?.channel_label().map(str::to_string),
        next_event(&mut opened).await?.channel_label().map(str::to_string),
    ];
    labels.sort();
    assert_eq!(labels, vec![Some("chat".to_string()), Some("telemetry".to_string())]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(opened.try_recv().is_none());
    assert_eq!(alice.channel_labels(), vec!["chat".to_string(), "telemetry".to_string()]);
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn late_declaration_reaches_connected_sessions() -> Result<()> {
    let net = Net::new();
    let hub = net.hub();
    let alice = net.client("alice");
    let bob = net.client("bob");
    connect(&hub, &alice, "alice").await?;
    connect(&hub, &bob, "bob").await?;

    let mut alice_files = alice.events(EventFilter::kind(EventKind::ChannelOpen).on_channel("files"));
    let mut bob_files = bob.events(EventFilter::kind(EventKind::ChannelOpen).on_channel("files"));
    hub.add_data_channel("files", DataChannelConfig::unordered()).await?;

    next_event(&mut alice_files).await?;
    next_event(&mut bob_files).await?;
    eventually("hub side of files open", || {
        ["alice", "bob"].iter().all(|remote| {
            hub.get_session(remote)
                .and_then(|session| session.get_channel("files"))
                .map(|channel| channel.is_open())
                .unwrap_or(false)
        })
    })
    .await?;
    assert_eq!(hub.send_data("files", vec![1u8, 2, 3]).await, 2);
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn declarations_are_unique_and_replayed_once() -> Result<()> {
    let net = Net::new();
    let hub = net.hub();
    hub.add_data_channel("chat", DataChannelConfig::ordered()).await?;
    let err = hub
        .add_data_channel("chat", DataChannelConfig::unordered())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::DuplicateDeclaration(label) if label == "chat"));
    assert_eq!(hub.declarations().len(), 1);

    let alice = net.client("alice");
    let mut alice_chat = alice.events(EventFilter::kind(EventKind::ChannelOpen));
    connect(&hub, &alice, "alice").await?;
    let opened = next_event(&mut alice_chat).await?;
    assert_eq!(opened.channel_label(), Some("chat"));
    assert_eq!(alice.channel_labels(), vec!["chat".to_string()]);

    let session = hub.get_session("alice").context("session")?;
    let err = session
        .create_data_channel("chat", DataChannelConfig::ordered())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ChannelExists(_)));
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn messages_from_unknown_remotes_are_ignored() -> Result<()> {
    let net = Net::new();
    let hub = net.hub();
    let mallory = net.port("mallory");
    mallory.publish(RelayMessage::empty("hub", MessageKind::Answer))?;
    mallory.publish(RelayMessage::empty("hub", MessageKind::Description))?;
    mallory.publish(RelayMessage::empty("hub", MessageKind::Renegotiate))?;
    mallory.publish(RelayMessage::empty("hub", MessageKind::Candidate))?;
    mallory.publish(RelayMessage::empty("hub", MessageKind::Text))?;

    let alice = net.client("alice");
    connect(&hub, &alice, "alice").await?;
    assert_eq!(hub.sessions(), vec!["alice".into()]);
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn client_close_removes_session_and_allows_reconnect() -> Result<()> {
    let net = Net::new();
    let hub = net.hub();
    hub.add_data_channel("chat", DataChannelConfig::ordered()).await?;
    let alice = net.client("alice");
    connect(&hub, &alice, "alice").await?;
    let first_id = hub.get_session("alice").context("session")?.id();

    let mut hub_events = hub.events(EventFilter::all().from_remote("alice"));
    alice.close().await;
    assert_eq!(alice.negotiation_state(), NegotiationState::Closed);
    assert!(alice.channel_labels().is_empty());

    loop {
        match next_event(&mut hub_events).await? {
            SessionEvent::Close { .. } => break,
            SessionEvent::Channel { event, .. } => {
                assert!(matches!(event, ChannelEvent::Close { .. }), "{event:?}");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(hub.get_session("alice").is_none());
    assert_eq!(hub.send_data("chat", "anyone?").await, 0);

    connect(&hub, &alice, "alice").await?;
    let second = hub.get_session("alice").context("new session")?;
    assert_ne!(second.id(), first_id);
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn unanswered_offer_times_out() -> Result<()> {
    let net = Net::new();
    let config = HubConfig::default()
        .with_session(SessionConfig::default().with_handshake_timeout(Duration::from_millis(200)));
    let hub = net.hub_with(config);

    let ghost = net.port("ghost");
    let mut inbox = ghost.subscribe(RelayFilter::origin("hub").with_kinds([MessageKind::Offer]));
    let mut closed = hub.events(EventFilter::kind(EventKind::SessionClose));
    ghost.publish(RelayMessage::empty("hub", MessageKind::Connect))?;

    inbox.recv().await.context("offer")?;
    let event = next_event(&mut closed).await?;
    assert_eq!(event.remote().as_str(), "ghost");
    assert!(hub.sessions().is_empty());
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn failed_initial_offer_closes_the_session() -> Result<()> {
    let net = Net::new();
    let hub = net.hub();
    let mut closed = hub.events(EventFilter::kind(EventKind::SessionClose));

    // Nobody listens for the offer, so sending it fails.
    let ghost = net.port("ghost");
    ghost.publish(RelayMessage::empty("hub", MessageKind::Connect))?;

    let event = next_event(&mut closed).await?;
    assert_eq!(event.remote().as_str(), "ghost");
    eventually("hub forgets ghost", || hub.sessions().is_empty()).await?;

    let alice = net.client("alice");
    connect(&hub, &alice, "alice").await?;
    assert_eq!(hub.sessions(), vec!["alice".into()]);
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn tracks_flow_in_both_directions() -> Result<()> {
    let net = Net::new();
    let hub = net.hub();
    let alice = net.client("alice");
    assert!(matches!(
        alice.add_track(MockTrack::audio("early"), vec![]).await,
        Err(SessionError::NoSession)
    ));
    connect(&hub, &alice, "alice").await?;

    let mut hub_tracks = hub.events(EventFilter::kind(EventKind::SessionTrack));
    let mut alice_tracks = alice.events(EventFilter::kind(EventKind::SessionTrack));
    let (hub_added, alice_added) = tokio::join!(
        hub.add_track(MockTrack::video("screen"), vec!["desk".into()]),
        alice.add_track(MockTrack::audio("mic"), vec!["voice".into()]),
    );
    assert_eq!(hub_added, 1);
    alice_added?;

    match next_event(&mut hub_tracks).await? {
        SessionEvent::Track {
            remote,
            track,
            streams,
        } => {
            assert_eq!(remote.as_str(), "alice");
            assert_eq!(track, MockTrack::audio("mic"));
            assert_eq!(streams, vec!["voice".to_string()]);
        }
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&mut alice_tracks).await? {
        SessionEvent::Track { track, .. } => assert_eq!(track, MockTrack::video("screen")),
        other => panic!("unexpected event {other:?}"),
    }

    let session = hub.get_session("alice").context("session")?;
    eventually("both sides stable", || {
        session.negotiation_state() == NegotiationState::Stable
            && alice.negotiation_state() == NegotiationState::Stable
    })
    .await?;
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn closing_a_channel_retires_it_on_both_sides() -> Result<()> {
    let net = Net::new();
    let hub = net.hub();
    hub.add_data_channel("chat", DataChannelConfig::ordered()).await?;
    let alice = net.client("alice");
    let mut alice_chat = alice.events(EventFilter::all().on_channel("chat"));
    connect(&hub, &alice, "alice").await?;
    expect_kind(&mut alice_chat, EventKind::ChannelOpen).await?;

    let session = hub.get_session("alice").context("session")?;
    let mut hub_chat = session.events(EventFilter::kind(EventKind::ChannelClose));
    alice.get_channel("chat").context("chat")?.close().await?;

    expect_kind(&mut alice_chat, EventKind::ChannelClose).await?;
    next_event(&mut hub_chat).await?;
    assert!(session.get_channel("chat").is_none());
    assert!(alice.get_channel("chat").is_none());
    assert!(session.is_connected());
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn shutdown_closes_every_session() -> Result<()> {
    let net = Net::new();
    let hub = net.hub();
    let alice = net.client("alice");
    let bob = net.client("bob");
    connect(&hub, &alice, "alice").await?;
    connect(&hub, &bob, "bob").await?;

    let mut closed = hub.events(EventFilter::kind(EventKind::SessionClose));
    let mut alice_closed = alice.events(EventFilter::kind(EventKind::SessionClose));
    hub.shutdown().await;

    let mut remotes = vec![
        next_event(&mut closed).await?.remote().to_string(),
        next_event(&mut closed).await?.remote().to_string(),
    ];
    remotes.sort();
    assert_eq!(remotes, vec!["alice".to_string(), "bob".to_string()]);
    assert!(hub.sessions().is_empty());
    next_event(&mut alice_closed).await?;
    assert!(!alice.is_connected());
    Ok(())
}
