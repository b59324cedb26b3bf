use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use peer_session::mock::MockBackend;
use peer_session::relay_bus::LocalRelay;
use peer_session::{
    ChannelEvent, DataChannelConfig, EventFilter, EventKind, HubConfig, OutboundSession,
    RtcBackend, RtcConfig, SessionConfig, SessionEvent, SessionHub, WebRtcBackend,
};
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hub-demo")]
#[command(about = "Loopback hub and client exchanging messages over a data channel")]
struct Cli {
    /// Transport primitive to negotiate with
    #[arg(long, value_enum, default_value_t = Backend::Webrtc)]
    backend: Backend,

    /// Identity the hub answers to on the relay
    #[arg(long, default_value = "hub")]
    hub: String,

    /// Prefix for client identities (`client-1`, `client-2`, ...)
    #[arg(long, default_value = "client")]
    client: String,

    /// Number of clients to connect
    #[arg(long, default_value_t = 1)]
    clients: usize,

    /// Data channel the hub declares
    #[arg(long, default_value = "chat")]
    label: String,

    /// Messages the client sends; the hub echoes each one back
    #[arg(short, long, default_values_t = vec!["hello".to_string(), "goodbye".to_string()])]
    message: Vec<String>,

    /// Give up if the exchange has not finished in this many seconds
    #[arg(long, default_value_t = 20)]
    timeout: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    Webrtc,
    Mock,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let deadline = Duration::from_secs(cli.timeout);
    tokio::time::timeout(deadline, dispatch(&cli))
        .await
        .map_err(|_| anyhow!("exchange did not finish within {deadline:?}"))?
}

async fn dispatch(cli: &Cli) -> Result<()> {
    match cli.backend {
        Backend::Webrtc => run(Arc::new(WebRtcBackend::new()?), cli).await,
        Backend::Mock => run(Arc::new(MockBackend::new()), cli).await,
    }
}

async fn run<B: RtcBackend>(backend: Arc<B>, cli: &Cli) -> Result<()> {
    let relay = LocalRelay::new();
    let session = SessionConfig::from_env().with_rtc(RtcConfig::localhost());

    let hub = SessionHub::new(
        backend.clone(),
        Arc::new(relay.attach(cli.hub.as_str())),
        HubConfig::default()
            .with_session(session.clone())
            .with_span(info_span!("hub", id = %cli.hub)),
    );
    hub.add_data_channel(cli.label.as_str(), DataChannelConfig::ordered())
        .await?;

    let clients: Vec<_> = (1..=cli.clients)
        .map(|n| {
            let id = format!("{}-{n}", cli.client);
            OutboundSession::new(
                backend.clone(),
                Arc::new(relay.attach(id.as_str())),
                cli.hub.as_str(),
                session.clone().with_span(info_span!("client", %id)),
            )
        })
        .collect();

    let result = tokio::select! {
        result = echo(&hub) => result,
        result = chat_all(&clients, cli) => result,
    };
    for client in &clients {
        client.close().await;
    }
    hub.shutdown().await;
    result
}

async fn chat_all<B: RtcBackend>(clients: &[OutboundSession<B>], cli: &Cli) -> Result<()> {
    for client in clients {
        chat(client, cli).await?;
    }
    info!(clients = clients.len(), "exchange complete");
    Ok(())
}

/// Sends every message back on the channel it arrived on.
async fn echo<B: RtcBackend>(hub: &SessionHub<B>) -> Result<()> {
    let mut messages = hub.events(EventFilter::kind(EventKind::ChannelMessage));
    while let Some(event) = messages.recv().await {
        let SessionEvent::Channel {
            remote,
            event: ChannelEvent::Message { label, data },
        } = event
        else {
            continue;
        };
        let channel = hub
            .get_session(remote.as_str())
            .and_then(|session| session.get_channel(&label));
        match channel {
            Some(channel) => channel.send(data).await?,
            None => warn!(%remote, %label, "message for a channel that is gone"),
        }
    }
    bail!("hub event stream ended")
}

async fn chat<B: RtcBackend>(client: &OutboundSession<B>, cli: &Cli) -> Result<()> {
    let mut events = client.events(EventFilter::all().on_channel(cli.label.as_str()));
    client.connect()?;

    loop {
        match events.recv().await.context("client event stream ended")? {
            SessionEvent::Channel {
                event: ChannelEvent::Open { .. },
                ..
            } => break,
            SessionEvent::Channel {
                event: ChannelEvent::Close { .. },
                ..
            } => bail!("channel {} closed before opening", cli.label),
            _ => {}
        }
    }
    let channel = client
        .get_channel(&cli.label)
        .with_context(|| format!("channel {} not found", cli.label))?;
    info!(hub = %client.hub(), label = %cli.label, "channel open");

    for message in &cli.message {
        channel.send(message.as_str()).await?;
        loop {
            let event = events.recv().await.context("client event stream ended")?;
            if let SessionEvent::Channel {
                event: ChannelEvent::Message { data, .. },
                ..
            } = event
            {
                println!("{}", data.as_text().unwrap_or("<binary>"));
                break;
            }
        }
    }
    Ok(())
}
