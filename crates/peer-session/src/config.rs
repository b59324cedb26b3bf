use std::env;
use std::time::Duration;

use tracing::Span;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// STUN/TURN server handed to the transport primitive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Configuration for creating one transport-primitive instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
        }
    }
}

impl RtcConfig {
    /// `PEER_HUB_LOCALHOST_ONLY` disables ICE servers entirely;
    /// `PEER_HUB_ICE_SERVERS` replaces the default STUN list. A TURN server
    /// named by `PEER_HUB_TURN_URL` (comma-separated URLs) is appended with
    /// `PEER_HUB_TURN_USERNAME` and `PEER_HUB_TURN_CREDENTIAL`.
    pub fn from_env() -> Self {
        if env::var("PEER_HUB_LOCALHOST_ONLY").is_ok() {
            return Self::localhost();
        }
        let mut config = match env::var("PEER_HUB_ICE_SERVERS").ok().map(|value| url_list(&value)) {
            Some(urls) if !urls.is_empty() => Self {
                ice_servers: urls.into_iter().map(IceServer::stun).collect(),
            },
            _ => Self::default(),
        };
        if let Some(urls) = env::var("PEER_HUB_TURN_URL")
            .ok()
            .map(|value| url_list(&value))
            .filter(|urls| !urls.is_empty())
        {
            config.ice_servers.push(IceServer {
                urls,
                username: env::var("PEER_HUB_TURN_USERNAME").ok(),
                credential: env::var("PEER_HUB_TURN_CREDENTIAL").ok(),
            });
        }
        config
    }

    /// No STUN/TURN; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
        }
    }

    pub fn builder() -> RtcConfigBuilder {
        RtcConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct RtcConfigBuilder {
    ice_servers: Vec<IceServer>,
    localhost_only: bool,
}

impl RtcConfigBuilder {
    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username: Some(username),
            credential: Some(credential),
        });
        self
    }

    pub fn localhost_only(mut self, localhost_only: bool) -> Self {
        self.localhost_only = localhost_only;
        self
    }

    pub fn build(self) -> RtcConfig {
        if self.localhost_only {
            return RtcConfig::localhost();
        }
        if self.ice_servers.is_empty() {
            return RtcConfig::default();
        }
        RtcConfig {
            ice_servers: self.ice_servers,
        }
    }
}

fn url_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

/// Ordering and reliability options for one data sub-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelConfig {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
    pub max_packet_life_time: Option<u16>,
    pub protocol: Option<String>,
    /// Pre-negotiated stream id; `None` announces the channel in-band.
    pub negotiated: Option<u16>,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self::ordered()
    }
}

impl DataChannelConfig {
    pub fn ordered() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
            max_packet_life_time: None,
            protocol: None,
            negotiated: None,
        }
    }

    /// Unordered with no retransmissions.
    pub fn unordered() -> Self {
        Self {
            ordered: false,
            max_retransmits: Some(0),
            ..Self::ordered()
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }
}

/// Per-session settings shared by both roles.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub rtc: RtcConfig,
    /// Close sessions that have not connected within this bound. `None`
    /// leaves the handshake to the primitive's own failure detection.
    pub handshake_timeout: Option<Duration>,
    pub event_capacity: usize,
    /// Parent span for every log record the session emits.
    pub span: Span,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rtc: RtcConfig::default(),
            handshake_timeout: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            span: Span::none(),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let handshake_timeout = env::var("PEER_HUB_HANDSHAKE_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        Self {
            rtc: RtcConfig::from_env(),
            handshake_timeout,
            ..Self::default()
        }
    }

    pub fn with_rtc(mut self, rtc: RtcConfig) -> Self {
        self.rtc = rtc;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Template for every member session the hub creates.
    pub session: SessionConfig,
    pub event_capacity: usize,
    pub span: Span,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY * 4,
            span: Span::none(),
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        Self {
            session: SessionConfig::from_env(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}
