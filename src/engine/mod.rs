//! Contract between the bridge and the tunneling engine.
//!
//! The engine (OpenVPN 3 in production) is consumed as a black box through
//! a handful of flat traits, one per role:
//!
//! ```text
//!   Session ──owns──▶ TunnelEngine ──calls──▶ EngineHost (session hooks)
//!                         │
//!                         ├─▶ TunClientFactory::new_tun_client(parent)
//!                         │         └─▶ TunClient (VirtualTunAdapter)
//!                         │                 │ tun_send()   inbound
//!                         └◀─ TunClientParent::tun_recv()  outbound
//! ```
//!
//! The engine owns its I/O context. Here that is a tokio runtime; the
//! adapter receives a [`tokio::runtime::Handle`] in `tun_start` and polls
//! its end of the packet channel there.

mod loopback;

pub use loopback::{LoopbackBuilder, LoopbackEngine, LoopbackOptions, LoopbackStats};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::buffer::PacketBuffer;
use crate::options::{ConfigSnapshot, OptionList};

/// Status returned by engine calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub message: String,
    pub fatal: bool,
}

impl EngineError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EngineError {}

/// Profile plus the knobs the bridge always sets.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub content: String,
    pub conn_timeout_secs: u32,
    pub compression_mode: String,
    pub tun_persist: bool,
    pub autologin_sessions: bool,
}

/// What the engine learned while evaluating a profile.
#[derive(Debug, Clone, Default)]
pub struct ProfileInfo {
    pub autologin: bool,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Named engine events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Connected,
    Disconnected,
    Reconnecting,
    Resolve,
    Wait,
    PushRequest,
    PushReply,
    AuthFailed,
    AuthPending,
    AuthOk,
    CompressError,
    DataChannelStarted,
    TransportError,
    Tx,
    Rx,
    Other(String),
}

impl EventKind {
    /// Parse the engine's event name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "CONNECTED" => Self::Connected,
            "DISCONNECTED" => Self::Disconnected,
            "RECONNECTING" => Self::Reconnecting,
            "RESOLVE" => Self::Resolve,
            "WAIT" => Self::Wait,
            "PUSH_REQUEST" => Self::PushRequest,
            "PUSH_REPLY" => Self::PushReply,
            "AUTH_FAILED" => Self::AuthFailed,
            "AUTH_PENDING" => Self::AuthPending,
            "AUTH_OK" => Self::AuthOk,
            "COMPRESS_ERROR" => Self::CompressError,
            "DATA_CHANNEL_STARTED" => Self::DataChannelStarted,
            "TRANSPORT_ERROR" => Self::TransportError,
            "TX" => Self::Tx,
            "RX" => Self::Rx,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Resolve => "RESOLVE",
            Self::Wait => "WAIT",
            Self::PushRequest => "PUSH_REQUEST",
            Self::PushReply => "PUSH_REPLY",
            Self::AuthFailed => "AUTH_FAILED",
            Self::AuthPending => "AUTH_PENDING",
            Self::AuthOk => "AUTH_OK",
            Self::CompressError => "COMPRESS_ERROR",
            Self::DataChannelStarted => "DATA_CHANNEL_STARTED",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::Tx => "TX",
            Self::Rx => "RX",
            Self::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub info: String,
    pub error: bool,
    pub fatal: bool,
}

impl Event {
    pub fn new(kind: EventKind, info: impl Into<String>) -> Self {
        Self {
            kind,
            info: info.into(),
            error: false,
            fatal: false,
        }
    }

    pub fn error(kind: EventKind, info: impl Into<String>, fatal: bool) -> Self {
        Self {
            kind,
            info: info.into(),
            error: true,
            fatal,
        }
    }
}

/// External PKI certificate request. Filled in by the host.
#[derive(Debug, Clone, Default)]
pub struct PkiCertRequest {
    pub alias: String,
    pub cert: String,
    pub error: bool,
    pub error_text: String,
}

/// External PKI signature request. Filled in by the host.
#[derive(Debug, Clone, Default)]
pub struct PkiSignRequest {
    pub alias: String,
    pub data: String,
    pub algorithm: String,
    pub sig: String,
    pub error: bool,
    pub error_text: String,
}

/// One engine client instance.
pub trait TunnelEngine: Send + Sync {
    fn eval_config(&self, config: &EngineConfig) -> Result<ProfileInfo, EngineError>;

    fn provide_creds(&self, creds: &Credentials) -> Result<(), EngineError>;

    /// Run the whole session. Blocks until stopped or failed.
    fn connect(&self) -> Result<(), EngineError>;

    /// Ask a running `connect()` to return. Callable from any thread.
    fn stop(&self);

    /// Soft restart: drop the transport socket and re-establish it,
    /// keeping the negotiated session.
    fn reconnect(&self, delay_secs: u32) -> Result<(), EngineError>;

    fn pause(&self, _reason: &str) {}

    fn resume(&self) {}
}

/// Callbacks from the engine into the session that owns it.
pub trait EngineHost: Send + Sync {
    fn log(&self, line: &str);

    fn event(&self, event: &Event);

    /// Exempt the engine's own transport socket from VPN routing.
    fn socket_protect(&self, fd: RawFd, remote: &str, ipv6: bool) -> bool;

    fn external_pki_cert_request(&self, req: &mut PkiCertRequest);

    fn external_pki_sign_request(&self, req: &mut PkiSignRequest);

    /// Pause instead of exiting when the connect timeout expires.
    fn pause_on_connection_timeout(&self) -> bool;
}

/// Engine-side owner of a TUN client.
pub trait TunClientParent: Send + Sync {
    /// Outbound plaintext packet pulled from the application.
    fn tun_recv(&self, buf: PacketBuffer);

    fn tun_pre_tun_config(&self) {}

    fn tun_connected(&self) {}

    fn tun_error(&self, message: &str);
}

/// The TUN role the engine drives.
pub trait TunClient: Send + Sync {
    fn tun_start(&self, options: &OptionList, io: &tokio::runtime::Handle);

    /// Inbound decrypted packet for the application.
    fn tun_send(&self, packet: &[u8]) -> bool;

    fn tun_name(&self) -> String;

    fn vpn_ip4(&self) -> Option<Ipv4Addr>;

    fn vpn_ip6(&self) -> Option<Ipv6Addr>;

    fn vpn_mtu(&self) -> u16;

    fn set_disconnect(&self);

    fn stop(&self);
}

/// Builds the TUN client at the point the engine needs one.
pub trait TunClientFactory: Send + Sync {
    fn new_tun_client(&self, parent: Arc<dyn TunClientParent>) -> Arc<dyn TunClient>;

    fn layer_2_supported(&self) -> bool {
        false
    }

    fn supports_epoch_data(&self) -> bool {
        false
    }
}

/// Constructs engine clients for new sessions.
pub trait EngineBuilder: Send + Sync {
    fn build(
        &self,
        host: Arc<dyn EngineHost>,
        tun_factory: Arc<dyn TunClientFactory>,
    ) -> Result<Arc<dyn TunnelEngine>, EngineError>;
}

/// Application handlers for pushed interface configuration.
///
/// Invoked from engine threads.
pub trait TunnelObserver: Send + Sync {
    fn on_ip_assigned(&self, tunnel_id: &str, address: IpAddr, prefix_len: u8);

    fn on_dns_configured(&self, tunnel_id: &str, servers: &[IpAddr]);

    fn on_route_pushed(&self, tunnel_id: &str, address: IpAddr, prefix_len: u8, ipv6: bool);

    /// Full snapshot after all individual callbacks for one start.
    fn on_config_complete(&self, _tunnel_id: &str, _snapshot: &ConfigSnapshot) {}
}

/// Exempts sockets from the device VPN (`VpnService.protect`).
pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: RawFd) -> bool;
}
