//! In-process engine used by the self-test binary and the test suite.
//!
//! Speaks no protocol. It walks through the same event sequence a real
//! engine does, builds a virtual TUN through the session's factory and
//! echoes every outbound packet back to the application from a task on
//! its own runtime.

use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    Credentials, EngineBuilder, EngineConfig, EngineError, EngineHost, Event, EventKind,
    ProfileInfo, TunClient, TunClientFactory, TunClientParent, TunnelEngine,
};
use crate::buffer::PacketBuffer;
use crate::options::OptionList;

/// Framing header added and stripped on every outbound packet.
const FRAME_HEADER: [u8; 4] = [0x4c, 0x42, 0x00, 0x01];

const DEFAULT_PUSH_REPLY: &str = "PUSH_REPLY,ifconfig 10.8.0.2 255.255.255.0,\
     dhcp-option DNS 10.8.0.1,route 10.8.0.0 255.255.255.0,tun-mtu 1500";

/// Behavior knobs for [`LoopbackEngine`].
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Options "pushed" to the TUN on connect.
    pub push_reply: String,
    /// Credentials to accept; `None` accepts anything.
    pub expected: Option<Credentials>,
    /// Send every outbound packet straight back to the application.
    pub echo: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            push_reply: DEFAULT_PUSH_REPLY.to_string(),
            expected: None,
            echo: true,
        }
    }
}

/// Packet counters shared by every engine one builder creates.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    echoed: AtomicU64,
}

impl LoopbackStats {
    /// Outbound packets the engine received from applications.
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn echoed(&self) -> u64 {
        self.echoed.load(Ordering::SeqCst)
    }
}

/// Builds one [`LoopbackEngine`] per session.
#[derive(Default)]
pub struct LoopbackBuilder {
    options: LoopbackOptions,
    stats: Arc<LoopbackStats>,
}

impl LoopbackBuilder {
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            options,
            stats: Arc::new(LoopbackStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<LoopbackStats> {
        self.stats.clone()
    }
}

impl EngineBuilder for LoopbackBuilder {
    fn build(
        &self,
        host: Arc<dyn EngineHost>,
        tun_factory: Arc<dyn TunClientFactory>,
    ) -> Result<Arc<dyn TunnelEngine>, EngineError> {
        let engine = LoopbackEngine::new(
            host,
            tun_factory,
            self.options.clone(),
            self.stats.clone(),
        )?;
        Ok(Arc::new(engine))
    }
}

enum Command {
    Stop,
    Reconnect,
    Pause(String),
    Resume,
}

/// Engine double that owns a small tokio runtime as its I/O context.
pub struct LoopbackEngine {
    host: Arc<dyn EngineHost>,
    tun_factory: Arc<dyn TunClientFactory>,
    options: LoopbackOptions,
    stats: Arc<LoopbackStats>,
    runtime: Mutex<Option<Runtime>>,
    config: Mutex<Option<EngineConfig>>,
    remote: Mutex<String>,
    creds: Mutex<Option<Credentials>>,
    commands: (Sender<Command>, Receiver<Command>),
}

impl LoopbackEngine {
    pub fn new(
        host: Arc<dyn EngineHost>,
        tun_factory: Arc<dyn TunClientFactory>,
        options: LoopbackOptions,
        stats: Arc<LoopbackStats>,
    ) -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ovpn-io")
            .enable_all()
            .build()
            .map_err(|e| EngineError::fatal(format!("cannot start I/O runtime: {e}")))?;

        Ok(Self {
            host,
            tun_factory,
            options,
            stats,
            runtime: Mutex::new(Some(runtime)),
            config: Mutex::new(None),
            remote: Mutex::new(String::new()),
            creds: Mutex::new(None),
            commands: unbounded(),
        })
    }

    fn emit(&self, kind: EventKind, info: &str) {
        self.host.event(&Event::new(kind, info));
    }

    /// Bind a local transport socket and exempt it from the VPN.
    fn open_transport(&self) -> Result<UdpSocket, EngineError> {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .map_err(|e| EngineError::new(format!("transport bind failed: {e}")))?;
        let remote = self.remote.lock().clone();
        if !self.host.socket_protect(socket.as_raw_fd(), &remote, false) {
            self.host
                .log(&format!("transport socket to {remote} not protected"));
        }
        Ok(socket)
    }

    fn check_creds(&self) -> Result<(), EngineError> {
        let Some(expected) = &self.options.expected else {
            return Ok(());
        };
        let given = self.creds.lock().clone().unwrap_or_default();
        if given.username == expected.username && given.password == expected.password {
            return Ok(());
        }
        self.host.event(&Event::error(
            EventKind::AuthFailed,
            "credentials rejected",
            true,
        ));
        Err(EngineError::fatal("AUTH_FAILED"))
    }
}

impl TunnelEngine for LoopbackEngine {
    fn eval_config(&self, config: &EngineConfig) -> Result<ProfileInfo, EngineError> {
        let opts = OptionList::parse_lines(&config.content);
        let remote = opts
            .get("remote")
            .ok_or_else(|| EngineError::new("profile has no remote"))?;
        let host = remote
            .arg(1)
            .ok_or_else(|| EngineError::new("remote has no host"))?
            .to_string();
        let port = remote.arg(2).and_then(|p| p.parse().ok());

        *self.remote.lock() = host.clone();
        *self.config.lock() = Some(config.clone());
        // Commands left over from an earlier attempt must not stop this one.
        while self.commands.1.try_recv().is_ok() {}

        Ok(ProfileInfo {
            autologin: opts.get("auth-user-pass").is_none(),
            remote_host: Some(host),
            remote_port: port,
        })
    }

    fn provide_creds(&self, creds: &Credentials) -> Result<(), EngineError> {
        if creds.username.is_empty() {
            return Err(EngineError::new("username is empty"));
        }
        *self.creds.lock() = Some(creds.clone());
        Ok(())
    }

    fn connect(&self) -> Result<(), EngineError> {
        let config = self
            .config
            .lock()
            .clone()
            .ok_or_else(|| EngineError::fatal("connect before eval_config"))?;
        let io = self
            .runtime
            .lock()
            .as_ref()
            .map(|rt| rt.handle().clone())
            .ok_or_else(|| EngineError::fatal("I/O runtime shut down"))?;

        let remote = self.remote.lock().clone();
        self.emit(EventKind::Resolve, &remote);
        self.emit(EventKind::Wait, "");
        let mut transport = self.open_transport()?;

        self.check_creds()?;
        self.emit(EventKind::AuthOk, "");
        self.emit(EventKind::PushRequest, "");
        self.emit(EventKind::PushReply, &self.options.push_reply);

        let (status_tx, status_rx) = unbounded();
        let (echo_tx, echo_rx) = mpsc::unbounded_channel();
        let parent = Arc::new(LoopbackParent {
            status: status_tx,
            echo: self.options.echo.then_some(echo_tx),
            stats: self.stats.clone(),
        });
        let tun = self.tun_factory.new_tun_client(parent);
        if self.options.echo {
            io.spawn(echo_loop(echo_rx, Arc::downgrade(&tun), self.stats.clone()));
        }

        let options = OptionList::parse_push_reply(&self.options.push_reply);
        tun.tun_start(&options, &io);
        let timeout = Duration::from_secs(u64::from(config.conn_timeout_secs));
        match status_rx.recv_timeout(timeout) {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => {
                tun.stop();
                self.host
                    .event(&Event::error(EventKind::TransportError, &msg, true));
                return Err(EngineError::fatal(msg));
            }
            Err(_) => {
                tun.stop();
                return Err(EngineError::fatal("timed out waiting for TUN"));
            }
        }
        self.emit(EventKind::Connected, &tun.tun_name());

        loop {
            match self.commands.1.recv() {
                Ok(Command::Reconnect) => {
                    self.emit(EventKind::Reconnecting, "");
                    drop(transport);
                    transport = self.open_transport()?;
                    debug!(local = ?transport.local_addr().ok(), "Loopback transport reopened");
                    self.emit(EventKind::Connected, &tun.tun_name());
                }
                Ok(Command::Pause(reason)) => {
                    self.emit(EventKind::Other("PAUSE".to_string()), &reason);
                }
                Ok(Command::Resume) => {
                    self.emit(EventKind::Other("RESUME".to_string()), "");
                }
                Ok(Command::Stop) | Err(_) => break,
            }
        }

        tun.set_disconnect();
        tun.stop();
        self.emit(EventKind::Disconnected, "");
        Ok(())
    }

    fn stop(&self) {
        let _ = self.commands.0.send(Command::Stop);
    }

    fn reconnect(&self, delay_secs: u32) -> Result<(), EngineError> {
        if delay_secs > 0 {
            self.host
                .log(&format!("reconnect delay {delay_secs}s ignored by loopback"));
        }
        self.commands
            .0
            .send(Command::Reconnect)
            .map_err(|_| EngineError::new("engine command queue closed"))
    }

    fn pause(&self, reason: &str) {
        let _ = self.commands.0.send(Command::Pause(reason.to_string()));
    }

    fn resume(&self) {
        let _ = self.commands.0.send(Command::Resume);
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.lock().take() {
            rt.shutdown_background();
        }
    }
}

/// Send echoed packets back through the TUN until it goes away.
async fn echo_loop(
    mut packets: mpsc::UnboundedReceiver<Bytes>,
    tun: Weak<dyn TunClient>,
    stats: Arc<LoopbackStats>,
) {
    while let Some(packet) = packets.recv().await {
        let Some(device) = tun.upgrade() else {
            break;
        };
        if device.tun_send(&packet) {
            stats.echoed.fetch_add(1, Ordering::SeqCst);
        }
    }
    debug!("Loopback echo loop finished");
}

/// TUN parent handed to the adapter; receives the application's packets.
struct LoopbackParent {
    status: Sender<Result<(), String>>,
    echo: Option<mpsc::UnboundedSender<Bytes>>,
    stats: Arc<LoopbackStats>,
}

impl TunClientParent for LoopbackParent {
    fn tun_recv(&self, mut buf: PacketBuffer) {
        let len = buf.len();
        if buf.prepend(&FRAME_HEADER).is_err() || buf.advance(FRAME_HEADER.len()).is_err() {
            warn!(len, "No headroom for framing, packet dropped");
            return;
        }
        self.stats.packets.fetch_add(1, Ordering::SeqCst);
        self.stats.bytes.fetch_add(len as u64, Ordering::SeqCst);

        if let Some(echo) = &self.echo {
            let _ = echo.send(buf.to_bytes());
        }
    }

    fn tun_connected(&self) {
        let _ = self.status.send(Ok(()));
    }

    fn tun_error(&self, message: &str) {
        let _ = self.status.send(Err(message.to_string()));
    }
}
