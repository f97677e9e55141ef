use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{OwnedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::PacketBuffer;
use crate::channel::{BlockingMode, ChannelEnd, PacketChannel};
use crate::engine::{TunClient, TunClientParent, TunnelObserver};
use crate::error::{Error, Result};
use crate::options::{ConfigSnapshot, OptionList};

/// Largest datagram read from the engine end in one go.
const READ_BUF_SIZE: usize = 65536;

/// Adapter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Created,
    Started,
    Halting,
    Stopped,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Started => write!(f, "Started"),
            Self::Halting => write!(f, "Halting"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Per-adapter packet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    /// Packets delivered to the application (inbound).
    pub packets_in: u64,
    pub bytes_in: u64,
    /// Packets handed to the engine (outbound).
    pub packets_out: u64,
    pub bytes_out: u64,
    /// Inbound packets dropped on would-block, partial write or error.
    pub dropped_in: u64,
    /// Outbound packets dropped on truncation or intake failure.
    pub dropped_out: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
    dropped_in: AtomicU64,
    dropped_out: AtomicU64,
}

impl Counters {
    fn inbound(&self, len: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn outbound(&self, len: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TrafficStats {
        TrafficStats {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            dropped_in: self.dropped_in.load(Ordering::Relaxed),
            dropped_out: self.dropped_out.load(Ordering::Relaxed),
        }
    }
}

/// One tunnel's virtual TUN device.
///
/// Created by [`VirtualTunFactory`](super::VirtualTunFactory) when the
/// engine asks for a TUN client. The engine owns the returned `Arc`.
pub struct VirtualTunAdapter {
    tunnel_id: String,
    name: String,
    parent: Arc<dyn TunClientParent>,
    observer: Option<Arc<dyn TunnelObserver>>,
    app_mode: BlockingMode,
    state: Mutex<AdapterState>,
    halted: AtomicBool,
    channel: Mutex<Option<PacketChannel>>,
    snapshot: RwLock<ConfigSnapshot>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl VirtualTunAdapter {
    pub fn new(
        tunnel_id: &str,
        parent: Arc<dyn TunClientParent>,
        observer: Option<Arc<dyn TunnelObserver>>,
        app_mode: BlockingMode,
    ) -> Self {
        debug!(tunnel = %tunnel_id, "Virtual TUN created");
        Self {
            tunnel_id: tunnel_id.to_string(),
            name: super::tun_name(tunnel_id),
            parent,
            observer,
            app_mode,
            state: Mutex::new(AdapterState::Created),
            halted: AtomicBool::new(false),
            channel: Mutex::new(None),
            snapshot: RwLock::new(ConfigSnapshot::default()),
            cancel: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create the channel, publish the pushed configuration and start
    /// polling the engine end on `io`.
    pub fn start(&self, options: &OptionList, io: &Handle) -> Result<()> {
        {
            let state = self.state.lock();
            if *state != AdapterState::Created || self.halted.load(Ordering::SeqCst) {
                return Err(Error::internal(format!(
                    "{} cannot start from state {}",
                    self.name, *state
                )));
            }
        }

        let channel = PacketChannel::create(self.app_mode)?;
        let engine_end = channel.engine_end()?;

        let snapshot = ConfigSnapshot::from_options(options);
        *self.snapshot.write() = snapshot.clone();

        self.parent.tun_pre_tun_config();
        self.publish(&snapshot);

        *self.channel.lock() = Some(channel);

        {
            let mut state = self.state.lock();
            if self.halted.load(Ordering::SeqCst) {
                // stop() raced with us; it may have missed the channel
                if let Some(ch) = self.channel.lock().take() {
                    ch.close();
                }
                return Err(Error::ChannelClosed);
            }
            *state = AdapterState::Started;
        }

        io.spawn(read_loop(
            self.tunnel_id.clone(),
            engine_end,
            self.parent.clone(),
            self.counters.clone(),
            self.cancel.clone(),
        ));

        info!(
            tunnel = %self.tunnel_id,
            name = %self.name,
            ipv4 = ?snapshot.ipv4,
            mtu = snapshot.mtu,
            routes = snapshot.routes.len(),
            dns = snapshot.dns_servers.len(),
            "Virtual TUN started"
        );
        self.parent.tun_connected();
        Ok(())
    }

    fn publish(&self, snap: &ConfigSnapshot) {
        let Some(observer) = &self.observer else {
            return;
        };
        let id = self.tunnel_id.as_str();
        for ip in [snap.ipv4, snap.ipv6].into_iter().flatten() {
            observer.on_ip_assigned(id, ip.address, ip.prefix_len);
        }
        if !snap.dns_servers.is_empty() {
            observer.on_dns_configured(id, &snap.dns_servers);
        }
        for route in &snap.routes {
            observer.on_route_pushed(id, route.address, route.prefix_len, route.is_ipv6());
        }
        observer.on_config_complete(id, snap);
    }

    /// Inbound path: hand one decrypted packet to the application.
    ///
    /// Never blocks. Returns `false` when the packet was dropped.
    pub fn send_to_application(&self, packet: &[u8]) -> bool {
        if self.halted.load(Ordering::Acquire) {
            return false;
        }
        let end = match self.channel.lock().as_ref().map(PacketChannel::engine_end) {
            Some(Ok(end)) => end,
            _ => return false,
        };

        match end.send(packet) {
            Ok(n) if n == packet.len() => {
                self.counters.inbound(n);
                true
            }
            Ok(n) => {
                debug!(tunnel = %self.tunnel_id, wrote = n, len = packet.len(), "Partial write, packet dropped");
                self.counters.dropped_in.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.counters.dropped_in.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(e) => {
                warn!(tunnel = %self.tunnel_id, error = %e, "Inbound write failed");
                self.counters.dropped_in.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Halt, cancel the read loop and close both channel ends. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, AdapterState::Halting | AdapterState::Stopped) {
                return;
            }
            *state = AdapterState::Halting;
        }
        self.halted.store(true, Ordering::Release);
        self.cancel.cancel();
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
        *self.state.lock() = AdapterState::Stopped;

        let stats = self.stats();
        info!(
            tunnel = %self.tunnel_id,
            packets_in = stats.packets_in,
            packets_out = stats.packets_out,
            dropped = stats.dropped_in + stats.dropped_out,
            "Virtual TUN stopped"
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    pub fn assigned_ipv4(&self) -> Option<Ipv4Addr> {
        match self.snapshot.read().ipv4.map(|a| a.address) {
            Some(IpAddr::V4(a)) => Some(a),
            _ => None,
        }
    }

    pub fn assigned_ipv6(&self) -> Option<Ipv6Addr> {
        match self.snapshot.read().ipv6.map(|a| a.address) {
            Some(IpAddr::V6(a)) => Some(a),
            _ => None,
        }
    }

    pub fn mtu(&self) -> u16 {
        self.snapshot.read().mtu
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        self.snapshot.read().clone()
    }

    pub fn stats(&self) -> TrafficStats {
        self.counters.snapshot()
    }

    /// Application descriptor, owned by the adapter. `NotReady` before start.
    pub fn app_fd(&self) -> Result<RawFd> {
        if self.state() != AdapterState::Started {
            return Err(Error::NotReady);
        }
        match self.channel.lock().as_ref() {
            Some(ch) => ch.app_fd(),
            None => Err(Error::NotReady),
        }
    }

    /// Duplicate of the application descriptor for a caller that closes it itself.
    pub fn take_app_fd(&self) -> Result<OwnedFd> {
        if self.state() != AdapterState::Started {
            return Err(Error::NotReady);
        }
        match self.channel.lock().as_ref() {
            Some(ch) => ch.take_app_fd(),
            None => Err(Error::NotReady),
        }
    }

    /// Shared handle to the application end, mostly for tests and the CLI.
    pub fn app_end(&self) -> Result<Arc<ChannelEnd>> {
        match self.channel.lock().as_ref() {
            Some(ch) => ch.app_end(),
            None => Err(Error::NotReady),
        }
    }
}

impl TunClient for VirtualTunAdapter {
    fn tun_start(&self, options: &OptionList, io: &Handle) {
        if let Err(e) = self.start(options, io) {
            warn!(tunnel = %self.tunnel_id, error = %e, "Virtual TUN start failed");
            self.parent.tun_error(&e.to_string());
        }
    }

    fn tun_send(&self, packet: &[u8]) -> bool {
        self.send_to_application(packet)
    }

    fn tun_name(&self) -> String {
        self.name.clone()
    }

    fn vpn_ip4(&self) -> Option<Ipv4Addr> {
        self.assigned_ipv4()
    }

    fn vpn_ip6(&self) -> Option<Ipv6Addr> {
        self.assigned_ipv6()
    }

    fn vpn_mtu(&self) -> u16 {
        self.mtu()
    }

    fn set_disconnect(&self) {
        self.halted.store(true, Ordering::Release);
    }

    fn stop(&self) {
        VirtualTunAdapter::stop(self);
    }
}

impl Drop for VirtualTunAdapter {
    fn drop(&mut self) {
        self.stop();
        debug!(tunnel = %self.tunnel_id, "Virtual TUN dropped");
    }
}

/// Outbound path: engine end → engine intake, one packet per readable event.
async fn read_loop(
    tunnel_id: String,
    end: Arc<ChannelEnd>,
    parent: Arc<dyn TunClientParent>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    let fd = match AsyncFd::with_interest(end, Interest::READABLE) {
        Ok(fd) => fd,
        Err(e) => {
            warn!(tunnel = %tunnel_id, error = %e, "Cannot register engine end");
            parent.tun_error(&format!("cannot poll packet channel: {e}"));
            return;
        }
    };
    let mut buf = vec![0u8; READ_BUF_SIZE];
    debug!(tunnel = %tunnel_id, "Read loop running");

    loop {
        let mut guard = tokio::select! {
            _ = cancel.cancelled() => break,
            ready = fd.readable() => match ready {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(tunnel = %tunnel_id, error = %e, "Readiness error, read loop ends");
                    break;
                }
            },
        };

        match guard.try_io(|inner| inner.get_ref().recv(&mut buf)) {
            Err(_would_block) => continue,
            Ok(Ok(0)) => {
                if fd.get_ref().peer_closed() {
                    debug!(tunnel = %tunnel_id, "Application end closed");
                    break;
                }
            }
            Ok(Ok(n)) => {
                let packet = PacketBuffer::from_payload(&buf[..n]);
                let intake = catch_unwind(AssertUnwindSafe(|| parent.tun_recv(packet)));
                match intake {
                    Ok(()) => counters.outbound(n),
                    Err(_) => {
                        counters.dropped_out.fetch_add(1, Ordering::Relaxed);
                        warn!(tunnel = %tunnel_id, len = n, "Engine intake panicked, packet dropped");
                    }
                }
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!(tunnel = %tunnel_id, "Packet channel reset");
                break;
            }
            Ok(Err(e)) => {
                counters.dropped_out.fetch_add(1, Ordering::Relaxed);
                warn!(tunnel = %tunnel_id, error = %e, "Outbound read failed, packet dropped");
            }
        }
    }

    debug!(tunnel = %tunnel_id, cancelled = cancel.is_cancelled(), "Read loop finished");
}
