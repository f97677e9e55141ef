use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::VirtualTunAdapter;
use crate::channel::BlockingMode;
use crate::engine::{TunClient, TunClientFactory, TunClientParent, TunnelObserver};
use crate::error::{Error, Result};

/// Per-tunnel factory the engine calls when it needs a TUN device.
///
/// The engine owns every adapter it gets from here; the factory keeps only
/// a weak reference so the application can look up the descriptor later.
pub struct VirtualTunFactory {
    tunnel_id: String,
    observer: Option<Arc<dyn TunnelObserver>>,
    app_mode: BlockingMode,
    current: Mutex<Weak<VirtualTunAdapter>>,
    built: AtomicU32,
}

impl VirtualTunFactory {
    pub fn new(
        tunnel_id: &str,
        observer: Option<Arc<dyn TunnelObserver>>,
        app_mode: BlockingMode,
    ) -> Self {
        Self {
            tunnel_id: tunnel_id.to_string(),
            observer,
            app_mode,
            current: Mutex::new(Weak::new()),
            built: AtomicU32::new(0),
        }
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// The most recent adapter, if the engine still holds it.
    pub fn adapter(&self) -> Option<Arc<VirtualTunAdapter>> {
        self.current.lock().upgrade()
    }

    /// Application end of the current adapter's channel.
    ///
    /// `NotReady` until the adapter has been built and started.
    pub fn app_end_descriptor(&self) -> Result<RawFd> {
        self.adapter().ok_or(Error::NotReady)?.app_fd()
    }

    /// Owned duplicate of the application end.
    pub fn take_app_end_descriptor(&self) -> Result<OwnedFd> {
        self.adapter().ok_or(Error::NotReady)?.take_app_fd()
    }

    /// Number of adapters built so far (one per connection attempt).
    pub fn built(&self) -> u32 {
        self.built.load(Ordering::Relaxed)
    }
}

impl TunClientFactory for VirtualTunFactory {
    fn new_tun_client(&self, parent: Arc<dyn TunClientParent>) -> Arc<dyn TunClient> {
        let adapter = Arc::new(VirtualTunAdapter::new(
            &self.tunnel_id,
            parent,
            self.observer.clone(),
            self.app_mode,
        ));
        *self.current.lock() = Arc::downgrade(&adapter);
        let n = self.built.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(tunnel = %self.tunnel_id, attempt = n, "Built virtual TUN");
        adapter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PacketBuffer;
    use crate::options::{ConfigSnapshot, OptionList};
    use std::net::IpAddr;

    struct NullParent;

    impl TunClientParent for NullParent {
        fn tun_recv(&self, _buf: PacketBuffer) {}
        fn tun_error(&self, _message: &str) {}
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl TunnelObserver for Recorder {
        fn on_ip_assigned(&self, tunnel_id: &str, address: IpAddr, prefix_len: u8) {
            self.calls
                .lock()
                .push(format!("ip {tunnel_id} {address}/{prefix_len}"));
        }

        fn on_dns_configured(&self, tunnel_id: &str, servers: &[IpAddr]) {
            self.calls
                .lock()
                .push(format!("dns {tunnel_id} {}", servers.len()));
        }

        fn on_route_pushed(&self, tunnel_id: &str, address: IpAddr, prefix_len: u8, ipv6: bool) {
            self.calls
                .lock()
                .push(format!("route {tunnel_id} {address}/{prefix_len} {ipv6}"));
        }

        fn on_config_complete(&self, tunnel_id: &str, snapshot: &ConfigSnapshot) {
            self.calls
                .lock()
                .push(format!("done {tunnel_id} {}", snapshot.mtu));
        }
    }

    #[test]
    fn test_not_ready_until_started() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let factory = VirtualTunFactory::new("nl-1", None, BlockingMode::Blocking);
        assert!(!factory.layer_2_supported());
        assert!(!factory.supports_epoch_data());
        assert!(matches!(factory.app_end_descriptor(), Err(Error::NotReady)));

        let tun = factory.new_tun_client(Arc::new(NullParent));
        assert!(matches!(factory.app_end_descriptor(), Err(Error::NotReady)));

        tun.tun_start(&OptionList::new(), rt.handle());
        assert!(factory.app_end_descriptor().unwrap() >= 0);
        assert_eq!(factory.built(), 1);

        // Engine releases the adapter: the factory must not keep it alive.
        drop(tun);
        assert!(factory.adapter().is_none());
        assert!(matches!(factory.app_end_descriptor(), Err(Error::NotReady)));
    }

    #[test]
    fn test_callbacks_dispatched_in_order() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let factory = VirtualTunFactory::new(
            "de-2",
            Some(recorder.clone() as Arc<dyn TunnelObserver>),
            BlockingMode::NonBlocking,
        );
        let tun = factory.new_tun_client(Arc::new(NullParent));
        tun.tun_start(
            &OptionList::parse_push_reply(
                "PUSH_REPLY,ifconfig 10.9.0.2 255.255.0.0,dhcp-option DNS 10.9.0.1,\
                 route 192.168.0.0 255.255.0.0,route-ipv6 fd00::/8",
            ),
            rt.handle(),
        );

        let calls = recorder.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                "ip de-2 10.9.0.2/16",
                "dns de-2 1",
                "route de-2 192.168.0.0/16 false",
                "route de-2 fd00::/8 true",
                "done de-2 1500",
            ]
        );
        tun.stop();
    }
}
