use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use super::Session;
use crate::engine::{EngineHost, Event, PkiCertRequest, PkiSignRequest, TunnelObserver};
use crate::options::ConfigSnapshot;

const PKI_UNSUPPORTED: &str = "External PKI not supported";

/// Engine-facing sink for one session.
///
/// Handed to the engine and to the TUN factory. Holds the session weakly
/// and drops every callback once the session has started tearing down.
pub(crate) struct SessionHooks {
    tunnel_id: String,
    session: Weak<Session>,
}

impl SessionHooks {
    pub(crate) fn new(tunnel_id: &str, session: Weak<Session>) -> Self {
        Self {
            tunnel_id: tunnel_id.to_string(),
            session,
        }
    }

    fn live(&self) -> Option<Arc<Session>> {
        self.session.upgrade().filter(|s| !s.is_destroying())
    }
}

impl EngineHost for SessionHooks {
    fn log(&self, line: &str) {
        debug!(target: "ovpn_bridge::engine", tunnel = %self.tunnel_id, "{}", line.trim_end());
    }

    fn event(&self, event: &Event) {
        match self.live() {
            Some(session) => session.handle_event(event),
            None => debug!(tunnel = %self.tunnel_id, event = %event.kind, "Late event ignored"),
        }
    }

    fn socket_protect(&self, fd: RawFd, remote: &str, ipv6: bool) -> bool {
        match self.live() {
            Some(session) => session.socket_protect(fd, remote, ipv6),
            None => false,
        }
    }

    fn external_pki_cert_request(&self, req: &mut PkiCertRequest) {
        warn!(tunnel = %self.tunnel_id, alias = %req.alias, "External PKI cert request refused");
        req.error = true;
        req.error_text = PKI_UNSUPPORTED.to_string();
    }

    fn external_pki_sign_request(&self, req: &mut PkiSignRequest) {
        warn!(tunnel = %self.tunnel_id, alias = %req.alias, "External PKI sign request refused");
        req.error = true;
        req.error_text = PKI_UNSUPPORTED.to_string();
    }

    fn pause_on_connection_timeout(&self) -> bool {
        true
    }
}

impl TunnelObserver for SessionHooks {
    fn on_ip_assigned(&self, tunnel_id: &str, address: IpAddr, prefix_len: u8) {
        if let Some(session) = self.live() {
            session.notify(|o| o.on_ip_assigned(tunnel_id, address, prefix_len));
        }
    }

    fn on_dns_configured(&self, tunnel_id: &str, servers: &[IpAddr]) {
        if let Some(session) = self.live() {
            session.notify(|o| o.on_dns_configured(tunnel_id, servers));
        }
    }

    fn on_route_pushed(&self, tunnel_id: &str, address: IpAddr, prefix_len: u8, ipv6: bool) {
        if let Some(session) = self.live() {
            session.notify(|o| o.on_route_pushed(tunnel_id, address, prefix_len, ipv6));
        }
    }

    fn on_config_complete(&self, tunnel_id: &str, snapshot: &ConfigSnapshot) {
        if let Some(session) = self.live() {
            session.store_snapshot(snapshot);
            session.notify(|o| o.on_config_complete(tunnel_id, snapshot));
        }
    }
}
