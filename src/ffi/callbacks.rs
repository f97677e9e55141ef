//! FFI callbacks for pushed configuration and socket protection.
//!
//! Every callback may run on an engine thread. Strings passed in are only
//! valid for the duration of the call.

use std::ffi::{c_char, c_int, c_void, CString};
use std::net::IpAddr;
use std::os::fd::RawFd;

use tracing::warn;

use crate::engine::{SocketProtector, TunnelObserver};

/// An address was assigned to a tunnel.
///
/// # Parameters
/// - `context`: User-provided context pointer.
/// - `tunnel_id`: Null-terminated tunnel id.
/// - `address`: Null-terminated textual address.
/// - `prefix_len`: Prefix length.
pub type IpAssignedCallback = Option<
    extern "C" fn(context: *mut c_void, tunnel_id: *const c_char, address: *const c_char, prefix_len: c_int),
>;

/// DNS servers were pushed for a tunnel.
///
/// `servers` points to `count` null-terminated strings.
pub type DnsConfiguredCallback = Option<
    extern "C" fn(context: *mut c_void, tunnel_id: *const c_char, servers: *const *const c_char, count: usize),
>;

/// A route was pushed for a tunnel.
pub type RoutePushedCallback = Option<
    extern "C" fn(
        context: *mut c_void,
        tunnel_id: *const c_char,
        address: *const c_char,
        prefix_len: c_int,
        ipv6: bool,
    ),
>;

/// Socket protection callback type.
/// Called when a socket needs to be protected from VPN routing.
///
/// # Returns
/// true if protection succeeded, false otherwise.
pub type ProtectSocketCallback = Option<extern "C" fn(context: *mut c_void, fd: c_int) -> bool>;

/// Collection of all callbacks.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OvpnCallbacks {
    /// User context pointer passed to all callbacks.
    pub context: *mut c_void,
    pub on_ip_assigned: IpAssignedCallback,
    pub on_dns_configured: DnsConfiguredCallback,
    pub on_route_pushed: RoutePushedCallback,
    /// Socket protection callback (Android `VpnService.protect`).
    pub protect_socket: ProtectSocketCallback,
}

impl Default for OvpnCallbacks {
    fn default() -> Self {
        Self {
            context: std::ptr::null_mut(),
            on_ip_assigned: None,
            on_dns_configured: None,
            on_route_pushed: None,
            protect_socket: None,
        }
    }
}

// Safety: the embedder guarantees `context` may be used from any thread
// for as long as the registry lives.
unsafe impl Send for OvpnCallbacks {}
unsafe impl Sync for OvpnCallbacks {}

impl OvpnCallbacks {
    pub fn has_protector(&self) -> bool {
        self.protect_socket.is_some()
    }
}

fn c_string(s: &str) -> Option<CString> {
    match CString::new(s) {
        Ok(c) => Some(c),
        Err(_) => {
            warn!("String with interior NUL not passed to callback");
            None
        }
    }
}

impl TunnelObserver for OvpnCallbacks {
    fn on_ip_assigned(&self, tunnel_id: &str, address: IpAddr, prefix_len: u8) {
        let Some(cb) = self.on_ip_assigned else {
            return;
        };
        if let (Some(id), Some(addr)) = (c_string(tunnel_id), c_string(&address.to_string())) {
            cb(self.context, id.as_ptr(), addr.as_ptr(), c_int::from(prefix_len));
        }
    }

    fn on_dns_configured(&self, tunnel_id: &str, servers: &[IpAddr]) {
        let Some(cb) = self.on_dns_configured else {
            return;
        };
        let Some(id) = c_string(tunnel_id) else {
            return;
        };
        let owned: Vec<CString> = servers
            .iter()
            .filter_map(|s| c_string(&s.to_string()))
            .collect();
        let ptrs: Vec<*const c_char> = owned.iter().map(|s| s.as_ptr()).collect();
        cb(self.context, id.as_ptr(), ptrs.as_ptr(), ptrs.len());
    }

    fn on_route_pushed(&self, tunnel_id: &str, address: IpAddr, prefix_len: u8, ipv6: bool) {
        let Some(cb) = self.on_route_pushed else {
            return;
        };
        if let (Some(id), Some(addr)) = (c_string(tunnel_id), c_string(&address.to_string())) {
            cb(self.context, id.as_ptr(), addr.as_ptr(), c_int::from(prefix_len), ipv6);
        }
    }
}

impl SocketProtector for OvpnCallbacks {
    fn protect(&self, fd: RawFd) -> bool {
        match self.protect_socket {
            Some(cb) => cb(self.context, fd),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::sync::Mutex;

    static SEEN: Mutex<Vec<String>> = Mutex::new(Vec::new());

    extern "C" fn record_dns(
        _context: *mut c_void,
        tunnel_id: *const c_char,
        servers: *const *const c_char,
        count: usize,
    ) {
        let id = unsafe { CStr::from_ptr(tunnel_id) }.to_string_lossy().into_owned();
        let list = unsafe { std::slice::from_raw_parts(servers, count) };
        for s in list {
            let server = unsafe { CStr::from_ptr(*s) }.to_string_lossy().into_owned();
            SEEN.lock().unwrap().push(format!("{id} {server}"));
        }
    }

    extern "C" fn refuse(_context: *mut c_void, fd: c_int) -> bool {
        fd == 42
    }

    #[test]
    fn test_dns_strings_marshalled() {
        let callbacks = OvpnCallbacks {
            on_dns_configured: Some(record_dns),
            ..OvpnCallbacks::default()
        };
        callbacks.on_dns_configured(
            "se-1",
            &["10.8.0.1".parse().unwrap(), "fd00::1".parse().unwrap()],
        );
        let seen = SEEN.lock().unwrap().clone();
        assert_eq!(seen, vec!["se-1 10.8.0.1", "se-1 fd00::1"]);
    }

    #[test]
    fn test_protect_without_callback() {
        let none = OvpnCallbacks::default();
        assert!(!none.has_protector());
        assert!(!none.protect(3));

        let some = OvpnCallbacks {
            protect_socket: Some(refuse),
            ..OvpnCallbacks::default()
        };
        assert!(some.protect(42));
        assert!(!some.protect(7));
    }
}
