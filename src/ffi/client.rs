//! C-callable functions over a [`SessionRegistry`].

use std::ffi::{c_char, c_int, CStr, CString};
use std::os::fd::IntoRawFd;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::callbacks::OvpnCallbacks;
use super::types::*;
use crate::config::SessionConfig;
use crate::engine::{EngineBuilder, LoopbackBuilder, SocketProtector, TunnelObserver};
use crate::error::{Error, Result};
use crate::registry::SessionRegistry;
use crate::session::{Session, NO_ERROR};

/// State behind an [`OvpnHandle`]: the registry plus everything needed to
/// create sessions for it.
pub struct FfiRegistry {
    registry: SessionRegistry,
    builder: Arc<dyn EngineBuilder>,
    observer: Arc<dyn TunnelObserver>,
    protector: Option<Arc<dyn SocketProtector>>,
    config: SessionConfig,
}

impl FfiRegistry {
    pub fn new(
        builder: Arc<dyn EngineBuilder>,
        observer: Arc<dyn TunnelObserver>,
        protector: Option<Arc<dyn SocketProtector>>,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            builder,
            observer,
            protector,
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Connect tunnel `id`, creating its session on first use.
    ///
    /// A failed session stays registered so its last error can be read.
    pub fn connect(&self, id: &str, profile: &str, username: &str, password: &str) -> Result<()> {
        let session = match self.registry.get(id) {
            Some(existing) => existing,
            None => {
                let session = Session::create(
                    id,
                    self.builder.as_ref(),
                    Some(Arc::downgrade(&self.observer)),
                    self.protector.clone(),
                    self.config.clone(),
                )?;
                self.registry.insert(session.clone())?;
                session
            }
        };
        session.connect(profile, username, password).map(|_| ())
    }

    /// Tear tunnel `id` down and forget it. Unknown ids are ignored.
    pub fn disconnect(&self, id: &str) {
        match self.registry.remove(id) {
            Some(session) => session.destroy(),
            None => debug!(tunnel = %id, "Disconnect for unknown tunnel"),
        }
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.registry.get(id).is_some_and(|s| s.is_connected())
    }

    pub fn last_error(&self, id: &str) -> String {
        match self.registry.get(id) {
            Some(session) => session.last_error(),
            None => NO_ERROR.to_string(),
        }
    }

    pub fn reconnect(&self, id: &str) -> Result<bool> {
        self.registry
            .get(id)
            .ok_or_else(|| Error::UnknownTunnel(id.to_string()))?
            .reconnect()
    }

    pub fn pause(&self, id: &str, reason: &str) -> Result<()> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| Error::UnknownTunnel(id.to_string()))?;
        session.pause(reason);
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<()> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| Error::UnknownTunnel(id.to_string()))?;
        session.resume();
        Ok(())
    }

    /// Move into a raw handle for C callers.
    pub fn into_handle(self) -> OvpnHandle {
        Arc::into_raw(Arc::new(self)) as OvpnHandle
    }
}

/// Convert a C string to a Rust string.
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Borrow the registry behind a handle without taking ownership.
pub(super) unsafe fn registry_ref<'a>(handle: OvpnHandle) -> Option<&'a FfiRegistry> {
    (handle as *const FfiRegistry).as_ref()
}

// =============================================================================
// FFI Functions - C ABI
// =============================================================================

/// Create a registry backed by the built-in engine.
///
/// # Parameters
/// - `callbacks`: Optional callbacks for pushed configuration and socket protection.
/// - `config_json`: Optional `SessionConfig` as JSON; null uses defaults.
///
/// # Returns
/// Handle to the registry, or NULL on error.
///
/// # Safety
/// - `callbacks`, if not null, must point to a valid `OvpnCallbacks` whose
///   context stays valid until `ovpn_registry_free`.
/// - `config_json`, if not null, must be a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn ovpn_registry_new(
    callbacks: *const OvpnCallbacks,
    config_json: *const c_char,
) -> OvpnHandle {
    let config = if config_json.is_null() {
        SessionConfig::default()
    } else {
        let Some(json) = cstr_to_string(config_json) else {
            return OVPN_HANDLE_NULL;
        };
        match SessionConfig::from_json(&json) {
            Ok(c) => c,
            Err(e) => {
                error!("Rejected session config: {e:#}");
                return OVPN_HANDLE_NULL;
            }
        }
    };

    let cbs = if callbacks.is_null() {
        OvpnCallbacks::default()
    } else {
        *callbacks
    };
    let cbs = Arc::new(cbs);
    let protector = cbs
        .has_protector()
        .then(|| cbs.clone() as Arc<dyn SocketProtector>);

    let registry = FfiRegistry::new(
        Arc::new(LoopbackBuilder::default()),
        cbs,
        protector,
        config,
    );
    info!("Registry created");
    registry.into_handle()
}

/// Destroy every session and free the registry.
///
/// # Safety
/// - `handle` must be a valid handle from `ovpn_registry_new` (or null).
/// - `handle` must not be used after this call.
#[no_mangle]
pub unsafe extern "C" fn ovpn_registry_free(handle: OvpnHandle) {
    if handle.is_null() {
        return;
    }
    let registry = Arc::from_raw(handle as *const FfiRegistry);
    registry.registry.shutdown();
    drop(registry);
}

/// Start connecting a tunnel. Progress is reported through callbacks and
/// `ovpn_is_connected`.
///
/// # Returns
/// - `OvpnResult::Ok` if the connect attempt started.
/// - Error code otherwise; details via `ovpn_get_last_error`.
///
/// # Safety
/// - `handle` must be valid; string arguments must be null-terminated UTF-8.
#[no_mangle]
pub unsafe extern "C" fn ovpn_connect(
    handle: OvpnHandle,
    tunnel_id: *const c_char,
    profile: *const c_char,
    username: *const c_char,
    password: *const c_char,
) -> OvpnResult {
    let Some(registry) = registry_ref(handle) else {
        return OvpnResult::InvalidParams;
    };
    let (Some(id), Some(profile), Some(user), Some(pass)) = (
        cstr_to_string(tunnel_id),
        cstr_to_string(profile),
        cstr_to_string(username),
        cstr_to_string(password),
    ) else {
        return OvpnResult::InvalidParams;
    };

    match registry.connect(&id, &profile, &user, &pass) {
        Ok(()) => OvpnResult::Ok,
        Err(e) => {
            warn!(tunnel = %id, error = %e, "Connect rejected");
            e.code()
        }
    }
}

/// Disconnect and destroy a tunnel.
///
/// # Safety
/// - `handle` must be valid; `tunnel_id` must be null-terminated UTF-8.
#[no_mangle]
pub unsafe extern "C" fn ovpn_disconnect(handle: OvpnHandle, tunnel_id: *const c_char) -> OvpnResult {
    let (Some(registry), Some(id)) = (registry_ref(handle), cstr_to_string(tunnel_id)) else {
        return OvpnResult::InvalidParams;
    };
    registry.disconnect(&id);
    OvpnResult::Ok
}

/// # Safety
/// - `handle` must be valid; `tunnel_id` must be null-terminated UTF-8.
#[no_mangle]
pub unsafe extern "C" fn ovpn_is_connected(handle: OvpnHandle, tunnel_id: *const c_char) -> bool {
    match (registry_ref(handle), cstr_to_string(tunnel_id)) {
        (Some(registry), Some(id)) => registry.is_connected(&id),
        _ => false,
    }
}

/// Last error of a tunnel. Never null; free with `ovpn_string_free`.
///
/// # Safety
/// - `handle` must be valid; `tunnel_id` must be null-terminated UTF-8.
#[no_mangle]
pub unsafe extern "C" fn ovpn_get_last_error(
    handle: OvpnHandle,
    tunnel_id: *const c_char,
) -> *mut c_char {
    let message = match (registry_ref(handle), cstr_to_string(tunnel_id)) {
        (Some(registry), Some(id)) => registry.last_error(&id),
        _ => "Invalid session handle".to_string(),
    };
    let message = message.replace('\0', " ");
    match CString::new(message) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Application end of the tunnel's packet channel.
///
/// The descriptor stays owned by the library; do not close it.
///
/// # Returns
/// The descriptor, or `-1` if the tunnel is unknown or not started yet.
///
/// # Safety
/// - `handle` must be valid; `tunnel_id` must be null-terminated UTF-8.
#[no_mangle]
pub unsafe extern "C" fn ovpn_get_app_fd(handle: OvpnHandle, tunnel_id: *const c_char) -> c_int {
    let (Some(registry), Some(id)) = (registry_ref(handle), cstr_to_string(tunnel_id)) else {
        return OVPN_INVALID_FD;
    };
    match registry.registry.app_descriptor(&id) {
        Ok(fd) => fd,
        Err(e) => {
            debug!(tunnel = %id, error = %e, "No application descriptor");
            OVPN_INVALID_FD
        }
    }
}

/// Duplicate of the application end that the caller owns and must close.
///
/// # Returns
/// The new descriptor, or `-1` if the tunnel is unknown or not started yet.
///
/// # Safety
/// - `handle` must be valid; `tunnel_id` must be null-terminated UTF-8.
#[no_mangle]
pub unsafe extern "C" fn ovpn_take_app_fd(handle: OvpnHandle, tunnel_id: *const c_char) -> c_int {
    let (Some(registry), Some(id)) = (registry_ref(handle), cstr_to_string(tunnel_id)) else {
        return OVPN_INVALID_FD;
    };
    match registry.registry.take_app_descriptor(&id) {
        Ok(fd) => fd.into_raw_fd(),
        Err(e) => {
            debug!(tunnel = %id, error = %e, "No application descriptor to hand out");
            OVPN_INVALID_FD
        }
    }
}

/// Pause a tunnel, e.g. while the device has no network.
///
/// # Safety
/// - `handle` must be valid; string arguments must be null-terminated UTF-8.
/// - `reason` may be null.
#[no_mangle]
pub unsafe extern "C" fn ovpn_pause(
    handle: OvpnHandle,
    tunnel_id: *const c_char,
    reason: *const c_char,
) -> OvpnResult {
    let (Some(registry), Some(id)) = (registry_ref(handle), cstr_to_string(tunnel_id)) else {
        return OvpnResult::InvalidParams;
    };
    let reason = cstr_to_string(reason).unwrap_or_default();
    OvpnResult::from(&registry.pause(&id, &reason))
}

/// Resume a paused tunnel.
///
/// # Safety
/// - `handle` must be valid; `tunnel_id` must be null-terminated UTF-8.
#[no_mangle]
pub unsafe extern "C" fn ovpn_resume(handle: OvpnHandle, tunnel_id: *const c_char) -> OvpnResult {
    let (Some(registry), Some(id)) = (registry_ref(handle), cstr_to_string(tunnel_id)) else {
        return OvpnResult::InvalidParams;
    };
    OvpnResult::from(&registry.resume(&id))
}

/// Soft-reconnect one tunnel.
///
/// # Returns
/// `1` if a reconnect was requested, `0` if the tunnel was idle, a negative
/// `OvpnResult` otherwise.
///
/// # Safety
/// - `handle` must be valid; `tunnel_id` must be null-terminated UTF-8.
#[no_mangle]
pub unsafe extern "C" fn ovpn_reconnect(handle: OvpnHandle, tunnel_id: *const c_char) -> c_int {
    let (Some(registry), Some(id)) = (registry_ref(handle), cstr_to_string(tunnel_id)) else {
        return OvpnResult::InvalidParams as c_int;
    };
    match registry.reconnect(&id) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(e) => e.code() as c_int,
    }
}

/// Soft-reconnect every active tunnel after a network change.
///
/// # Returns
/// Number of tunnels reconnected, or `-1` for a null handle.
///
/// # Safety
/// - `handle` must be valid.
#[no_mangle]
pub unsafe extern "C" fn ovpn_reconnect_all(handle: OvpnHandle) -> c_int {
    match registry_ref(handle) {
        Some(registry) => c_int::try_from(registry.registry.reconnect_all()).unwrap_or(c_int::MAX),
        None => OvpnResult::InvalidParams as c_int,
    }
}

/// Free a string returned by this library.
///
/// # Safety
/// - `s` must come from this library and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn ovpn_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    unsafe fn last_error(handle: OvpnHandle, id: &CString) -> String {
        let ptr = ovpn_get_last_error(handle, id.as_ptr());
        let s = CStr::from_ptr(ptr).to_string_lossy().into_owned();
        ovpn_string_free(ptr);
        s
    }

    #[test]
    fn test_null_handle_is_rejected() {
        unsafe {
            let id = c("a");
            assert_eq!(
                ovpn_connect(OVPN_HANDLE_NULL, id.as_ptr(), id.as_ptr(), id.as_ptr(), id.as_ptr()),
                OvpnResult::InvalidParams
            );
            assert!(!ovpn_is_connected(OVPN_HANDLE_NULL, id.as_ptr()));
            assert_eq!(ovpn_get_app_fd(OVPN_HANDLE_NULL, id.as_ptr()), -1);
            assert_eq!(ovpn_reconnect_all(OVPN_HANDLE_NULL), -1);
            assert_eq!(last_error(OVPN_HANDLE_NULL, &id), "Invalid session handle");
            ovpn_registry_free(OVPN_HANDLE_NULL);
        }
    }

    #[test]
    fn test_bad_config_json() {
        unsafe {
            let json = c(r#"{"compression_mode": "lz4"}"#);
            assert!(ovpn_registry_new(std::ptr::null(), json.as_ptr()).is_null());
        }
    }

    #[test]
    fn test_connect_errors_and_fd_sentinel() {
        unsafe {
            let handle = ovpn_registry_new(std::ptr::null(), std::ptr::null());
            assert!(!handle.is_null());
            let id = c("nl-1");
            let profile = c("client\nremote 127.0.0.1 1194\n");
            let empty = c("");

            assert_eq!(last_error(handle, &id), "No error");
            assert_eq!(
                ovpn_connect(handle, id.as_ptr(), profile.as_ptr(), empty.as_ptr(), empty.as_ptr()),
                OvpnResult::InvalidParams
            );
            assert!(last_error(handle, &id).contains("Credentials are empty"));
            assert_eq!(ovpn_get_app_fd(handle, id.as_ptr()), -1);
            assert_eq!(ovpn_reconnect(handle, id.as_ptr()), 0);
            let other = c("other");
            assert_eq!(ovpn_reconnect(handle, other.as_ptr()), -1);

            assert_eq!(ovpn_disconnect(handle, id.as_ptr()), OvpnResult::Ok);
            assert_eq!(last_error(handle, &id), "No error");
            ovpn_registry_free(handle);
        }
    }

    #[test]
    fn test_loopback_tunnel_over_c_abi() {
        unsafe {
            let handle = ovpn_registry_new(std::ptr::null(), std::ptr::null());
            let id = c("de-1");
            let profile = c("client\nremote 127.0.0.1 1194\n");
            let user = c("user");
            let reason = c("no network");
            assert_eq!(
                ovpn_connect(handle, id.as_ptr(), profile.as_ptr(), user.as_ptr(), user.as_ptr()),
                OvpnResult::Ok
            );
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
            while !ovpn_is_connected(handle, id.as_ptr()) && std::time::Instant::now() < deadline {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            assert!(ovpn_is_connected(handle, id.as_ptr()));

            let borrowed = ovpn_get_app_fd(handle, id.as_ptr());
            let owned = ovpn_take_app_fd(handle, id.as_ptr());
            assert!(borrowed >= 0 && owned >= 0);
            assert_ne!(borrowed, owned);
            assert_eq!(libc::close(owned), 0);

            assert_eq!(ovpn_pause(handle, id.as_ptr(), reason.as_ptr()), OvpnResult::Ok);
            assert_eq!(ovpn_resume(handle, id.as_ptr()), OvpnResult::Ok);
            let session = registry_ref(handle).unwrap().registry().get("de-1").unwrap();
            let names = || -> Vec<String> {
                session.recent_events().iter().map(|e| e.kind.to_string()).collect()
            };
            while !names().contains(&"RESUME".to_string()) && std::time::Instant::now() < deadline {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            let names = names();
            let pause = names.iter().position(|n| n == "PAUSE").unwrap();
            let resume = names.iter().position(|n| n == "RESUME").unwrap();
            assert!(pause < resume);

            let unknown = c("nowhere");
            assert_eq!(ovpn_take_app_fd(handle, unknown.as_ptr()), -1);
            assert_eq!(ovpn_resume(handle, unknown.as_ptr()), OvpnResult::InvalidParams);

            assert_eq!(ovpn_disconnect(handle, id.as_ptr()), OvpnResult::Ok);
            ovpn_registry_free(handle);
        }
    }
}
