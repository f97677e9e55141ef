//! FFI types for C interoperability.

use std::ffi::{c_int, c_void};

use crate::error::Error;

/// Result codes for FFI functions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvpnResult {
    /// Operation succeeded.
    Ok = 0,
    /// Null or empty argument, unknown or duplicate tunnel.
    InvalidParams = -1,
    /// The engine rejected the profile.
    ConfigFailed = -2,
    /// Credentials were rejected.
    AuthFailed = -3,
    /// Transport failure.
    ConnectionFailed = -4,
    Unknown = -5,
    /// Resource or state failure inside the bridge.
    Internal = -6,
    /// The virtual TUN has not started yet.
    NotReady = -7,
    /// A connect attempt is already in flight or established.
    AlreadyConnected = -8,
}

impl OvpnResult {
    pub fn is_ok(self) -> bool {
        self == OvpnResult::Ok
    }
}

impl From<&Error> for OvpnResult {
    fn from(err: &Error) -> Self {
        err.code()
    }
}

impl<T> From<&crate::error::Result<T>> for OvpnResult {
    fn from(result: &crate::error::Result<T>) -> Self {
        match result {
            Ok(_) => OvpnResult::Ok,
            Err(e) => e.code(),
        }
    }
}

/// Opaque handle to a registry instance.
/// This is actually a pointer to the internal Rust struct.
pub type OvpnHandle = *mut c_void;

/// Null handle constant.
pub const OVPN_HANDLE_NULL: OvpnHandle = std::ptr::null_mut();

/// Returned by `ovpn_get_app_fd` when no descriptor is available.
pub const OVPN_INVALID_FD: c_int = -1;
