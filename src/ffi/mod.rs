//! FFI (Foreign Function Interface) module for the Android app.
//!
//! This module provides a C-compatible ABI, and (behind the `jni` feature)
//! JNI entry points for `NativeOpenVpnClient`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    Android App                           │
//! │  ┌─────────────────┐      ┌─────────────────┐            │
//! │  │ Kotlin (JNI)    │      │  C / NDK        │            │
//! │  └────────┬────────┘      └────────┬────────┘            │
//! │           │                        │                     │
//! │  ┌────────▼────────────────────────▼────────┐            │
//! │  │              FFI Layer                   │            │
//! │  │  - ovpn_registry_new()                   │            │
//! │  │  - ovpn_connect()                        │            │
//! │  │  - ovpn_get_app_fd()                     │            │
//! │  │  - ovpn_reconnect_all()                  │            │
//! │  │  - ovpn_disconnect()                     │            │
//! │  │  - ovpn_registry_free()                  │            │
//! │  └────────────────────┬─────────────────────┘            │
//! │                       │                                  │
//! │  ┌────────────────────▼─────────────────────┐            │
//! │  │  SessionRegistry → Session → engine      │            │
//! │  │  VirtualTunFactory → VirtualTunAdapter   │            │
//! │  │  PacketChannel (app fd ⇄ engine end)     │            │
//! │  └──────────────────────────────────────────┘            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage from C
//!
//! ```c
//! OvpnCallbacks cbs = { .context = ctx, .protect_socket = protect };
//! void *reg = ovpn_registry_new(&cbs, NULL);
//! ovpn_connect(reg, "nl-1", profile, "user", "pass");
//! // after the ip callback fired:
//! int fd = ovpn_get_app_fd(reg, "nl-1");
//! // read()/write() whole IP packets on fd
//! ovpn_disconnect(reg, "nl-1");
//! ovpn_registry_free(reg);
//! ```

#[cfg(feature = "jni")]
mod android;
mod callbacks;
mod client;
mod types;

pub use callbacks::*;
pub use client::*;
pub use types::*;
