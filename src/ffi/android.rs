//! Android platform bindings via JNI (Java Native Interface).
//!
//! This module provides JNI-compatible functions that can be called directly
//! from Kotlin/Java on Android. They drive the same [`FfiRegistry`] as the
//! C ABI.
//!
//! # Package Name
//! The JNI functions are named for package: `com.multiregionvpn.core.vpnclient`
//! Class: `NativeOpenVpnClient`

use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use jni::objects::{GlobalRef, JClass, JObject, JString, JValue};
use jni::sys::{jboolean, jint, jlong, jstring, JNI_FALSE, JNI_TRUE};
use jni::{JNIEnv, JavaVM};
use tracing::{error, warn};

use super::client::{ovpn_registry_free, registry_ref, FfiRegistry};
use super::types::*;
use crate::config::SessionConfig;
use crate::engine::{LoopbackBuilder, SocketProtector, TunnelObserver};

/// Global references needed to call back into Kotlin from engine threads.
struct JniCallbackContext {
    /// The JVM reference for callbacks
    jvm: JavaVM,
    /// Global reference to the NativeOpenVpnClient object
    client_ref: GlobalRef,
    /// Global reference to the VpnService, for `protect()`
    vpn_service: Option<GlobalRef>,
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a String from a JString, returning None if null or invalid
fn get_string(env: &mut JNIEnv, s: &JString) -> Option<String> {
    if s.is_null() {
        return None;
    }
    env.get_string(s).ok().map(|s| s.into())
}

/// Clear a pending Java exception so later JNI calls stay valid.
fn clear_exception(env: &mut JNIEnv, what: &str) {
    if env.exception_check().unwrap_or(false) {
        let _ = env.exception_describe();
        let _ = env.exception_clear();
        warn!("Java exception in {what}");
    }
}

fn to_jstring(env: &mut JNIEnv, s: &str) -> jstring {
    env.new_string(s)
        .map(|s| s.into_raw())
        .unwrap_or(std::ptr::null_mut())
}

// =============================================================================
// Callbacks into Kotlin
// =============================================================================

impl TunnelObserver for JniCallbackContext {
    fn on_ip_assigned(&self, tunnel_id: &str, address: IpAddr, prefix_len: u8) {
        let Ok(mut env) = self.jvm.attach_current_thread() else {
            warn!(tunnel = %tunnel_id, "Cannot attach thread for IP callback");
            return;
        };
        let (Ok(id), Ok(ip)) = (env.new_string(tunnel_id), env.new_string(address.to_string())) else {
            return;
        };
        let _ = env.call_method(
            &self.client_ref,
            "onTunnelIpReceived",
            "(Ljava/lang/String;Ljava/lang/String;I)V",
            &[JValue::Object(&id), JValue::Object(&ip), JValue::Int(jint::from(prefix_len))],
        );
        clear_exception(&mut env, "onTunnelIpReceived");
    }

    fn on_dns_configured(&self, tunnel_id: &str, servers: &[IpAddr]) {
        let Ok(mut env) = self.jvm.attach_current_thread() else {
            warn!(tunnel = %tunnel_id, "Cannot attach thread for DNS callback");
            return;
        };
        let capacity = jint::try_from(servers.len()).unwrap_or(jint::MAX);
        let Ok(list) = env.new_object("java/util/ArrayList", "(I)V", &[JValue::Int(capacity)]) else {
            clear_exception(&mut env, "ArrayList.<init>");
            return;
        };
        for server in servers {
            if let Ok(s) = env.new_string(server.to_string()) {
                let _ = env.call_method(
                    &list,
                    "add",
                    "(Ljava/lang/Object;)Z",
                    &[JValue::Object(&s)],
                );
            }
        }
        let Ok(id) = env.new_string(tunnel_id) else {
            return;
        };
        let _ = env.call_method(
            &self.client_ref,
            "onTunnelDnsReceived",
            "(Ljava/lang/String;Ljava/util/List;)V",
            &[JValue::Object(&id), JValue::Object(&list)],
        );
        clear_exception(&mut env, "onTunnelDnsReceived");
    }

    fn on_route_pushed(&self, tunnel_id: &str, address: IpAddr, prefix_len: u8, ipv6: bool) {
        let Ok(mut env) = self.jvm.attach_current_thread() else {
            warn!(tunnel = %tunnel_id, "Cannot attach thread for route callback");
            return;
        };
        let (Ok(id), Ok(addr)) = (env.new_string(tunnel_id), env.new_string(address.to_string())) else {
            return;
        };
        let _ = env.call_method(
            &self.client_ref,
            "onTunnelRouteReceived",
            "(Ljava/lang/String;Ljava/lang/String;IZ)V",
            &[
                JValue::Object(&id),
                JValue::Object(&addr),
                JValue::Int(jint::from(prefix_len)),
                JValue::Bool(if ipv6 { JNI_TRUE } else { JNI_FALSE }),
            ],
        );
        clear_exception(&mut env, "onTunnelRouteReceived");
    }
}

impl SocketProtector for JniCallbackContext {
    fn protect(&self, fd: RawFd) -> bool {
        let Some(service) = &self.vpn_service else {
            return false;
        };
        let Ok(mut env) = self.jvm.attach_current_thread() else {
            return false;
        };
        let result = env
            .call_method(service, "protect", "(I)Z", &[JValue::Int(fd)])
            .and_then(|v| v.z());
        clear_exception(&mut env, "VpnService.protect");
        result.unwrap_or(false)
    }
}

// =============================================================================
// JNI Native Methods
// =============================================================================

/// Create the native registry for this client object.
///
/// `vpn_service` may be null (sockets are then left unprotected);
/// `config_json` may be null for defaults.
#[no_mangle]
pub extern "system" fn Java_com_multiregionvpn_core_vpnclient_NativeOpenVpnClient_nativeInit(
    mut env: JNIEnv,
    obj: JObject,
    vpn_service: JObject,
    config_json: JString,
) -> jlong {
    let config = match get_string(&mut env, &config_json) {
        Some(json) => match SessionConfig::from_json(&json) {
            Ok(c) => c,
            Err(e) => {
                error!("Rejected session config: {e:#}");
                return 0;
            }
        },
        None => SessionConfig::default(),
    };

    let Ok(jvm) = env.get_java_vm() else {
        return 0;
    };
    let Ok(client_ref) = env.new_global_ref(&obj) else {
        return 0;
    };
    let vpn_service = if vpn_service.is_null() {
        None
    } else {
        env.new_global_ref(&vpn_service).ok()
    };
    let has_service = vpn_service.is_some();

    let ctx = Arc::new(JniCallbackContext {
        jvm,
        client_ref,
        vpn_service,
    });
    let protector = has_service.then(|| ctx.clone() as Arc<dyn SocketProtector>);

    let registry = FfiRegistry::new(Arc::new(LoopbackBuilder::default()), ctx, protector, config);
    registry.into_handle() as jlong
}

/// Destroy every tunnel and free the registry.
#[no_mangle]
pub extern "system" fn Java_com_multiregionvpn_core_vpnclient_NativeOpenVpnClient_nativeRelease(
    _env: JNIEnv,
    _obj: JObject,
    handle: jlong,
) {
    if handle == 0 {
        return;
    }
    unsafe { ovpn_registry_free(handle as OvpnHandle) }
}

/// Start connecting a tunnel. Returns an `OvpnResult` code.
#[no_mangle]
pub extern "system" fn Java_com_multiregionvpn_core_vpnclient_NativeOpenVpnClient_nativeConnect(
    mut env: JNIEnv,
    _obj: JObject,
    handle: jlong,
    tunnel_id: JString,
    config: JString,
    username: JString,
    password: JString,
) -> jint {
    let Some(registry) = (unsafe { registry_ref(handle as OvpnHandle) }) else {
        return OvpnResult::InvalidParams as jint;
    };
    let (Some(id), Some(profile), Some(user), Some(pass)) = (
        get_string(&mut env, &tunnel_id),
        get_string(&mut env, &config),
        get_string(&mut env, &username),
        get_string(&mut env, &password),
    ) else {
        return OvpnResult::InvalidParams as jint;
    };

    match registry.connect(&id, &profile, &user, &pass) {
        Ok(()) => OvpnResult::Ok as jint,
        Err(e) => {
            warn!(tunnel = %id, error = %e, "Connect rejected");
            e.code() as jint
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_com_multiregionvpn_core_vpnclient_NativeOpenVpnClient_nativeDisconnect(
    mut env: JNIEnv,
    _obj: JObject,
    handle: jlong,
    tunnel_id: JString,
) {
    let Some(registry) = (unsafe { registry_ref(handle as OvpnHandle) }) else {
        return;
    };
    if let Some(id) = get_string(&mut env, &tunnel_id) {
        registry.disconnect(&id);
    }
}

#[no_mangle]
pub extern "system" fn Java_com_multiregionvpn_core_vpnclient_NativeOpenVpnClient_nativeIsConnected(
    mut env: JNIEnv,
    _obj: JObject,
    handle: jlong,
    tunnel_id: JString,
) -> jboolean {
    let Some(registry) = (unsafe { registry_ref(handle as OvpnHandle) }) else {
        return JNI_FALSE;
    };
    match get_string(&mut env, &tunnel_id) {
        Some(id) if registry.is_connected(&id) => JNI_TRUE,
        _ => JNI_FALSE,
    }
}

#[no_mangle]
pub extern "system" fn Java_com_multiregionvpn_core_vpnclient_NativeOpenVpnClient_nativeGetLastError(
    mut env: JNIEnv,
    _obj: JObject,
    handle: jlong,
    tunnel_id: JString,
) -> jstring {
    let message = match (unsafe { registry_ref(handle as OvpnHandle) }, get_string(&mut env, &tunnel_id)) {
        (Some(registry), Some(id)) => registry.last_error(&id),
        _ => "Invalid session handle".to_string(),
    };
    to_jstring(&mut env, &message)
}

/// Application descriptor of a tunnel, `-1` when not ready.
#[no_mangle]
pub extern "system" fn Java_com_multiregionvpn_core_vpnclient_NativeOpenVpnClient_nativeGetAppFd(
    mut env: JNIEnv,
    _obj: JObject,
    handle: jlong,
    tunnel_id: JString,
) -> jint {
    let Some(registry) = (unsafe { registry_ref(handle as OvpnHandle) }) else {
        return OVPN_INVALID_FD;
    };
    get_string(&mut env, &tunnel_id)
        .and_then(|id| registry.registry().app_descriptor(&id).ok())
        .unwrap_or(OVPN_INVALID_FD)
}

/// Returns 1 when a reconnect was requested, 0 when idle, negative on error.
#[no_mangle]
pub extern "system" fn Java_com_multiregionvpn_core_vpnclient_NativeOpenVpnClient_nativeReconnect(
    mut env: JNIEnv,
    _obj: JObject,
    handle: jlong,
    tunnel_id: JString,
) -> jint {
    let Some(registry) = (unsafe { registry_ref(handle as OvpnHandle) }) else {
        return OvpnResult::InvalidParams as jint;
    };
    let Some(id) = get_string(&mut env, &tunnel_id) else {
        return OvpnResult::InvalidParams as jint;
    };
    match registry.reconnect(&id) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(e) => e.code() as jint,
    }
}

/// Network changed: soft-reconnect every active tunnel.
#[no_mangle]
pub extern "system" fn Java_com_multiregionvpn_core_vpnclient_NativeOpenVpnClient_nativeReconnectAll(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jint {
    match unsafe { registry_ref(handle as OvpnHandle) } {
        Some(registry) => jint::try_from(registry.registry().reconnect_all()).unwrap_or(jint::MAX),
        None => OvpnResult::InvalidParams as jint,
    }
}
