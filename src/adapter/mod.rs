//! Virtual TUN adapter.
//!
//! Stands in for a kernel TUN device: the engine writes decrypted packets
//! into one end of a [`PacketChannel`](crate::channel::PacketChannel) and
//! polls the same end for outbound packets the application wrote into the
//! other end.

mod factory;
mod tun;

pub use factory::VirtualTunFactory;
pub use tun::{AdapterState, TrafficStats, VirtualTunAdapter};

/// Interface name given to the adapter of tunnel `id`.
pub fn tun_name(tunnel_id: &str) -> String {
    format!("custom_tun_{tunnel_id}")
}
