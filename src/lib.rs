//! Multi-tunnel OpenVPN bridge.
//!
//! Lets several engine sessions run side by side in one process. Each tunnel
//! gets a virtual TUN adapter whose "device" is one end of a
//! message-preserving socket pair; the application reads and writes raw IP
//! packets on the other end.

pub mod adapter;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod logging;
pub mod options;
pub mod registry;
pub mod session;

// Re-export main types
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use registry::SessionRegistry;
pub use session::{Session, SessionState};

/// Library version reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Default configuration constants
pub const DEFAULT_CONFIG_FILE: &str = "ovpn-bridge.json";
pub const DEFAULT_MTU: u16 = options::DEFAULT_MTU;
