//! Per-tunnel session control.
//!
//! A [`Session`] owns one engine client and drives it through
//! configure → authenticate → connect → (reconnect) → disconnect → destroy.
//! The blocking handshake runs on a dedicated worker thread; progress comes
//! back only through engine events delivered to [`hooks::SessionHooks`].

mod controller;
mod hooks;
mod state;

pub use controller::{ConnectOutcome, Session, NO_ERROR};
pub use state::SessionState;
