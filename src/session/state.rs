//! Session state machine.

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no connect attempt running.
    Idle,
    /// Profile normalized and handed to the engine.
    Configuring,
    /// Credentials being provided or checked.
    Authenticating,
    /// Handshake running on the worker.
    Connecting,
    /// Engine reported CONNECTED.
    Connected,
    /// Soft restart of the transport.
    Reconnecting,
    /// Stop requested.
    Disconnecting,
    /// Released; terminal.
    Destroyed,
    /// Session-fatal error; needs a new `connect()` or `destroy()`.
    Failed,
}

impl SessionState {
    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Check if a connect attempt is in progress.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            SessionState::Configuring
                | SessionState::Authenticating
                | SessionState::Connecting
                | SessionState::Reconnecting
                | SessionState::Disconnecting
        )
    }

    /// Whether `connect()` may start from here.
    pub fn can_connect(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Destroyed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Configuring => write!(f, "Configuring"),
            SessionState::Authenticating => write!(f, "Authenticating"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Reconnecting => write!(f, "Reconnecting"),
            SessionState::Disconnecting => write!(f, "Disconnecting"),
            SessionState::Destroyed => write!(f, "Destroyed"),
            SessionState::Failed => write!(f, "Failed"),
        }
    }
}
