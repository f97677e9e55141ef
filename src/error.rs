//! Error types for the tunnel bridge.

use thiserror::Error;

use crate::ffi::OvpnResult;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the bridge.
#[derive(Error, Debug)]
pub enum Error {
    /// Null or empty required input
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// The engine rejected the profile
    #[error("Config evaluation failed: {0}")]
    ConfigEvaluation(String),

    /// Credentials were rejected
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// socketpair() or fcntl() failed
    #[error("Failed to create packet channel: {0}")]
    ChannelCreation(#[source] std::io::Error),

    /// One end of the packet channel has been torn down
    #[error("Packet channel closed")]
    ChannelClosed,

    /// Transport level failure (not auth)
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A connect attempt is already in flight or established
    #[error("Session is already connecting or connected")]
    AlreadyConnected,

    /// The adapter has not started yet
    #[error("Virtual TUN not ready")]
    NotReady,

    /// Engine client could not be constructed
    #[error("Failed to create session: {0}")]
    SessionCreation(String),

    /// Tunnel id already registered
    #[error("Tunnel already exists: {0}")]
    DuplicateTunnel(String),

    /// Tunnel id not registered
    #[error("Unknown tunnel: {0}")]
    UnknownTunnel(String),

    /// Unexpected engine/state inconsistency
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new invalid parameters error.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParameters(msg.into())
    }

    /// Create a new config evaluation error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigEvaluation(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable result code handed across the C/JNI boundary.
    pub fn code(&self) -> OvpnResult {
        match self {
            Self::InvalidParameters(_) | Self::DuplicateTunnel(_) | Self::UnknownTunnel(_) => {
                OvpnResult::InvalidParams
            }
            Self::ConfigEvaluation(_) => OvpnResult::ConfigFailed,
            Self::AuthFailed(_) => OvpnResult::AuthFailed,
            Self::ConnectionFailed(_) | Self::ChannelClosed => OvpnResult::ConnectionFailed,
            Self::AlreadyConnected => OvpnResult::AlreadyConnected,
            Self::NotReady => OvpnResult::NotReady,
            Self::ChannelCreation(_)
            | Self::SessionCreation(_)
            | Self::Internal(_)
            | Self::Io(_) => OvpnResult::Internal,
            Self::Unknown(_) => OvpnResult::Unknown,
        }
    }
}

/// Convert from anyhow::Error for convenience.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::invalid("x").code() as i32, -1);
        assert_eq!(Error::config("x").code() as i32, -2);
        assert_eq!(Error::auth("x").code() as i32, -3);
        assert_eq!(Error::connection("x").code() as i32, -4);
        assert_eq!(Error::Unknown("x".into()).code() as i32, -5);
        assert_eq!(Error::internal("x").code() as i32, -6);
        assert_eq!(Error::NotReady.code() as i32, -7);
        assert_eq!(Error::AlreadyConnected.code() as i32, -8);
    }

    #[test]
    fn test_channel_creation_keeps_os_error() {
        let err = Error::ChannelCreation(std::io::Error::from_raw_os_error(libc::EMFILE));
        assert!(err.to_string().starts_with("Failed to create packet channel"));
        assert_eq!(err.code(), OvpnResult::Internal);
    }
}
