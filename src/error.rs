//! Error handling for the conference server

use std::fmt;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Conference server error types
#[derive(Debug, Clone)]
pub enum ServerError {
    /// An endpoint could not be bound at startup
    Bind(String),
    /// Malformed wire framing or out-of-state command
    Protocol(String),
    /// Roster full or file too large
    Capacity(String),
    /// Operation refused for the requesting participant
    Permission(String),
    /// A transfer ended before the declared length
    Incomplete(String),
    /// A write to a participant failed
    PeerGone(String),
    /// A bounded wait expired
    Timeout(String),
    /// Transport-level failure
    Io(String),
}

impl ServerError {
    /// Create a bind error
    pub fn bind<T: Into<String>>(msg: T) -> Self {
        ServerError::Bind(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        ServerError::Protocol(msg.into())
    }

    /// Create a capacity error
    pub fn capacity<T: Into<String>>(msg: T) -> Self {
        ServerError::Capacity(msg.into())
    }

    /// Create a permission error
    pub fn permission<T: Into<String>>(msg: T) -> Self {
        ServerError::Permission(msg.into())
    }

    /// Create an incomplete-transfer error
    pub fn incomplete<T: Into<String>>(msg: T) -> Self {
        ServerError::Incomplete(msg.into())
    }

    /// Create a peer-gone error
    pub fn peer_gone<T: Into<String>>(msg: T) -> Self {
        ServerError::PeerGone(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        ServerError::Timeout(msg.into())
    }

    /// The reason text for an `ERROR:<reason>` line where the plane permits one
    pub fn wire_reason(&self) -> &str {
        match self {
            ServerError::Bind(msg)
            | ServerError::Protocol(msg)
            | ServerError::Capacity(msg)
            | ServerError::Permission(msg)
            | ServerError::Incomplete(msg)
            | ServerError::PeerGone(msg)
            | ServerError::Timeout(msg)
            | ServerError::Io(msg) => msg,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(msg) => write!(f, "Bind error: {}", msg),
            ServerError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ServerError::Capacity(msg) => write!(f, "Capacity exceeded: {}", msg),
            ServerError::Permission(msg) => write!(f, "Permission denied: {}", msg),
            ServerError::Incomplete(msg) => write!(f, "Incomplete transfer: {}", msg),
            ServerError::PeerGone(msg) => write!(f, "Peer gone: {}", msg),
            ServerError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ServerError::Io(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Protocol(format!("JSON error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for ServerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ServerError::Timeout("operation timed out".to_string())
    }
}
