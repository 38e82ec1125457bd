//! Server error types.

use std::io;
use thiserror::Error;

use indibus_protocol::ErrorCode;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the broker.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket, child process, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, encoding, etc.).
    #[error("Protocol error: {0}")]
    Protocol(#[from] indibus_protocol::ProtocolError),

    /// Control socket path already in use.
    #[error("Socket path already in use: {path}")]
    SocketInUse { path: String },

    /// Control socket parent directory does not exist.
    #[error("Socket path parent directory does not exist: {path}")]
    SocketPathInvalid { path: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// No driver matches the identifier.
    #[error("Unknown driver: {identifier}")]
    UnknownDriver { identifier: String },

    /// A backend with this identifier is already running.
    #[error("Driver already loaded: {identifier}")]
    AlreadyLoaded { identifier: String },

    /// A device backend failed to start.
    #[error("Failed to start {target}: {reason}")]
    DeviceStart { target: String, reason: String },

    /// Shutdown requested.
    #[error("Server shutdown requested")]
    Shutdown,
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn socket_in_use(path: impl Into<String>) -> Self {
        Self::SocketInUse { path: path.into() }
    }

    pub fn socket_path_invalid(path: impl Into<String>) -> Self {
        Self::SocketPathInvalid { path: path.into() }
    }

    pub fn unknown_driver(identifier: impl Into<String>) -> Self {
        Self::UnknownDriver {
            identifier: identifier.into(),
        }
    }

    pub fn already_loaded(identifier: impl Into<String>) -> Self {
        Self::AlreadyLoaded {
            identifier: identifier.into(),
        }
    }

    pub fn device_start(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::DeviceStart {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Maps this error onto a control protocol error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownDriver { .. } => ErrorCode::UnknownDriver,
            Self::AlreadyLoaded { .. } => ErrorCode::AlreadyLoaded,
            Self::DeviceStart { .. } => ErrorCode::DriverFailed,
            Self::Config { .. } => ErrorCode::InvalidRequest,
            Self::Shutdown => ErrorCode::ShuttingDown,
            _ => ErrorCode::InternalError,
        }
    }
}
