//! Error Types
//!
//! One error enum per concern. Channel failures are [`TransportError`],
//! setup failures are [`ConfigError`] and [`RegistryError`], and the two
//! façades aggregate them in [`ServerError`] and [`ClientError`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::channel::MessagePattern;

/// Errors raised by a message channel
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to peer failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection was closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send message
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Message serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO error from underlying transport
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Channel not in expected state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Frame checksum mismatch - data corruption detected
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum value
        expected: u32,
        /// Actual checksum value received
        actual: u32,
    },
}

/// Errors that can occur when loading or validating options
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A required option was not provided by any source
    #[error("Missing required option: {0}")]
    MissingOption(&'static str),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Registration errors, surfaced before serving begins
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler is already bound to this pattern
    #[error("A handler is already registered for pattern '{0}'")]
    DuplicatePattern(MessagePattern),

    /// An instance with this name is already registered
    #[error("An instance named '{0}' is already registered")]
    DuplicateInstance(String),

    /// An instance declares a dependency that was never registered
    #[error("Instance '{instance}' depends on unknown instance '{dependency}'")]
    UnknownDependency {
        /// The instance declaring the dependency
        instance: String,
        /// The missing dependency name
        dependency: String,
    },
}

/// Failure of a lifecycle hook
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HookError {
    /// The hook ran and reported a failure
    #[error("Hook on '{instance}' failed: {message}")]
    Failed {
        /// Name of the instance whose hook failed
        instance: String,
        /// Failure description
        message: String,
    },

    /// The hook did not settle within the configured hook timeout
    #[error("Hook on '{instance}' did not complete within {timeout:?}")]
    TimedOut {
        /// Name of the instance whose hook timed out
        instance: String,
        /// The configured timeout
        timeout: Duration,
    },
}

impl HookError {
    /// Build a failure for the named instance
    pub fn failed(instance: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            instance: instance.into(),
            message: message.into(),
        }
    }
}

/// Failure returned by a message handler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    /// Failure description, forwarded to the channel's error event
    pub message: String,
}

impl HandlerError {
    /// Create a handler error from any displayable message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Errors from [`TransportServer`](crate::server::TransportServer)
#[derive(Debug, Error)]
pub enum ServerError {
    /// The channel failed to start or stop
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An `on_ipc_init` hook failed, readiness was never signalled
    #[error(transparent)]
    Hook(#[from] HookError),

    /// Registered instances are inconsistent
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Server was asked to do something its state does not allow
    #[error("Invalid server state: {0}")]
    InvalidState(String),
}

/// Errors from [`TransportClient`](crate::client::TransportClient)
#[derive(Debug, Error)]
pub enum ClientError {
    /// The channel reported a failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The peer (or the channel) answered a request with an error
    #[error("Request on '{pattern}' failed: {error}")]
    Remote {
        /// Pattern of the failed request
        pattern: MessagePattern,
        /// Error payload delivered on the channel's error event
        error: serde_json::Value,
    },

    /// No response arrived within the configured request timeout
    #[error("Request on '{pattern}' timed out after {timeout:?}")]
    Timeout {
        /// Pattern of the abandoned request
        pattern: MessagePattern,
        /// The configured timeout
        timeout: Duration,
    },

    /// The result callback was dropped without being invoked
    #[error("Request on '{0}' was abandoned")]
    Abandoned(MessagePattern),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::ConnectionFailed("test".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = TransportError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = TransportError::ChecksumMismatch {
            expected: 0xDEAD_BEEF,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "Checksum mismatch: expected 0xdeadbeef, got 0x00000001"
        );
    }

    #[test]
    fn test_registry_error_names_pattern() {
        let err = RegistryError::DuplicatePattern(MessagePattern::from("sum"));
        assert!(err.to_string().contains("'sum'"));
    }

    #[test]
    fn test_hook_error_wraps_into_server_error() {
        let err: ServerError = HookError::failed("Cache", "boom").into();
        assert!(matches!(err, ServerError::Hook(HookError::Failed { .. })));
        assert_eq!(err.to_string(), "Hook on 'Cache' failed: boom");
    }
}
