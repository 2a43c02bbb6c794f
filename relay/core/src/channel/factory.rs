//! Channel Factory
//!
//! Builds socket channels from [`IpcOptions`]. In-process channels need a
//! shared hub and are created directly with
//! [`InProcessServer::new`](super::in_process::InProcessServer::new).

use std::sync::Arc;

use super::socket::{SocketClient, SocketServer};
use super::{ClientChannel, ServerChannel};
use crate::config::IpcOptions;
use crate::error::ConfigError;

/// Create the server side of a channel for `options`
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` if the options are invalid.
///
/// # Example
///
/// ```
/// # use relay_core::channel::create_server_channel;
/// # use relay_core::IpcOptions;
/// let options = IpcOptions::unix("worker", "/run/relay");
/// let channel = create_server_channel(&options)?;
/// assert!(channel.peers().is_empty());
/// # Ok::<(), relay_core::ConfigError>(())
/// ```
pub fn create_server_channel(options: &IpcOptions) -> Result<Arc<dyn ServerChannel>, ConfigError> {
    options.validate()?;
    Ok(Arc::new(SocketServer::new(Arc::new(options.clone()))))
}

/// Create the client side of a channel for `options`
///
/// The channel is not connected.
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` if the options are invalid.
pub fn create_client_channel(options: &IpcOptions) -> Result<Arc<dyn ClientChannel>, ConfigError> {
    options.validate()?;
    Ok(Arc::new(SocketClient::new(Arc::new(options.clone()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_client_channel_not_connected() {
        let options = IpcOptions::unix("factory", "/tmp/relay-factory-test");
        let channel = create_client_channel(&options).unwrap();
        assert!(!channel.is_connected());
    }

    #[test]
    fn test_create_server_channel_has_no_peers() {
        let options = IpcOptions::tcp("factory", "127.0.0.1", 0);
        let channel = create_server_channel(&options).unwrap();
        assert!(channel.peers().is_empty());
    }

    #[test]
    fn test_invalid_options_rejected() {
        let options = IpcOptions::new("");
        assert!(matches!(
            create_server_channel(&options),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(create_client_channel(&options).is_err());
    }
}
