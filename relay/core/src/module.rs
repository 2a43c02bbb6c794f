//! IPC Module
//!
//! Composition root: one immutable [`IpcOptions`] value, a handler table
//! and an instance registry, wired into a [`TransportServer`] and any
//! number of [`IpcService`] clients.
//!
//! ```
//! # use std::sync::Arc;
//! # use relay_core::{Component, IpcModule, IpcOptions, Registration};
//! # use serde_json::json;
//! # struct Cache;
//! # impl Component for Cache {}
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let dir = tempfile::tempdir()?;
//! let mut module = IpcModule::new(IpcOptions::unix("worker", dir.path()))?;
//! module.subscribe("ping", |_| async { Ok(json!("pong")) })?;
//! module
//!     .instances()
//!     .register(Registration::provider("Cache", Arc::new(Cache)))?;
//!
//! let server = module.server()?;
//! server.listen(|| tracing::info!("ready")).await?;
//! server.close().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use crate::channel::{create_client_channel, create_server_channel, MessagePattern, Payload};
use crate::client::IpcService;
use crate::config::{ClientOptions, IpcOptions, ServerOptions};
use crate::error::{ConfigError, HandlerError, RegistryError};
use crate::instances::InstanceRegistry;
use crate::registry::{HandlerRegistry, MessageHandler};
use crate::server::TransportServer;

/// Options, handlers and instances for one IPC endpoint
#[derive(Debug)]
pub struct IpcModule {
    options: Arc<IpcOptions>,
    server_options: ServerOptions,
    client_options: ClientOptions,
    handlers: HandlerRegistry,
    instances: InstanceRegistry,
}

impl IpcModule {
    /// Create a module for validated options
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the options are invalid.
    pub fn new(options: IpcOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        tracing::debug!(id = %options.id, endpoint = %options.endpoint(), "IPC module configured");
        Ok(Self {
            options: Arc::new(options),
            server_options: ServerOptions::default(),
            client_options: ClientOptions::default(),
            handlers: HandlerRegistry::new(),
            instances: InstanceRegistry::new(),
        })
    }

    /// Override server knobs
    #[must_use]
    pub fn with_server_options(mut self, options: ServerOptions) -> Self {
        self.server_options = options;
        self
    }

    /// Override client knobs
    #[must_use]
    pub fn with_client_options(mut self, options: ClientOptions) -> Self {
        self.client_options = options;
        self
    }

    /// The shared channel options
    #[must_use]
    pub fn options(&self) -> &IpcOptions {
        &self.options
    }

    /// Bind an async closure to a pattern
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicatePattern` if the pattern is taken.
    pub fn subscribe<F, Fut>(
        &mut self,
        pattern: impl Into<MessagePattern>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
    {
        self.handlers.subscribe(pattern, f)
    }

    /// Bind a handler object to a pattern
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicatePattern` if the pattern is taken.
    pub fn register_handler(
        &mut self,
        pattern: impl Into<MessagePattern>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), RegistryError> {
        self.handlers.register(pattern, handler)
    }

    /// Mutable access to the handler table
    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    /// The live instance registry; clones share it
    #[must_use]
    pub fn instances(&self) -> &InstanceRegistry {
        &self.instances
    }

    /// Build the server over a socket channel
    ///
    /// Handlers registered after this call are not seen by the server.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the channel cannot be built.
    pub fn server(&self) -> Result<TransportServer, ConfigError> {
        let channel = create_server_channel(&self.options)?;
        Ok(TransportServer::new(
            channel,
            self.handlers.clone(),
            self.instances.clone(),
            self.server_options.clone(),
        ))
    }

    /// Build a client service over a socket channel
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the channel cannot be built.
    pub fn service(&self) -> Result<IpcService, ConfigError> {
        let channel = create_client_channel(&self.options)?;
        Ok(IpcService::new(channel, self.client_options.clone()))
    }
}
