//! Message Handler Registry
//!
//! Maps each [`MessagePattern`] to exactly one [`MessageHandler`]. The
//! server binds one channel listener per entry when it starts listening,
//! in registration order.
//!
//! ```
//! use relay_core::{HandlerError, HandlerRegistry, Payload};
//! use serde_json::json;
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.subscribe("sum", |data: Payload| async move {
//!     let numbers: Vec<i64> = serde_json::from_value(data)?;
//!     Ok::<_, HandlerError>(json!(numbers.iter().sum::<i64>()))
//! })?;
//!
//! assert!(handlers.contains("sum"));
//! assert!(handlers.subscribe("sum", |d| async move { Ok(d) }).is_err());
//! # Ok::<(), relay_core::RegistryError>(())
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::channel::{MessagePattern, Payload};
use crate::error::{HandlerError, RegistryError};

/// Handles one message pattern
///
/// The return value is sent back to the peer that sent the message. An
/// error is reported on the server's error event; nothing is sent back.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Produce a response for one inbound payload
    async fn handle(&self, data: Payload) -> Result<Payload, HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
{
    async fn handle(&self, data: Payload) -> Result<Payload, HandlerError> {
        (self.f)(data).await
    }
}

/// Adapter deserializing the request and serializing the response
pub struct TypedHandler<F, Req, Resp> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<F, Fut, Req, Resp> MessageHandler for TypedHandler<F, Req, Resp>
where
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn handle(&self, data: Payload) -> Result<Payload, HandlerError> {
        let request: Req = serde_json::from_value(data)
            .map_err(|e| HandlerError::new(format!("Invalid request payload: {e}")))?;
        let response = (self.f)(request).await?;
        serde_json::to_value(response)
            .map_err(|e| HandlerError::new(format!("Unserializable response: {e}")))
    }
}

/// Ordered pattern → handler table
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: Vec<(MessagePattern, Arc<dyn MessageHandler>)>,
}

impl HandlerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to a pattern
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicatePattern` if the pattern is taken.
    pub fn register(
        &mut self,
        pattern: impl Into<MessagePattern>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), RegistryError> {
        let pattern = pattern.into();
        if self.contains(pattern.as_str()) {
            return Err(RegistryError::DuplicatePattern(pattern));
        }
        tracing::trace!(pattern = %pattern, "Handler registered");
        self.entries.push((pattern, handler));
        Ok(())
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
        self.register(pattern, Arc::new(FnHandler { f }))
    }

    /// Bind a typed async closure to a pattern
    ///
    /// A payload that does not deserialize into `Req` fails the handler.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicatePattern` if the pattern is taken.
    pub fn subscribe_typed<F, Fut, Req, Resp>(
        &mut self,
        pattern: impl Into<MessagePattern>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.register(
            pattern,
            Arc::new(TypedHandler {
                f,
                _types: PhantomData,
            }),
        )
    }

    /// Look up the handler for a pattern
    #[must_use]
    pub fn get(&self, pattern: &str) -> Option<Arc<dyn MessageHandler>> {
        self.entries
            .iter()
            .find(|(p, _)| p.as_str() == pattern)
            .map(|(_, h)| Arc::clone(h))
    }

    /// Check whether a pattern is bound
    #[must_use]
    pub fn contains(&self, pattern: &str) -> bool {
        self.entries.iter().any(|(p, _)| p.as_str() == pattern)
    }

    /// Patterns in registration order
    #[must_use]
    pub fn patterns(&self) -> Vec<MessagePattern> {
        self.entries.iter().map(|(p, _)| p.clone()).collect()
    }

    /// Iterate entries in registration order
    pub fn iter(&self) -> impl Iterator<Item = (&MessagePattern, &Arc<dyn MessageHandler>)> {
        self.entries.iter().map(|(p, h)| (p, h))
    }

    /// Number of bound patterns
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is bound
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("patterns", &self.patterns())
            .finish()
    }
}
