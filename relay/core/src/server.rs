//! Transport Server
//!
//! Binds every [`HandlerRegistry`] entry to the matching inbound channel
//! event, answers the originating peer, and drives lifecycle hooks.
//!
//! # Listen sequence
//!
//! ```text
//! listen(on_ready)
//!   ├─ validate instance registry
//!   ├─ attach listeners: start, one per pattern, socket.disconnected
//!   ├─ channel.start()  ──►  "start"
//!   ├─ InstanceSelector::select()
//!   ├─ on_ipc_init for each instance, sequentially
//!   └─ on_ready()
//! ```
//!
//! Inbound messages are dispatched concurrently: each one runs its
//! handler on its own task, so a slow or failing handler never holds up
//! another pattern. A handler failure is logged and emitted on the
//! channel's `error` event; no response is sent for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;

use crate::channel::{
    events, ChannelEvent, CorrelatedPayload, ListenerId, MessagePattern, Payload, PeerHandle,
    ServerChannel,
};
use crate::config::{CorrelationMode, ResponseEvent, ServerOptions};
use crate::error::ServerError;
use crate::hooks::LifecycleHookDispatcher;
use crate::instances::{InstanceRegistry, InstanceSelector, InstanceSet};
use crate::registry::{HandlerRegistry, MessageHandler};

/// Server-side adapter over a [`ServerChannel`]
pub struct TransportServer {
    channel: Arc<dyn ServerChannel>,
    handlers: HandlerRegistry,
    instances: InstanceRegistry,
    selector: InstanceSelector,
    dispatcher: LifecycleHookDispatcher,
    options: ServerOptions,
    listening: AtomicBool,
    closed: Arc<AtomicBool>,
    listeners: Mutex<Vec<(String, ListenerId)>>,
}

impl TransportServer {
    /// Create a server; nothing is bound until [`listen`](Self::listen)
    pub fn new(
        channel: Arc<dyn ServerChannel>,
        handlers: HandlerRegistry,
        instances: InstanceRegistry,
        options: ServerOptions,
    ) -> Self {
        Self {
            selector: InstanceSelector::new(instances.clone()),
            dispatcher: LifecycleHookDispatcher::new(options.hook_timeout),
            channel,
            handlers,
            instances,
            options,
            listening: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// The underlying channel
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn ServerChannel> {
        &self.channel
    }

    /// The bound handlers
    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Whether `listen` has completed and `close` has not been called
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// Components eligible for lifecycle hooks right now
    #[must_use]
    pub fn get_instances(&self) -> InstanceSet {
        self.selector.select()
    }

    /// Bind handlers, start the channel, run init hooks, then call `on_ready`
    ///
    /// `on_ready` runs only after the last `on_ipc_init` hook has settled.
    /// Without a hook timeout, a hook that never settles keeps this future
    /// pending forever.
    ///
    /// # Errors
    ///
    /// - `ServerError::InvalidState` if already listening
    /// - `ServerError::Registry` if an instance has an unknown dependency
    /// - `ServerError::Transport` if the channel fails to start
    /// - `ServerError::Hook` if an init hook fails or times out
    ///
    /// On error the channel is stopped and `on_ready` is never called.
    pub async fn listen<F>(&self, on_ready: F) -> Result<(), ServerError>
    where
        F: FnOnce() + Send,
    {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ServerError::InvalidState(
                "Server is already listening".to_string(),
            ));
        }

        match self.start_serving().await {
            Ok(hooks) => {
                tracing::info!(
                    patterns = self.handlers.len(),
                    init_hooks = hooks,
                    "Server ready"
                );
                on_ready();
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Server failed to start");
                self.detach_listeners();
                if let Err(stop_err) = self.channel.stop().await {
                    tracing::debug!(error = %stop_err, "Channel stop after failed start");
                }
                self.listening.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn start_serving(&self) -> Result<usize, ServerError> {
        self.instances.validate()?;
        self.closed.store(false, Ordering::SeqCst);

        let (start_tx, start_rx) = oneshot::channel();
        let start_tx = Mutex::new(Some(start_tx));
        self.attach(events::START, move |_| {
            if let Some(tx) = start_tx.lock().take() {
                let _ = tx.send(());
            }
        });

        for (pattern, handler) in self.handlers.iter() {
            let listener = self.dispatch_listener(pattern.clone(), Arc::clone(handler));
            self.attach(pattern.as_str(), listener);
        }

        let disconnect_listener = self.disconnect_listener();
        self.attach(events::SOCKET_DISCONNECTED, disconnect_listener);

        self.channel.start().await?;
        start_rx.await.map_err(|_| {
            ServerError::InvalidState("Channel never signalled start".to_string())
        })?;

        let instances = self.selector.select();
        let hooks = self
            .dispatcher
            .on_init(&instances, self.channel.as_ref())
            .await?;
        Ok(hooks)
    }

    fn attach<F>(&self, event: &str, listener: F)
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        let id = self.channel.events().on(event, listener);
        self.listeners.lock().push((event.to_string(), id));
    }

    fn detach_listeners(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for (event, id) in listeners {
            self.channel.events().off(&event, id);
        }
    }

    fn dispatch_listener(
        &self,
        pattern: MessagePattern,
        handler: Arc<dyn MessageHandler>,
    ) -> impl Fn(ChannelEvent) + Send + Sync + 'static {
        let channel = Arc::clone(&self.channel);
        let closed = Arc::clone(&self.closed);
        let correlation = self.options.correlation;
        let response_event = self.options.response_event;

        move |event: ChannelEvent| {
            if closed.load(Ordering::SeqCst) {
                return;
            }
            let Some(peer) = event.peer else {
                tracing::warn!(pattern = %pattern, "Inbound message without a peer, dropped");
                return;
            };

            let (request_id, data) = match correlation {
                CorrelationMode::RequestId => match CorrelatedPayload::parse(&event.data) {
                    Some(envelope) => (Some(envelope.id), envelope.data),
                    None => (None, event.data),
                },
                CorrelationMode::SingleFlight => (None, event.data),
            };

            tracing::debug!(pattern = %pattern, peer = %peer, request_id, "Dispatching message");

            let channel = Arc::clone(&channel);
            let handler = Arc::clone(&handler);
            let pattern = pattern.clone();
            tokio::spawn(async move {
                match handler.handle(data).await {
                    Ok(result) => {
                        let (name, payload) = match request_id {
                            Some(id) => (
                                pattern.as_str(),
                                CorrelatedPayload { id, data: result }.into_payload(),
                            ),
                            None => match response_event {
                                ResponseEvent::Generic => (events::MESSAGE, result),
                                ResponseEvent::Pattern => (pattern.as_str(), result),
                            },
                        };
                        if let Err(e) = channel.emit_to(&peer, name, payload).await {
                            tracing::warn!(
                                pattern = %pattern,
                                peer = %peer,
                                error = %e,
                                "Failed to send response"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(pattern = %pattern, peer = %peer, error = %e, "Handler failed");
                        channel.events().emit(
                            events::ERROR,
                            json!({ "pattern": pattern, "message": e.message }),
                            Some(peer),
                        );
                    }
                }
            });
        }
    }

    fn disconnect_listener(&self) -> impl Fn(ChannelEvent) + Send + Sync + 'static {
        let channel = Arc::clone(&self.channel);
        let closed = Arc::clone(&self.closed);
        let selector = self.selector.clone();
        let dispatcher = self.dispatcher;

        move |event: ChannelEvent| {
            if closed.load(Ordering::SeqCst) {
                return;
            }
            let Some(peer) = event.peer else {
                return;
            };
            tracing::info!(peer = %peer, "Peer disconnected");

            let instances = selector.select();
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                if let Err(e) = dispatcher.on_disconnect(&instances, &peer).await {
                    tracing::error!(peer = %peer, error = %e, "Disconnect hook failed");
                    channel.events().emit(
                        events::ERROR,
                        Payload::String(e.to_string()),
                        Some(peer),
                    );
                }
            });
        }
    }

    /// Send an event to every connected peer
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Transport` if the channel rejects the send.
    pub async fn broadcast(&self, event: &str, data: Payload) -> Result<(), ServerError> {
        self.channel.broadcast(event, data).await?;
        Ok(())
    }

    /// Send an event to one peer
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Transport` if the peer is gone.
    pub async fn emit_to(
        &self,
        peer: &PeerHandle,
        event: &str,
        data: Payload,
    ) -> Result<(), ServerError> {
        self.channel.emit_to(peer, event, data).await?;
        Ok(())
    }

    /// Stop the channel; nothing is dispatched afterwards
    ///
    /// Handlers already running are not cancelled. Calling `close` more
    /// than once is harmless.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Transport` if the channel fails to stop.
    pub async fn close(&self) -> Result<(), ServerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.detach_listeners();
        self.channel.stop().await?;
        self.listening.store(false, Ordering::SeqCst);
        tracing::info!("Server closed");
        Ok(())
    }
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("handlers", &self.handlers)
            .field("instances", &self.instances)
            .field("options", &self.options)
            .field("listening", &self.is_listening())
            .finish_non_exhaustive()
    }
}
