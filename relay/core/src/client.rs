//! Transport Client
//!
//! Fire-and-forget events and request/response calls over a
//! [`ClientChannel`].
//!
//! # Correlation
//!
//! [`TransportClient::publish`] attaches a success listener on the request
//! pattern and an error listener on the channel's `error` event. The first
//! of the two to fire settles the request and detaches both.
//!
//! In [`CorrelationMode::SingleFlight`] (the default) responses are matched
//! by pattern only: two outstanding requests on one pattern both settle on
//! the first response that arrives. [`CorrelationMode::RequestId`] wraps
//! each request in a [`CorrelatedPayload`] and only accepts the response
//! carrying the same ID. Errors are never correlated; any `error` event
//! settles every outstanding request.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::channel::{
    create_client_channel, events, ClientChannel, CorrelatedPayload, EventEmitter, ListenerId,
    MessagePattern, Payload,
};
use crate::config::{ClientOptions, CorrelationMode, IpcOptions};
use crate::error::{ClientError, ConfigError};

/// Outcome delivered to a `publish` callback
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The peer answered on the request pattern
    Response(Payload),
    /// The channel emitted `error` first
    Error(Payload),
}

impl Reply {
    /// The response payload, if this is a success
    #[must_use]
    pub fn response(&self) -> Option<&Payload> {
        match self {
            Self::Response(data) => Some(data),
            Self::Error(_) => None,
        }
    }

    /// The error payload, if this is a failure
    #[must_use]
    pub fn error(&self) -> Option<&Payload> {
        match self {
            Self::Response(_) => None,
            Self::Error(err) => Some(err),
        }
    }

    /// Convert into a `Result`
    ///
    /// # Errors
    ///
    /// Returns the error payload for `Reply::Error`.
    pub fn into_result(self) -> Result<Payload, Payload> {
        match self {
            Self::Response(data) => Ok(data),
            Self::Error(err) => Err(err),
        }
    }
}

type Callback = Box<dyn FnOnce(Reply) + Send>;

/// State shared by a request's two listeners and its handle
struct Slot {
    pattern: MessagePattern,
    events: EventEmitter,
    callback: Mutex<Option<Callback>>,
    listeners: Mutex<Option<(ListenerId, ListenerId)>>,
}

impl Slot {
    fn detach(&self) {
        let listeners = self.listeners.lock().take();
        if let Some((on_response, on_error)) = listeners {
            self.events.off(self.pattern.as_str(), on_response);
            self.events.off(events::ERROR, on_error);
        }
    }

    fn settle(&self, reply: Reply) {
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            self.detach();
            callback(reply);
        }
    }

    fn is_settled(&self) -> bool {
        self.callback.lock().is_none()
    }
}

/// Handle to one outstanding `publish` call
///
/// Dropping the handle does not cancel the request.
pub struct PendingRequest {
    slot: Arc<Slot>,
    request_id: Option<u64>,
}

impl PendingRequest {
    /// Pattern of the request
    #[must_use]
    pub fn pattern(&self) -> &MessagePattern {
        &self.slot.pattern
    }

    /// Correlation ID, in request-ID mode
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        self.request_id
    }

    /// Whether the callback has run or the request was cancelled
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.slot.is_settled()
    }

    /// Abandon the request and detach both listeners. Idempotent.
    ///
    /// The callback is never invoked after this returns.
    pub fn cancel(&self) {
        let dropped = self.slot.callback.lock().take();
        self.slot.detach();
        if dropped.is_some() {
            tracing::debug!(pattern = %self.slot.pattern, "Request cancelled");
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("pattern", &self.slot.pattern)
            .field("request_id", &self.request_id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Client-side adapter over a [`ClientChannel`]
pub struct TransportClient {
    channel: Arc<dyn ClientChannel>,
    options: ClientOptions,
    next_request_id: AtomicU64,
    log_listeners: Mutex<Option<(ListenerId, ListenerId)>>,
}

/// The client bound to the module options
pub type IpcService = TransportClient;

impl TransportClient {
    /// Create a client over an existing channel
    pub fn new(channel: Arc<dyn ClientChannel>, options: ClientOptions) -> Self {
        Self {
            channel,
            options,
            next_request_id: AtomicU64::new(1),
            log_listeners: Mutex::new(None),
        }
    }

    /// Create a client over a socket channel built from `options`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the options are invalid.
    pub fn from_options(options: &IpcOptions, client: ClientOptions) -> Result<Self, ConfigError> {
        Ok(Self::new(create_client_channel(options)?, client))
    }

    /// The underlying channel
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn ClientChannel> {
        &self.channel
    }

    /// Client options
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Whether the channel is currently connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Begin connecting
    ///
    /// Returns once the attempt is initiated; connection loss and
    /// reconnects are logged from the channel's own events.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Transport` if the attempt cannot be started.
    pub async fn connect(&self) -> Result<(), ClientError> {
        {
            let mut log_listeners = self.log_listeners.lock();
            if log_listeners.is_none() {
                let emitter = self.channel.events();
                let on_connect = emitter.on(events::CONNECT, |_| {
                    tracing::info!("Connected to server");
                });
                let on_disconnect = emitter.on(events::DISCONNECT, |_| {
                    tracing::info!("Disconnected from server");
                });
                *log_listeners = Some((on_connect, on_disconnect));
            }
        }
        self.channel.connect().await?;
        Ok(())
    }

    /// Disconnect. Idempotent; outstanding requests are not failed.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Transport` if the channel fails to disconnect.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.channel.disconnect().await?;
        let log_listeners = self.log_listeners.lock().take();
        if let Some((on_connect, on_disconnect)) = log_listeners {
            self.channel.events().off(events::CONNECT, on_connect);
            self.channel.events().off(events::DISCONNECT, on_disconnect);
        }
        Ok(())
    }

    /// Emit an event without waiting for any answer
    ///
    /// Delivery failures are logged, never returned.
    pub async fn dispatch_event(&self, pattern: impl Into<MessagePattern>, data: Payload) {
        let pattern = pattern.into();
        if let Err(e) = self.channel.emit(pattern.as_str(), data).await {
            tracing::warn!(pattern = %pattern, error = %e, "Event not delivered");
        }
    }

    /// Send a request and deliver the outcome to `on_result`
    ///
    /// Both listeners are attached before the request is emitted, so a
    /// fast reply cannot be missed. `on_result` runs at most once. If the
    /// channel rejects the request, `on_result` receives
    /// [`Reply::Error`] with the failure message.
    ///
    /// There is no timeout; use [`PendingRequest::cancel`] or
    /// [`request`](Self::request) to bound the wait.
    pub async fn publish<F>(
        &self,
        pattern: impl Into<MessagePattern>,
        data: Payload,
        on_result: F,
    ) -> PendingRequest
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        let pattern = pattern.into();
        let emitter = self.channel.events().clone();
        let slot = Arc::new(Slot {
            pattern: pattern.clone(),
            events: emitter.clone(),
            callback: Mutex::new(Some(Box::new(on_result))),
            listeners: Mutex::new(None),
        });

        let request_id = match self.options.correlation {
            CorrelationMode::RequestId => {
                Some(self.next_request_id.fetch_add(1, Ordering::Relaxed))
            }
            CorrelationMode::SingleFlight => None,
        };

        let response_slot = Arc::clone(&slot);
        let on_response = emitter.on(pattern.as_str(), move |event| {
            let data = match request_id {
                Some(id) => match CorrelatedPayload::parse(&event.data) {
                    Some(envelope) if envelope.id == id => envelope.data,
                    _ => return,
                },
                None => event.data,
            };
            response_slot.settle(Reply::Response(data));
        });

        let error_slot = Arc::clone(&slot);
        let on_error = emitter.on(events::ERROR, move |event| {
            error_slot.settle(Reply::Error(event.data));
        });

        *slot.listeners.lock() = Some((on_response, on_error));
        if slot.is_settled() {
            slot.detach();
        }

        let payload = match request_id {
            Some(id) => CorrelatedPayload { id, data }.into_payload(),
            None => data,
        };

        tracing::debug!(pattern = %pattern, request_id, "Publishing request");
        if let Err(e) = self.channel.emit(pattern.as_str(), payload).await {
            tracing::warn!(pattern = %pattern, error = %e, "Request not delivered");
            slot.settle(Reply::Error(Payload::String(e.to_string())));
        }

        PendingRequest { slot, request_id }
    }

    /// Send a request and await its outcome
    ///
    /// Applies `request_timeout` from [`ClientOptions`], cancelling the
    /// request when it elapses.
    ///
    /// # Errors
    ///
    /// - `ClientError::Remote` when the error branch fires
    /// - `ClientError::Timeout` when the request timeout elapses
    /// - `ClientError::Abandoned` if the request was cancelled elsewhere
    pub async fn request(
        &self,
        pattern: impl Into<MessagePattern>,
        data: Payload,
    ) -> Result<Payload, ClientError> {
        let pattern = pattern.into();
        let (tx, rx) = oneshot::channel();
        let pending = self
            .publish(pattern.clone(), data, move |reply| {
                let _ = tx.send(reply);
            })
            .await;

        let outcome = match self.options.request_timeout {
            Some(timeout) => {
                if let Ok(outcome) = tokio::time::timeout(timeout, rx).await {
                    outcome
                } else {
                    pending.cancel();
                    return Err(ClientError::Timeout { pattern, timeout });
                }
            }
            None => rx.await,
        };

        match outcome {
            Ok(Reply::Response(data)) => Ok(data),
            Ok(Reply::Error(error)) => Err(ClientError::Remote { pattern, error }),
            Err(_) => Err(ClientError::Abandoned(pattern)),
        }
    }
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
