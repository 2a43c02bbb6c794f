//! Message Channel Layer
//!
//! A message channel is a bidirectional, named-event connection. Peers
//! `emit(event, data)` and interested code subscribes with `on(event, ..)`.
//! The adapter in [`server`](crate::server) and [`client`](crate::client)
//! only ever talks to the two traits defined here:
//!
//! - [`ServerChannel`]: accepts peers, emits to one peer or to all of them
//! - [`ClientChannel`]: connects to a server and emits to it
//!
//! Two implementations ship with the crate:
//!
//! - [`in_process`]: tokio channels, for embedded mode and tests
//! - [`socket`]: Unix domain sockets or TCP, framed by [`frame`]
//!
//! # Events
//!
//! ```text
//!  server side                         client side
//!  ───────────                         ───────────
//!  start                               connect
//!  socket.disconnected (peer)          disconnect
//!  error                               destroy
//!  <pattern> (payload, peer)           error
//!                                      <pattern> (payload)
//!                                      data (raw mode)
//! ```

pub mod emitter;
pub mod factory;
pub mod frame;
pub mod in_process;
pub mod socket;

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

pub use emitter::{ChannelEvent, EventEmitter, ListenerId};
pub use factory::{create_client_channel, create_server_channel};

/// Payload carried by every event
pub type Payload = serde_json::Value;

/// Well-known event names
pub mod events {
    /// Server began accepting peers
    pub const START: &str = "start";
    /// Client established its connection
    pub const CONNECT: &str = "connect";
    /// Client lost its connection
    pub const DISCONNECT: &str = "disconnect";
    /// Client gave up reconnecting; no further events follow
    pub const DESTROY: &str = "destroy";
    /// Server observed a peer going away
    pub const SOCKET_DISCONNECTED: &str = "socket.disconnected";
    /// Channel-level or handler failure
    pub const ERROR: &str = "error";
    /// Raw bytes received (raw buffer mode only)
    pub const DATA: &str = "data";
    /// Generic response tag used by the server
    pub const MESSAGE: &str = "message";
}

/// Key identifying a logical operation
///
/// Used both as the event name on the channel and as the correlation key
/// for responses.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessagePattern(String);

impl MessagePattern {
    /// Create a pattern from any string
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// The pattern as an event name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessagePattern {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessagePattern {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for MessagePattern {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessagePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a connected peer, stable for the lifetime of its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Allocate a new unique peer ID
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Handle to one connected peer, used as the target of server emits
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    id: PeerId,
    remote_address: Option<String>,
}

impl PeerHandle {
    /// Create a handle for a freshly accepted peer
    #[must_use]
    pub fn new(remote_address: Option<String>) -> Self {
        Self {
            id: PeerId::new(),
            remote_address,
        }
    }

    /// The peer's ID
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Remote address, when the underlying socket has one
    #[must_use]
    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.remote_address {
            Some(addr) => write!(f, "{} ({addr})", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Wire envelope for one event
///
/// Field names follow the `{ type, data }` shape used by event-style IPC
/// peers, so non-Rust processes can speak the same protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPacket {
    /// Event name (a message pattern or a well-known event)
    #[serde(rename = "type")]
    pub event: String,
    /// Event payload
    #[serde(default)]
    pub data: Payload,
}

impl EventPacket {
    /// Create a packet
    pub fn new(event: impl Into<String>, data: Payload) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Request payload wrapped with a correlation ID
///
/// Only used when both sides opt into request-ID correlation. The server
/// echoes `id` back so the client can match concurrent requests on the
/// same pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedPayload {
    /// Monotonic request identifier, unique per client
    #[serde(rename = "$rid")]
    pub id: u64,
    /// The actual request or response body
    #[serde(default)]
    pub data: Payload,
}

impl CorrelatedPayload {
    /// Interpret a payload as a correlated envelope, if it is one
    #[must_use]
    pub fn parse(payload: &Payload) -> Option<Self> {
        if payload.get("$rid").is_none() {
            return None;
        }
        serde_json::from_value(payload.clone()).ok()
    }

    /// Convert into a JSON payload
    #[must_use]
    pub fn into_payload(self) -> Payload {
        serde_json::json!({ "$rid": self.id, "data": self.data })
    }
}

/// Server side of a message channel
///
/// Implementations accept any number of peers. Inbound events are
/// delivered through [`events`](Self::events) with the originating peer
/// attached.
#[async_trait]
pub trait ServerChannel: Send + Sync {
    /// Listener table for inbound and lifecycle events
    fn events(&self) -> &EventEmitter;

    /// Start accepting peers
    ///
    /// Emits [`events::START`] once the channel is accepting.
    async fn start(&self) -> Result<(), TransportError>;

    /// Send an event to a single peer
    async fn emit_to(
        &self,
        peer: &PeerHandle,
        event: &str,
        data: Payload,
    ) -> Result<(), TransportError>;

    /// Send an event to every connected peer
    async fn broadcast(&self, event: &str, data: Payload) -> Result<(), TransportError>;

    /// Stop accepting and drop every peer
    async fn stop(&self) -> Result<(), TransportError>;

    /// Currently connected peers
    fn peers(&self) -> Vec<PeerHandle>;
}

/// Client side of a message channel
#[async_trait]
pub trait ClientChannel: Send + Sync {
    /// Listener table for inbound and lifecycle events
    fn events(&self) -> &EventEmitter;

    /// Begin connecting
    ///
    /// Returns once the attempt has been initiated. The outcome is
    /// reported later through [`events::CONNECT`] or [`events::ERROR`].
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection and stop reconnecting. Idempotent.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Send an event to the server
    async fn emit(&self, event: &str, data: Payload) -> Result<(), TransportError>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;
}
