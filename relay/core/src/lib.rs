//! Relay Core - Pattern-Addressed Messaging over Local IPC
//!
//! This crate adapts a named-event IPC channel into a request/response and
//! event transport. Servers bind async handlers to message patterns; clients
//! publish to a pattern and receive the handler's reply through a callback.
//!
//! # Architecture
//!
//! ```text
//!   client process                              server process
//! ┌──────────────────────┐                 ┌──────────────────────────────┐
//! │  TransportClient     │                 │  TransportServer             │
//! │   publish(pattern) ──┼── <pattern> ───▶│   HandlerRegistry lookup     │
//! │   callback(Reply) ◀──┼── response ─────┼── handler(payload)           │
//! │                      │   / error       │                              │
//! │  ClientChannel       │                 │  ServerChannel               │
//! │  (socket/in-process) │                 │  InstanceSelector            │
//! └──────────────────────┘                 │  LifecycleHookDispatcher     │
//!                                          └──────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`TransportServer`]: serves registered patterns, runs lifecycle hooks
//! - [`TransportClient`] / [`IpcService`]: publishes requests and events
//! - [`HandlerRegistry`]: pattern to handler table
//! - [`InstanceRegistry`] and [`InstanceSelector`]: the live component set
//! - [`LifecycleHookDispatcher`]: `on_ipc_init` / `on_ipc_disconnect` runner
//! - [`IpcModule`]: wires the above from one [`IpcOptions`] value
//!
//! # Module Overview
//!
//! - [`channel`]: named-event channels (in-process, Unix socket, TCP)
//! - [`config`]: channel options, TOML and environment loading
//! - [`error`]: error enums per concern
//! - [`hooks`]: lifecycle hook traits and dispatcher
//! - [`instances`]: component registry and static instance selection
//! - [`registry`]: message handler table
//! - [`server`] / [`client`]: the two façades
//! - [`module`]: composition root

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod hooks;
pub mod instances;
pub mod module;
pub mod registry;
pub mod server;

// Channel exports
pub use channel::in_process::{InProcessClient, InProcessServer};
pub use channel::socket::{SocketClient, SocketServer};
pub use channel::{
    events, ChannelEvent, ClientChannel, CorrelatedPayload, EventEmitter, EventPacket,
    ListenerId, MessagePattern, Payload, PeerHandle, PeerId, ServerChannel,
};

// Façade exports
pub use client::{IpcService, PendingRequest, Reply, TransportClient};
pub use module::IpcModule;
pub use server::TransportServer;

// Registry and lifecycle exports
pub use hooks::{HookResult, LifecycleHookDispatcher, OnIpcDisconnect, OnIpcInit};
pub use instances::{
    Component, InstanceKind, InstanceRef, InstanceRegistry, InstanceSelector, InstanceSet,
    Registration, Scope,
};
pub use registry::{HandlerRegistry, MessageHandler};

// Config exports
pub use config::{
    default_config_path, load_options, load_options_from_path, ClientOptions, ConfigSource,
    CorrelationMode, Encoding, Endpoint, InterfaceOptions, IpcOptions, LoadedOptions,
    OptionsToml, ResponseEvent, ServerOptions,
};

// Error exports
pub use error::{
    ClientError, ConfigError, HandlerError, HookError, RegistryError, ServerError, TransportError,
};
