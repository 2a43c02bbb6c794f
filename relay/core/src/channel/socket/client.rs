//! Socket Client Channel
//!
//! A supervisor task owns the connection. It connects, runs the connection
//! loop, and on loss waits `retry` milliseconds before reconnecting until
//! `max_retries` consecutive failures or `stop_retrying` end it. The
//! outbound queue outlives individual connections, so the receiver is
//! handed back when the supervisor exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{connect, outbound_queue, pump, PumpEnd};
use crate::channel::frame::FrameCodec;
use crate::channel::{events, ClientChannel, EventEmitter, EventPacket, Payload};
use crate::config::IpcOptions;
use crate::error::TransportError;

/// Client side of the socket channel
pub struct SocketClient {
    options: Arc<IpcOptions>,
    codec: FrameCodec,
    events: EventEmitter,
    outbound_tx: mpsc::Sender<EventPacket>,
    outbound_rx: Arc<Mutex<Option<mpsc::Receiver<EventPacket>>>>,
    connected: Arc<AtomicBool>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SocketClient {
    /// Create a client for the endpoint described by `options`
    #[must_use]
    pub fn new(options: Arc<IpcOptions>) -> Self {
        let (outbound_tx, outbound_rx) = outbound_queue();
        Self {
            codec: FrameCodec::from_options(&options),
            options,
            events: EventEmitter::new(),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(Some(outbound_rx))),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }
}

/// State moved into the supervisor task
struct Supervisor {
    options: Arc<IpcOptions>,
    codec: FrameCodec,
    events: EventEmitter,
    connected: Arc<AtomicBool>,
    outbound_slot: Arc<Mutex<Option<mpsc::Receiver<EventPacket>>>>,
}

impl Supervisor {
    async fn run(
        self,
        mut outbound: mpsc::Receiver<EventPacket>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let endpoint = self.options.endpoint();
        let silent = self.options.silent;
        let mut failures: u32 = 0;

        loop {
            let attempt = tokio::select! {
                attempt = connect(&endpoint, &self.options.interfaces) => attempt,
                _ = shutdown.changed() => break,
            };

            match attempt {
                Ok(stream) => {
                    failures = 0;
                    self.connected.store(true, Ordering::SeqCst);
                    if !silent {
                        tracing::debug!(endpoint = %endpoint, "Connected");
                    }
                    self.events.emit(events::CONNECT, Payload::Null, None);

                    let emitter = self.events.clone();
                    let codec = self.codec.clone();
                    let end = pump(stream, codec, &mut outbound, &mut shutdown, |packet| {
                        match packet {
                            Ok(packet) => {
                                emitter.emit(&packet.event, packet.data, None);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Frame error");
                                emitter.emit(events::ERROR, Payload::String(e.to_string()), None);
                            }
                        }
                    })
                    .await;

                    self.connected.store(false, Ordering::SeqCst);
                    if !silent {
                        tracing::debug!(endpoint = %endpoint, reason = ?end, "Disconnected");
                    }
                    self.events.emit(events::DISCONNECT, Payload::Null, None);

                    if end != PumpEnd::RemoteClosed {
                        break;
                    }
                }
                Err(e) => {
                    if !silent {
                        tracing::debug!(endpoint = %endpoint, error = %e, "Connect attempt failed");
                    }
                    self.events.emit(events::ERROR, Payload::String(e.to_string()), None);
                }
            }

            if self.options.stop_retrying {
                break;
            }
            if let Some(max) = self.options.max_retries {
                if failures >= max {
                    tracing::warn!(endpoint = %endpoint, max_retries = max, "Giving up reconnecting");
                    break;
                }
            }
            failures += 1;

            tokio::select! {
                () = tokio::time::sleep(self.options.retry_interval()) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        *self.outbound_slot.lock() = Some(outbound);
        self.events.emit(events::DESTROY, Payload::Null, None);
    }
}

#[async_trait]
impl ClientChannel for SocketClient {
    fn events(&self) -> &EventEmitter {
        &self.events
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self
            .supervisor
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return Ok(());
        }

        let previous = self.supervisor.lock().take();
        if let Some(handle) = previous {
            let _ = handle.await;
        }

        let outbound = self.outbound_rx.lock().take().ok_or_else(|| {
            TransportError::InvalidState("Connection supervisor already running".to_string())
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor {
            options: Arc::clone(&self.options),
            codec: self.codec.clone(),
            events: self.events.clone(),
            connected: Arc::clone(&self.connected),
            outbound_slot: Arc::clone(&self.outbound_rx),
        };
        let handle = tokio::spawn(supervisor.run(outbound, shutdown_rx));

        *self.shutdown.lock() = Some(shutdown);
        *self.supervisor.lock() = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let shutdown = self.shutdown.lock().take();
        if shutdown.is_some() {
            drop(shutdown);
            let handle = self.supervisor.lock().take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
        Ok(())
    }

    async fn emit(&self, event: &str, data: Payload) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidState("Not connected".to_string()));
        }
        self.outbound_tx
            .send(EventPacket::new(event, data))
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
