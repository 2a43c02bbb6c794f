//! Socket Server Channel
//!
//! Accepts any number of peers up to `max_connections`. Each peer gets its
//! own connection task and outbound queue; the peer table is a `DashMap`
//! so `emit_to` never waits on the accept loop.

use std::fs::Permissions;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{outbound_queue, pump, Listener, PumpEnd};
use crate::channel::frame::FrameCodec;
use crate::channel::{
    events, EventEmitter, EventPacket, Payload, PeerHandle, PeerId, ServerChannel,
};
use crate::config::{Endpoint, IpcOptions};
use crate::error::TransportError;

struct PeerSlot {
    handle: PeerHandle,
    tx: mpsc::Sender<EventPacket>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    local_addr: Option<SocketAddr>,
}

/// Server side of the socket channel
pub struct SocketServer {
    options: Arc<IpcOptions>,
    codec: FrameCodec,
    events: EventEmitter,
    peers: Arc<DashMap<PeerId, PeerSlot>>,
    running: Mutex<Option<Running>>,
}

impl SocketServer {
    /// Create a server for the endpoint described by `options`
    #[must_use]
    pub fn new(options: Arc<IpcOptions>) -> Self {
        Self {
            codec: FrameCodec::from_options(&options),
            options,
            events: EventEmitter::new(),
            peers: Arc::new(DashMap::new()),
            running: Mutex::new(None),
        }
    }

    /// Endpoint this server binds
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.options.endpoint()
    }

    /// Bound TCP address while running (useful with port 0)
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().and_then(|r| r.local_addr)
    }

    fn sender_for(&self, peer: &PeerHandle) -> Result<mpsc::Sender<EventPacket>, TransportError> {
        self.peers
            .get(&peer.id())
            .map(|slot| slot.tx.clone())
            .ok_or_else(|| TransportError::SendFailed(format!("Unknown peer: {peer}")))
    }

    fn spawn_accept_loop(&self, listener: Listener, shutdown: watch::Receiver<bool>) {
        let emitter = self.events.clone();
        let peers = Arc::clone(&self.peers);
        let codec = self.codec.clone();
        let max_connections = self.options.max_connections;
        let silent = self.options.silent;
        let mut accept_shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = accept_shutdown.changed() => break,
                };

                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept error");
                        emitter.emit(events::ERROR, Payload::String(e.to_string()), None);
                        continue;
                    }
                };

                if peers.len() >= max_connections {
                    tracing::warn!(
                        max_connections,
                        remote = remote.as_deref().unwrap_or("unix"),
                        "Connection limit reached, rejecting peer"
                    );
                    drop(stream);
                    continue;
                }

                let peer = PeerHandle::new(remote);
                let (tx, mut rx) = outbound_queue();
                peers.insert(
                    peer.id(),
                    PeerSlot {
                        handle: peer.clone(),
                        tx,
                    },
                );
                if !silent {
                    tracing::debug!(peer = %peer, "Peer connected");
                }

                let emitter = emitter.clone();
                let peers = Arc::clone(&peers);
                let codec = codec.clone();
                let mut conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let inbound_peer = peer.clone();
                    let inbound_emitter = emitter.clone();
                    let end = pump(stream, codec, &mut rx, &mut conn_shutdown, |packet| {
                        match packet {
                            Ok(packet) => {
                                inbound_emitter.emit(
                                    &packet.event,
                                    packet.data,
                                    Some(inbound_peer.clone()),
                                );
                            }
                            Err(e) => {
                                tracing::warn!(peer = %inbound_peer, error = %e, "Frame error");
                                inbound_emitter.emit(
                                    events::ERROR,
                                    Payload::String(e.to_string()),
                                    Some(inbound_peer.clone()),
                                );
                            }
                        }
                    })
                    .await;

                    peers.remove(&peer.id());
                    if !silent {
                        tracing::debug!(peer = %peer, reason = ?end, "Peer disconnected");
                    }
                    if end != PumpEnd::Shutdown {
                        emitter.emit(events::SOCKET_DISCONNECTED, Payload::Null, Some(peer));
                    }
                });
            }
        });
    }
}

#[async_trait]
impl ServerChannel for SocketServer {
    fn events(&self) -> &EventEmitter {
        &self.events
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.running.lock().is_some() {
            return Err(TransportError::InvalidState(
                "Server already started".to_string(),
            ));
        }

        let endpoint = self.options.endpoint();
        let listener = Listener::bind(&endpoint, self.options.unlink).await?;

        if let Endpoint::Unix(path) = &endpoint {
            let perms = Permissions::from_mode(self.options.socket_mode());
            tokio::fs::set_permissions(path, perms).await?;
        }

        let local_addr = listener.local_addr();
        let (shutdown, shutdown_rx) = watch::channel(false);
        self.spawn_accept_loop(listener, shutdown_rx);
        *self.running.lock() = Some(Running {
            shutdown,
            local_addr,
        });

        tracing::info!(endpoint = %endpoint, "Listening");
        self.events.emit(events::START, Payload::Null, None);
        Ok(())
    }

    async fn emit_to(
        &self,
        peer: &PeerHandle,
        event: &str,
        data: Payload,
    ) -> Result<(), TransportError> {
        self.sender_for(peer)?
            .send(EventPacket::new(event, data))
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
    }

    async fn broadcast(&self, event: &str, data: Payload) -> Result<(), TransportError> {
        let targets: Vec<(PeerHandle, mpsc::Sender<EventPacket>)> = self
            .peers
            .iter()
            .map(|slot| (slot.handle.clone(), slot.tx.clone()))
            .collect();

        // A full queue on one peer must not hold up the others
        let sends = targets.into_iter().map(|(peer, tx)| {
            let packet = EventPacket::new(event, data.clone());
            async move {
                if let Err(e) = tx.send(packet).await {
                    tracing::warn!(peer = %peer, error = %e, "Broadcast send failed");
                }
            }
        });
        join_all(sends).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        // Connection tasks see the signal, flush, and drop their own peer
        // slots; a local stop never reports `socket.disconnected`
        let _ = running.shutdown.send(true);
        drop(running.shutdown);

        if let Endpoint::Unix(path) = self.options.endpoint() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = %path.display(), error = %e, "Socket file not removed");
            }
        }

        tracing::info!("Stopped listening");
        Ok(())
    }

    fn peers(&self) -> Vec<PeerHandle> {
        self.peers.iter().map(|slot| slot.handle.clone()).collect()
    }
}
