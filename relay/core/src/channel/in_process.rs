//! In-Process Channel
//!
//! Tokio-channel implementation of the message channel, for embedding the
//! server and its clients in one process and for tests. Packets travel
//! through bounded mpsc queues and are never serialized.
//!
//! # Usage
//!
//! ```
//! # use relay_core::{ClientChannel, InProcessServer, ServerChannel};
//! # use serde_json::json;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), relay_core::TransportError> {
//! let server = InProcessServer::new();
//! let client = server.client();
//!
//! server.start().await?;
//! client.connect().await?;
//! client.emit("sum", json!([1, 2])).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::{
    events, ClientChannel, EventEmitter, EventPacket, Payload, PeerHandle, PeerId, ServerChannel,
};
use crate::error::TransportError;

/// Queue depth per direction per peer
const CHANNEL_CAPACITY: usize = 100;

/// Address reported for in-process peers
const IN_PROCESS_ADDRESS: &str = "in-process";

/// State shared by a server and every client created from it
struct Hub {
    started: AtomicBool,
    events: EventEmitter,
    peers: DashMap<PeerId, PeerSlot>,
}

struct PeerSlot {
    handle: PeerHandle,
    to_client: mpsc::Sender<EventPacket>,
    closed: Arc<Notify>,
}

/// Server side of the in-process channel
#[derive(Clone)]
pub struct InProcessServer {
    hub: Arc<Hub>,
}

impl InProcessServer {
    /// Create a server that is not yet accepting
    #[must_use]
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                started: AtomicBool::new(false),
                events: EventEmitter::new(),
                peers: DashMap::new(),
            }),
        }
    }

    /// Create a client bound to this server
    #[must_use]
    pub fn client(&self) -> InProcessClient {
        InProcessClient {
            hub: Arc::clone(&self.hub),
            events: EventEmitter::new(),
            link: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether `start` has been called without a matching `stop`
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.hub.started.load(Ordering::SeqCst)
    }

    fn sender_for(&self, peer: &PeerHandle) -> Result<mpsc::Sender<EventPacket>, TransportError> {
        self.hub
            .peers
            .get(&peer.id())
            .map(|slot| slot.to_client.clone())
            .ok_or_else(|| TransportError::SendFailed(format!("Unknown peer: {peer}")))
    }
}

impl Default for InProcessServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerChannel for InProcessServer {
    fn events(&self) -> &EventEmitter {
        &self.hub.events
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.hub.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::InvalidState(
                "Server already started".to_string(),
            ));
        }
        self.hub.events.emit(events::START, Payload::Null, None);
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
            .hub
            .peers
            .iter()
            .map(|slot| (slot.handle.clone(), slot.to_client.clone()))
            .collect();

        for (peer, tx) in targets {
            if let Err(e) = tx.send(EventPacket::new(event, data.clone())).await {
                tracing::warn!(peer = %peer, error = %e, "Broadcast send failed");
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.hub.started.store(false, Ordering::SeqCst);
        let ids: Vec<PeerId> = self.hub.peers.iter().map(|slot| *slot.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.hub.peers.remove(&id) {
                slot.closed.notify_one();
            }
        }
        Ok(())
    }

    fn peers(&self) -> Vec<PeerHandle> {
        self.hub
            .peers
            .iter()
            .map(|slot| slot.handle.clone())
            .collect()
    }
}

struct Link {
    to_server: mpsc::Sender<EventPacket>,
    peer: PeerHandle,
}

/// Client side of the in-process channel
///
/// Created with [`InProcessServer::client`]. There is no reconnect: once
/// the server stops, the client reports `disconnect` then `destroy`.
pub struct InProcessClient {
    hub: Arc<Hub>,
    events: EventEmitter,
    link: Arc<Mutex<Option<Link>>>,
    connected: Arc<AtomicBool>,
}

impl InProcessClient {
    /// Peer handle the server sees for this client, while connected
    #[must_use]
    pub fn peer(&self) -> Option<PeerHandle> {
        self.link.lock().as_ref().map(|link| link.peer.clone())
    }
}

#[async_trait]
impl ClientChannel for InProcessClient {
    fn events(&self) -> &EventEmitter {
        &self.events
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.hub.started.load(Ordering::SeqCst) {
            self.events.emit(
                events::ERROR,
                Payload::String("Server is not accepting connections".to_string()),
                None,
            );
            return Ok(());
        }

        let peer = PeerHandle::new(Some(IN_PROCESS_ADDRESS.to_string()));
        let (to_server, mut server_rx) = mpsc::channel::<EventPacket>(CHANNEL_CAPACITY);
        let (to_client, mut client_rx) = mpsc::channel::<EventPacket>(CHANNEL_CAPACITY);
        let closed = Arc::new(Notify::new());

        // client -> server pump
        let hub = Arc::clone(&self.hub);
        let server_peer = peer.clone();
        let server_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    packet = server_rx.recv() => match packet {
                        Some(packet) => {
                            hub.events.emit(&packet.event, packet.data, Some(server_peer.clone()));
                        }
                        None => break,
                    },
                    () = server_closed.notified() => break,
                }
            }
            hub.peers.remove(&server_peer.id());
            hub.events
                .emit(events::SOCKET_DISCONNECTED, Payload::Null, Some(server_peer));
        });

        // server -> client pump
        let client_events = self.events.clone();
        let connected = Arc::clone(&self.connected);
        let link = Arc::clone(&self.link);
        tokio::spawn(async move {
            while let Some(packet) = client_rx.recv().await {
                client_events.emit(&packet.event, packet.data, None);
            }
            if connected.swap(false, Ordering::SeqCst) {
                link.lock().take();
                client_events.emit(events::DISCONNECT, Payload::Null, None);
                client_events.emit(events::DESTROY, Payload::Null, None);
            }
        });

        self.hub.peers.insert(
            peer.id(),
            PeerSlot {
                handle: peer.clone(),
                to_client,
                closed,
            },
        );
        *self.link.lock() = Some(Link { to_server, peer });
        self.connected.store(true, Ordering::SeqCst);
        self.events.emit(events::CONNECT, Payload::Null, None);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let link = self.link.lock().take();
        if link.is_some() && self.connected.swap(false, Ordering::SeqCst) {
            drop(link);
            self.events.emit(events::DISCONNECT, Payload::Null, None);
            self.events.emit(events::DESTROY, Payload::Null, None);
        }
        Ok(())
    }

    async fn emit(&self, event: &str, data: Payload) -> Result<(), TransportError> {
        let tx = self
            .link
            .lock()
            .as_ref()
            .map(|link| link.to_server.clone())
            .ok_or_else(|| TransportError::InvalidState("Not connected".to_string()))?;

        tx.send(EventPacket::new(event, data))
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_in_process_roundtrip() {
        let server = InProcessServer::new();
        let client = server.client();

        let (tx, mut rx) = unbounded_channel();
        server.events().on("sum", move |e| {
            let _ = tx.send(e);
        });

        server.start().await.unwrap();
        client.connect().await.unwrap();
        assert!(client.is_connected());
        client.emit("sum", json!([1, 2])).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.data, json!([1, 2]));
        let peer = received.peer.unwrap();
        assert_eq!(Some(peer.clone()), client.peer());

        let (reply_tx, mut reply_rx) = unbounded_channel();
        client.events().on("sum", move |e| {
            let _ = reply_tx.send(e.data);
        });
        server.emit_to(&peer, "sum", json!(3)).await.unwrap();
        assert_eq!(reply_rx.recv().await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_connect_before_start_reports_error() {
        let server = InProcessServer::new();
        let client = server.client();

        let (tx, mut rx) = unbounded_channel();
        client.events().on(events::ERROR, move |e| {
            let _ = tx.send(e.data);
        });

        client.connect().await.unwrap();
        assert!(!client.is_connected());
        assert!(rx.recv().await.is_some());

        let result = client.emit("sum", Payload::Null).await;
        assert!(matches!(result, Err(TransportError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_client_disconnect_reaches_server() {
        let server = InProcessServer::new();
        let client = server.client();

        let (tx, mut rx) = unbounded_channel();
        server.events().on(events::SOCKET_DISCONNECTED, move |e| {
            let _ = tx.send(e.peer);
        });

        server.start().await.unwrap();
        client.connect().await.unwrap();
        let peer = client.peer().unwrap();
        assert_eq!(server.peers(), vec![peer.clone()]);

        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), Some(peer));
        assert!(server.peers().is_empty());
    }

    #[tokio::test]
    async fn test_server_stop_disconnects_clients() {
        let server = InProcessServer::new();
        let client = server.client();

        let (tx, mut rx) = unbounded_channel();
        client.events().on(events::DESTROY, move |_| {
            let _ = tx.send(());
        });

        server.start().await.unwrap();
        client.connect().await.unwrap();
        server.stop().await.unwrap();

        rx.recv().await.unwrap();
        assert!(!client.is_connected());
        assert!(!server.is_started());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer() {
        let server = InProcessServer::new();
        server.start().await.unwrap();

        let (tx, mut rx) = unbounded_channel();
        let mut clients = Vec::new();
        for _ in 0..3 {
            let client = server.client();
            let tx = tx.clone();
            client.events().on("news", move |e| {
                let _ = tx.send(e.data);
            });
            client.connect().await.unwrap();
            clients.push(client);
        }

        server.broadcast("news", json!("hi")).await.unwrap();
        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap(), json!("hi"));
        }
    }

    #[tokio::test]
    async fn test_emit_to_unknown_peer_fails() {
        let server = InProcessServer::new();
        server.start().await.unwrap();
        let stranger = PeerHandle::new(None);

        let result = server.emit_to(&stranger, "x", Payload::Null).await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));
    }
}
