//! Socket Channel
//!
//! Unix domain socket or TCP implementation of the message channel. The
//! endpoint comes from [`IpcOptions::endpoint`](crate::config::IpcOptions::endpoint):
//! a configured `network_port` selects TCP, otherwise the unix socket at
//! `socket_root + appspace + id` is used.
//!
//! Both sides run one task per connection that multiplexes reads from the
//! stream with writes from an outbound queue, framed by [`FrameCodec`].

mod client;
mod server;

pub use client::SocketClient;
pub use server::SocketServer;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

use super::frame::{FrameCodec, FrameDecoder};
use super::EventPacket;
use crate::config::{Endpoint, InterfaceOptions};
use crate::error::TransportError;

/// Outbound queue depth per connection
const OUTBOUND_CAPACITY: usize = 256;

/// Read buffer size
const READ_BUFFER_SIZE: usize = 4096;

/// Byte stream of either socket family
pub(crate) trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub(crate) type BoxedStream = Box<dyn Stream>;

/// Bound listener of either socket family
pub(crate) enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Bind the endpoint
    ///
    /// For unix sockets the parent directory is created and, when `unlink`
    /// is set, a stale socket file is removed first.
    pub(crate) async fn bind(endpoint: &Endpoint, unlink: bool) -> io::Result<Self> {
        match endpoint {
            Endpoint::Unix(path) => {
                prepare_socket_path(path, unlink).await?;
                Ok(Self::Unix(UnixListener::bind(path)?))
            }
            Endpoint::Tcp { host, port } => {
                Ok(Self::Tcp(TcpListener::bind((host.as_str(), *port)).await?))
            }
        }
    }

    /// Accept one connection; returns the stream and the remote address
    pub(crate) async fn accept(&self) -> io::Result<(BoxedStream, Option<String>)> {
        match self {
            Self::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok((Box::new(stream), None))
            }
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), Some(addr.to_string())))
            }
        }
    }

    /// Local TCP address, for listeners bound to port 0
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Unix(_) => None,
            Self::Tcp(listener) => listener.local_addr().ok(),
        }
    }
}

async fn prepare_socket_path(path: &Path, unlink: bool) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to create directory {}: {e}", parent.display()),
            )
        })?;
    }

    if unlink && tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::remove_file(path).await.map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to remove old socket {}: {e}", path.display()),
            )
        })?;
    }
    Ok(())
}

/// Open a connection to the endpoint
pub(crate) async fn connect(
    endpoint: &Endpoint,
    interfaces: &InterfaceOptions,
) -> Result<BoxedStream, TransportError> {
    match endpoint {
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await.map_err(|e| {
                TransportError::ConnectionFailed(format!(
                    "Failed to connect to {}: {e}",
                    path.display()
                ))
            })?;
            Ok(Box::new(stream))
        }
        Endpoint::Tcp { host, port } => {
            let stream = connect_tcp(host, *port, interfaces).await.map_err(|e| {
                TransportError::ConnectionFailed(format!(
                    "Failed to connect to {host}:{port}: {e}"
                ))
            })?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
    }
}

async fn connect_tcp(host: &str, port: u16, interfaces: &InterfaceOptions) -> io::Result<TcpStream> {
    let remote = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("No address for {host}")))?;

    if interfaces.is_empty() {
        return TcpStream::connect(remote).await;
    }

    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    let local_ip = match &interfaces.local_address {
        Some(addr) => addr
            .parse::<IpAddr>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
        None if remote.is_ipv4() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        None => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    socket.bind(SocketAddr::new(local_ip, interfaces.local_port.unwrap_or(0)))?;
    socket.connect(remote).await
}

/// Why a connection loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpEnd {
    /// The remote side closed or the stream failed
    RemoteClosed,
    /// The outbound queue was closed locally
    LocalClosed,
    /// Shutdown was signalled
    Shutdown,
}

/// Drive one connection until it ends
///
/// Every decoded packet, or decode failure, is handed to `on_packet`.
/// Dropping the `watch::Sender` behind `shutdown` ends the loop after
/// the outbound queue has been flushed.
pub(crate) async fn pump<F>(
    mut stream: BoxedStream,
    codec: FrameCodec,
    outbound: &mut mpsc::Receiver<EventPacket>,
    shutdown: &mut watch::Receiver<bool>,
    mut on_packet: F,
) -> PumpEnd
where
    F: FnMut(Result<EventPacket, TransportError>),
{
    let mut decoder = FrameDecoder::new(codec.clone());
    let mut buf = [0u8; READ_BUFFER_SIZE];

    let end = loop {
        tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => break PumpEnd::RemoteClosed,
                Ok(n) => {
                    decoder.push(&buf[..n]);
                    loop {
                        match decoder.decode() {
                            Ok(Some(packet)) => on_packet(Ok(packet)),
                            Ok(None) => break,
                            Err(e) => on_packet(Err(e)),
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Read error");
                    break PumpEnd::RemoteClosed;
                }
            },
            packet = outbound.recv() => match packet {
                Some(packet) => match codec.encode(&packet) {
                    Ok(data) => {
                        if let Err(e) = stream.write_all(&data).await {
                            tracing::debug!(error = %e, "Write error");
                            break PumpEnd::RemoteClosed;
                        }
                    }
                    Err(e) => on_packet(Err(e)),
                },
                None => break PumpEnd::LocalClosed,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break PumpEnd::Shutdown;
                }
            }
        }
    };

    // Packets queued before a local shutdown are still written
    if end == PumpEnd::Shutdown {
        while let Ok(packet) = outbound.try_recv() {
            match codec.encode(&packet) {
                Ok(data) => {
                    if stream.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Err(e) => on_packet(Err(e)),
            }
        }
    }

    let _ = stream.shutdown().await;
    end
}

/// Create an outbound queue
pub(crate) fn outbound_queue() -> (mpsc::Sender<EventPacket>, mpsc::Receiver<EventPacket>) {
    mpsc::channel(OUTBOUND_CAPACITY)
}
