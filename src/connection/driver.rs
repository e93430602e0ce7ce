//! Socket Drivers
//!
//! Every TCP socket is owned by one spawned task. The task turns reads into
//! [`ConnEvent`]s for the relay loop and executes [`Command`]s queued by the
//! loop-side connection object. Outbound sockets are dialed by the same task
//! before it starts driving them.

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use anyhow::{anyhow, Context};

use super::event::{ConnEvent, ConnId, EventSender, LoopEvent};
use crate::Result;

/// Work queued for a socket's writer half
#[derive(Debug)]
pub enum Command {
    Send(Bytes),
    /// Half-close once everything queued before it has been written
    Shutdown,
    SetNoDelay(bool),
}

/// State shared between the loop-side connection and its driver task
#[derive(Debug, Default)]
pub struct Shared {
    /// Bytes queued for sending but not yet written to the socket
    pub pending: AtomicUsize,
    /// Signalled to drop the socket without draining the queue
    pub close: Notify,
}

impl Shared {
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the driver for an already-established socket
pub fn spawn_stream(
    id: ConnId,
    stream: TcpStream,
    events: EventSender,
    commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    read_buffer_size: usize,
) {
    tokio::spawn(async move {
        drive(id, stream, &events, commands, &shared, read_buffer_size).await;
        let _ = events.send(LoopEvent::Conn(id, ConnEvent::Closed));
    });
}

/// Parameters of an outbound dial
#[derive(Debug, Clone)]
pub struct DialTarget {
    pub backend: String,
    pub connect_timeout: Duration,
    pub read_buffer_size: usize,
}

/// Spawn a task that dials `target` and then drives the resulting socket.
///
/// Handshake failures, including timeouts, surface as [`ConnEvent::Closed`].
pub fn spawn_dial(
    id: ConnId,
    target: DialTarget,
    events: EventSender,
    commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
) {
    tokio::spawn(async move {
        let dialed = tokio::select! {
            result = timeout(target.connect_timeout, connect_to_backend(&target.backend)) => result,
            _ = shared.close.notified() => {
                debug!("Connection {} closed while dialing {}", id, target.backend);
                let _ = events.send(LoopEvent::Conn(id, ConnEvent::Closed));
                return;
            }
        };

        let stream = match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Connection {} failed to reach backend {}: {:#}", id, target.backend, e);
                let _ = events.send(LoopEvent::Conn(id, ConnEvent::Closed));
                return;
            }
            Err(_) => {
                warn!("Connection {} timed out after {:?} dialing backend {}",
                      id, target.connect_timeout, target.backend);
                let _ = events.send(LoopEvent::Conn(id, ConnEvent::Closed));
                return;
            }
        };

        match (stream.peer_addr(), stream.local_addr()) {
            (Ok(peer_addr), Ok(local_addr)) => {
                let established = ConnEvent::Established { peer_addr, local_addr };
                if events.send(LoopEvent::Conn(id, established)).is_err() {
                    return;
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Connection {} lost its socket right after connecting: {}", id, e);
                let _ = events.send(LoopEvent::Conn(id, ConnEvent::Closed));
                return;
            }
        }

        drive(id, stream, &events, commands, &shared, target.read_buffer_size).await;
        let _ = events.send(LoopEvent::Conn(id, ConnEvent::Closed));
    });
}

/// Resolve `backend` (`host:port`) and connect to the first address that answers
pub async fn connect_to_backend(backend: &str) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = lookup_host(backend)
        .await
        .with_context(|| format!("Failed to resolve backend address {}", backend))?
        .collect();

    if addrs.is_empty() {
        return Err(anyhow!("DNS resolution returned no addresses for {}", backend));
    }

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("Connected to backend {} ({})", backend, addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("Failed to connect to {}: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(anyhow!("Connection failed: {}", e)),
        None => Err(anyhow!("Connection failed: no usable address for {}", backend)),
    }
}

/// Pump one socket until it closes.
///
/// The connection ends as soon as either direction finishes: peer EOF, a read
/// or write error, a forced close, or the loop dropping its command sender.
async fn drive(
    id: ConnId,
    stream: TcpStream,
    events: &EventSender,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shared: &Shared,
    read_buffer_size: usize,
) {
    let (mut reader, mut writer) = stream.into_split();

    let read_loop = async {
        let mut buf = BytesMut::with_capacity(read_buffer_size);
        loop {
            buf.reserve(read_buffer_size);
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!("Connection {} closed by peer", id);
                    break;
                }
                Ok(n) => {
                    trace!("Connection {} read {} bytes", id, n);
                    let chunk = buf.split().freeze();
                    if events.send(LoopEvent::Conn(id, ConnEvent::Message(chunk))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Connection {} read error: {}", id, e);
                    break;
                }
            }
        }
    };

    let write_loop = async {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Send(data) => {
                    let len = data.len();
                    if let Err(e) = writer.write_all(&data).await {
                        debug!("Connection {} write error: {}", id, e);
                        break;
                    }
                    shared.pending.fetch_sub(len, Ordering::AcqRel);
                }
                Command::Shutdown => {
                    if let Err(e) = writer.shutdown().await {
                        debug!("Connection {} shutdown error: {}", id, e);
                    }
                }
                Command::SetNoDelay(on) => {
                    if let Err(e) = writer.as_ref().set_nodelay(on) {
                        debug!("Connection {} failed to set TCP_NODELAY: {}", id, e);
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = read_loop => {}
        _ = write_loop => {}
        _ = shared.close.notified() => {
            debug!("Connection {} closed locally with {} bytes unsent", id, shared.pending());
        }
    }
}
