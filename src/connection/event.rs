//! Connection Events
//!
//! Notifications flowing from socket drivers to the relay event loop.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Identifier of a single TCP connection, unique for the life of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notification raised by a connection
#[derive(Debug)]
pub enum ConnEvent {
    /// Outbound handshake completed
    Established { peer_addr: SocketAddr, local_addr: SocketAddr },
    /// Bytes read from the socket
    Message(Bytes),
    /// Unsent bytes rose above the connection's high-water mark
    HighWaterMark(usize),
    /// Connection is gone (peer close, I/O error, handshake failure or local close)
    Closed,
}

impl ConnEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnEvent::Established { .. } | ConnEvent::Closed => EventKind::Connection,
            ConnEvent::Message(_) => EventKind::Message,
            ConnEvent::HighWaterMark(_) => EventKind::HighWaterMark,
        }
    }
}

/// Which callback slot a notification is delivered through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connection,
    Message,
    HighWaterMark,
}

/// Everything the relay event loop reacts to
#[derive(Debug)]
pub enum LoopEvent {
    /// A new inbound connection from the listener
    Accepted(TcpStream, SocketAddr),
    /// A notification from an existing connection
    Conn(ConnId, ConnEvent),
    /// Disconnect every session and stop accepting work
    Shutdown,
}

pub type EventSender = mpsc::UnboundedSender<LoopEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<LoopEvent>;

/// Create the channel feeding the relay event loop
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
