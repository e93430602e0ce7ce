//! Relay Legs
//!
//! The event-driven connection primitive a relay session is built on.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;

use crate::connection::event::{ConnEvent, ConnId};

/// Which half of a session a connection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Connection accepted from the client
    Inbound,
    /// Connection the relay opened to the backend
    Outbound,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Inbound => write!(f, "inbound"),
            Side::Outbound => write!(f, "outbound"),
        }
    }
}

/// A connection as seen by a relay session.
///
/// Every operation is non-blocking: sends are queued, and shutdown and close
/// are requests whose completion is reported later as [`ConnEvent::Closed`].
pub trait Leg {
    fn id(&self) -> ConnId;

    fn name(&self) -> &str;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// True only while the connection is established and accepting sends
    fn is_connected(&self) -> bool;

    /// Start an outbound handshake. Legs that are already connected ignore it.
    fn connect(&mut self);

    /// Queue `data` for sending. Returns false if the leg no longer accepts bytes.
    fn send(&mut self, data: Bytes) -> bool;

    /// Half-close the write side once queued bytes are flushed
    fn shutdown(&mut self);

    /// Drop the socket without flushing queued bytes
    fn force_close(&mut self);

    fn set_tcp_no_delay(&mut self, on: bool);

    /// Arm the high-water-mark notification at `threshold` unsent bytes
    fn set_high_water_mark(&mut self, threshold: usize);

    /// Bytes received but not yet consumed
    fn input_buffer(&mut self) -> &mut BytesMut;

    /// Update connection state from a notification before it is dispatched
    fn observe(&mut self, event: &ConnEvent);
}
