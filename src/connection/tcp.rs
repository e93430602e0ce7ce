//! TCP Connection
//!
//! Loop-side half of a socket. It lives on the relay event loop, tracks the
//! connection state, holds unconsumed input, and accounts for queued output so
//! the high-water-mark notification can be raised. The socket itself belongs
//! to a driver task (see [`super::driver`]).

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::driver::{self, Command, DialTarget, Shared};
use super::event::{ConnEvent, ConnId, EventSender, LoopEvent};
use crate::relay::backpressure::crosses_high_water_mark;
use crate::relay::leg::Leg;

/// Lifecycle of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// A TCP connection driven by the relay event loop
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    name: String,
    state: ConnState,
    peer_addr: Option<SocketAddr>,
    input: BytesMut,
    high_water_mark: Option<usize>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    events: EventSender,
    /// Present until an outbound connection is dialed
    dial: Option<(DialTarget, mpsc::UnboundedReceiver<Command>)>,
}

impl Connection {
    /// Wrap a socket accepted by the listener and start driving it
    pub fn accepted(
        id: ConnId,
        name: String,
        stream: TcpStream,
        events: EventSender,
        read_buffer_size: usize,
    ) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let shared = Arc::new(Shared::default());
        let (commands, commands_rx) = mpsc::unbounded_channel();

        driver::spawn_stream(id, stream, events.clone(), commands_rx, Arc::clone(&shared), read_buffer_size);

        Self {
            id,
            name,
            state: ConnState::Connected,
            peer_addr,
            input: BytesMut::new(),
            high_water_mark: None,
            shared,
            commands,
            events,
            dial: None,
        }
    }

    /// Create an outbound connection that dials `target` on [`Leg::connect`]
    pub fn client(id: ConnId, name: String, target: DialTarget, events: EventSender) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        Self {
            id,
            name,
            state: ConnState::Unconnected,
            peer_addr: None,
            input: BytesMut::new(),
            high_water_mark: None,
            shared: Arc::new(Shared::default()),
            commands,
            events,
            dial: Some((target, commands_rx)),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Bytes queued for sending that the socket has not taken yet
    pub fn pending_bytes(&self) -> usize {
        self.shared.pending()
    }
}

impl Leg for Connection {
    fn id(&self) -> ConnId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    fn connect(&mut self) {
        match self.dial.take() {
            Some((target, commands_rx)) if self.state == ConnState::Unconnected => {
                debug!("Connection {} dialing {}", self.name, target.backend);
                self.state = ConnState::Connecting;
                driver::spawn_dial(self.id, target, self.events.clone(), commands_rx, Arc::clone(&self.shared));
            }
            _ => warn!("Connection {} cannot connect in state {:?}", self.name, self.state),
        }
    }

    fn send(&mut self, data: Bytes) -> bool {
        if self.state != ConnState::Connected {
            trace!("Connection {} dropped {} bytes in state {:?}", self.name, data.len(), self.state);
            return false;
        }
        if data.is_empty() {
            return true;
        }

        let len = data.len();
        let before = self.shared.pending.fetch_add(len, Ordering::AcqRel);
        if self.commands.send(Command::Send(data)).is_err() {
            self.shared.pending.fetch_sub(len, Ordering::AcqRel);
            return false;
        }

        if let Some(threshold) = self.high_water_mark {
            let after = before + len;
            if crosses_high_water_mark(before, after, threshold) {
                // Queued rather than called inline, so the session sees it on a later dispatch
                let _ = self.events.send(LoopEvent::Conn(self.id, ConnEvent::HighWaterMark(after)));
            }
        }
        true
    }

    fn shutdown(&mut self) {
        match self.state {
            ConnState::Connected => {
                debug!("Connection {} shutting down write side", self.name);
                self.state = ConnState::Disconnecting;
                let _ = self.commands.send(Command::Shutdown);
            }
            ConnState::Connecting => {
                trace!("Connection {} still connecting, shutdown not applied", self.name);
            }
            _ => {}
        }
    }

    fn force_close(&mut self) {
        match self.state {
            ConnState::Unconnected => {
                self.dial = None;
                self.state = ConnState::Disconnected;
            }
            ConnState::Connecting | ConnState::Connected | ConnState::Disconnecting => {
                debug!("Connection {} force closing with {} bytes unsent", self.name, self.pending_bytes());
                self.state = ConnState::Disconnecting;
                self.shared.close.notify_one();
            }
            ConnState::Disconnected => {}
        }
    }

    fn set_tcp_no_delay(&mut self, on: bool) {
        let _ = self.commands.send(Command::SetNoDelay(on));
    }

    fn set_high_water_mark(&mut self, threshold: usize) {
        self.high_water_mark = Some(threshold);
    }

    fn input_buffer(&mut self) -> &mut BytesMut {
        &mut self.input
    }

    fn observe(&mut self, event: &ConnEvent) {
        match event {
            ConnEvent::Established { peer_addr, local_addr } => {
                if self.state == ConnState::Connecting {
                    self.state = ConnState::Connected;
                }
                debug!("Connection {} established {} -> {}", self.name, local_addr, peer_addr);
                self.peer_addr = Some(*peer_addr);
            }
            ConnEvent::Closed => {
                self.state = ConnState::Disconnected;
            }
            ConnEvent::Message(_) | ConnEvent::HighWaterMark(_) => {}
        }
    }
}
