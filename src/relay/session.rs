//! Relay Session
//!
//! Pairs one inbound connection with one outbound connection to the backend
//! and forwards bytes between them unmodified. The two legs live and die
//! together: when one closes, the other is shut down.
//!
//! A session never calls into the event loop. Its callbacks are entries in a
//! [`CallbackTable`] naming the session's [`SessionKey`], and the loop hands
//! each notification to [`RelaySession::dispatch`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use super::backpressure::{BackpressureAction, BackpressurePolicy, Trip};
use super::leg::{Leg, Side};
use super::registry::{CallbackTable, SessionKey};
use super::state::{Lifecycle, SessionState};
use super::stats::{ConnectionStats, SessionStats};
use crate::connection::event::ConnEvent;

/// What to do with backend bytes that arrive after the client leg was released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Abort the process: the legs' lifetimes are no longer coupled
    Abort,
    Discard,
}

impl Default for OrphanPolicy {
    fn default() -> Self {
        OrphanPolicy::Abort
    }
}

/// Per-session tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub backpressure: BackpressurePolicy,
    pub tcp_nodelay: bool,
    pub orphaned_message: OrphanPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            backpressure: BackpressurePolicy::default(),
            tcp_nodelay: true,
            orphaned_message: OrphanPolicy::default(),
        }
    }
}

/// A client connection spliced onto a backend connection
#[derive(Debug)]
pub struct RelaySession<L: Leg> {
    name: String,
    backend: String,
    key: Option<SessionKey>,
    /// `None` once the session has been released
    inbound: Option<L>,
    outbound: L,
    lifecycle: Lifecycle,
    options: SessionOptions,
    stats: SessionStats,
}

impl<L: Leg> RelaySession<L> {
    /// `outbound` must be an unconnected leg aimed at `backend`
    pub fn new(backend: String, inbound: L, outbound: L, options: SessionOptions) -> Self {
        let name = inbound.name().to_string();
        debug!(
            "Tunnel {} <-> {}",
            inbound.peer_addr().map(|a| a.to_string()).unwrap_or_else(|| name.clone()),
            backend
        );

        Self {
            name,
            backend,
            key: None,
            inbound: Some(inbound),
            outbound,
            lifecycle: Lifecycle::new(),
            options,
            stats: SessionStats::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.state() == SessionState::Closed
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn inbound(&self) -> Option<&L> {
        self.inbound.as_ref()
    }

    pub fn outbound(&self) -> &L {
        &self.outbound
    }

    /// The backend connection, once it is established
    pub fn remote_connection(&self) -> Option<&L> {
        if self.outbound.is_connected() {
            Some(&self.outbound)
        } else {
            None
        }
    }

    /// Wire the session's callbacks. Performs no I/O; call once, before [`connect`](Self::connect).
    pub fn setup(&mut self, key: SessionKey, callbacks: &mut CallbackTable) {
        if self.key.is_some() {
            warn!("Session {} is already set up", self.name);
            return;
        }
        self.key = Some(key);

        let outbound = self.outbound.id();
        callbacks.set_connection_callback(outbound, key, Side::Outbound);
        callbacks.set_message_callback(outbound, key, Side::Outbound);

        if let Some(inbound) = self.inbound.as_mut() {
            inbound.set_high_water_mark(self.options.backpressure.threshold());
            callbacks.set_high_water_mark_callback(inbound.id(), key, Side::Inbound);
        }
    }

    /// Start the outbound handshake. Completion arrives as a connection notification.
    pub fn connect(&mut self) {
        if self.lifecycle.on_connect() {
            self.outbound.connect();
        } else {
            debug!("Session {} ignoring connect() in state {}", self.name, self.state());
        }
    }

    /// Shut down the outbound leg
    pub fn disconnect(&mut self) {
        if self.lifecycle.state() == SessionState::Unconnected {
            self.lifecycle.abandon_outbound();
            self.outbound.force_close();
        } else {
            self.outbound.shutdown();
        }
    }

    /// Detach from the outbound leg and shut down the inbound write side
    pub fn teardown(&mut self, callbacks: &mut CallbackTable) {
        callbacks.reset_connection_and_message(self.outbound.id());
        match self.inbound.as_mut() {
            Some(inbound) => inbound.shutdown(),
            None => {
                error!("Session {} torn down after its inbound leg was released", self.name);
                debug_assert!(false, "teardown without an inbound leg");
            }
        }
    }

    /// Shut down both legs, used when the relay itself is stopping
    pub fn terminate(&mut self) {
        if let Some(inbound) = self.inbound.as_mut() {
            inbound.shutdown();
        }
        self.disconnect();
    }

    /// Deliver a notification raised by the `side` leg
    pub fn dispatch(&mut self, side: Side, event: ConnEvent, callbacks: &mut CallbackTable) -> Option<Trip> {
        match side {
            Side::Inbound => {
                if let Some(inbound) = self.inbound.as_mut() {
                    inbound.observe(&event);
                }
            }
            Side::Outbound => self.outbound.observe(&event),
        }

        match (side, event) {
            (Side::Outbound, ConnEvent::Established { .. }) => {
                self.on_outbound_established(callbacks);
                None
            }
            (Side::Outbound, ConnEvent::Closed) => {
                self.on_outbound_closed(callbacks);
                None
            }
            (Side::Inbound, ConnEvent::Closed) => {
                self.on_inbound_closed(callbacks);
                None
            }
            (Side::Inbound, ConnEvent::Message(data)) => self.on_inbound_message(data),
            (Side::Outbound, ConnEvent::Message(data)) => {
                self.on_outbound_message(data);
                None
            }
            (side, ConnEvent::HighWaterMark(pending)) => self.on_high_water_mark(side, pending),
            (Side::Inbound, ConnEvent::Established { .. }) => None,
        }
    }

    fn on_outbound_established(&mut self, callbacks: &mut CallbackTable) {
        let inbound_alive = self.inbound.as_ref().map(|c| c.is_connected()).unwrap_or(false);
        if !self.lifecycle.on_established(inbound_alive) {
            debug!("Inbound {} was shut down before the tunnel connected", self.name);
            self.outbound.shutdown();
            return;
        }

        debug!("Session {} connected to backend {}", self.name, self.backend);
        if self.options.tcp_nodelay {
            self.outbound.set_tcp_no_delay(true);
        }
        self.outbound.set_high_water_mark(self.options.backpressure.threshold());
        match self.key {
            Some(key) => callbacks.set_high_water_mark_callback(self.outbound.id(), key, Side::Outbound),
            None => warn!("Session {} connected without setup(), backpressure is not armed", self.name),
        }

        if let Some(inbound) = self.inbound.as_mut() {
            let buffered = inbound.input_buffer().split().freeze();
            if !buffered.is_empty() {
                trace!("Session {} flushing {} early bytes", self.name, buffered.len());
                let len = buffered.len() as u64;
                if self.outbound.send(buffered) {
                    self.stats.add_bytes_up(len);
                }
            }
        }
    }

    fn on_outbound_closed(&mut self, callbacks: &mut CallbackTable) {
        debug!("Session {} backend leg closed", self.name);
        self.lifecycle.on_leg_closed(Side::Outbound);
        self.teardown(callbacks);
    }

    fn on_inbound_closed(&mut self, callbacks: &mut CallbackTable) {
        debug!("Session {} client leg closed", self.name);
        let never_dialed = self.state() == SessionState::Unconnected;
        self.disconnect();
        self.lifecycle.on_leg_closed(Side::Inbound);
        if never_dialed {
            // No Closed notification will come from a leg that was never dialed
            callbacks.reset_connection_and_message(self.outbound.id());
        }
    }

    /// Client to backend
    pub fn on_inbound_message(&mut self, data: Bytes) -> Option<Trip> {
        let inbound = self.inbound.as_mut()?;

        if self.outbound.is_connected() {
            let len = data.len() as u64;
            if self.outbound.send(data) {
                self.stats.add_bytes_up(len);
            }
            return None;
        }

        match self.lifecycle.state() {
            SessionState::Unconnected | SessionState::Connecting => {
                let buffer = inbound.input_buffer();
                buffer.extend_from_slice(&data);
                let buffered = buffer.len();
                if self.options.backpressure.is_exceeded(buffered) {
                    return self.on_high_water_mark(Side::Inbound, buffered);
                }
                None
            }
            _ => {
                trace!("Session {} discarding {} client bytes while closing", self.name, data.len());
                None
            }
        }
    }

    /// Backend to client
    pub fn on_outbound_message(&mut self, data: Bytes) {
        match self.inbound.as_mut() {
            Some(inbound) => {
                let len = data.len() as u64;
                if inbound.send(data) {
                    self.stats.add_bytes_down(len);
                }
            }
            None => {
                error!(
                    "Session {} received {} backend bytes after its client leg was released",
                    self.name,
                    data.len()
                );
                match self.options.orphaned_message {
                    OrphanPolicy::Abort => std::process::abort(),
                    OrphanPolicy::Discard => {}
                }
            }
        }
    }

    /// Unsent bytes on `side` climbed above the threshold.
    ///
    /// Only a live session with a connected offending leg trips. Marks still
    /// queued from before a trip or teardown are ignored.
    pub fn on_high_water_mark(&mut self, side: Side, pending: usize) -> Option<Trip> {
        if !matches!(self.state(), SessionState::Connecting | SessionState::Connected) {
            trace!("Session {} ignoring {} high-water mark in state {}", self.name, side, self.state());
            return None;
        }
        let leg = match side {
            Side::Inbound => self.inbound.as_ref()?,
            Side::Outbound => &self.outbound,
        };
        if !leg.is_connected() {
            trace!("Session {} ignoring high-water mark on disconnected {}", self.name, leg.name());
            return None;
        }
        let leg_name = leg.name().to_string();

        let trip = self.options.backpressure.on_high_water_mark(&leg_name, side, pending);
        self.lifecycle.on_backpressure();

        match side {
            Side::Outbound => match trip.action {
                BackpressureAction::Close => self.outbound.force_close(),
                BackpressureAction::Shutdown => self.disconnect(),
            },
            Side::Inbound => {
                if let Some(inbound) = self.inbound.as_mut() {
                    inbound.input_buffer().clear();
                    match trip.action {
                        BackpressureAction::Close => inbound.force_close(),
                        BackpressureAction::Shutdown => inbound.shutdown(),
                    }
                }
                self.disconnect();
            }
        }
        Some(trip)
    }

    /// Drop the legs and every route that still names this session.
    ///
    /// Only a CLOSED session may be released.
    pub fn release(&mut self, callbacks: &mut CallbackTable) -> ConnectionStats {
        debug_assert!(self.is_closed(), "releasing a session that is still {}", self.state());
        debug_assert!(!callbacks.is_attached(self.outbound.id()), "outbound callbacks still attached");

        callbacks.remove(self.outbound.id());
        let client_addr = match self.inbound.take() {
            Some(inbound) => {
                callbacks.remove(inbound.id());
                inbound.peer_addr()
            }
            None => None,
        };
        debug!("~Tunnel {}", self.name);
        self.stats.to_stats(&self.name, client_addr, &self.backend)
    }
}
