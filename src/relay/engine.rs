//! Relay Engine
//!
//! The event loop every session runs on. One task owns the session registry,
//! the callback table, and every loop-side connection, so session state is
//! only ever touched from here.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use super::leg::Side;
use super::registry::{CallbackTable, SessionKey, SessionRegistry};
use super::session::{RelaySession, SessionOptions};
use super::stats::EngineStats;
use crate::config::Config;
use crate::connection::event::{ConnEvent, ConnId, EventReceiver, EventSender, LoopEvent};
use crate::connection::tcp::Connection;
use crate::Result;

/// Owns and drives all relay sessions
pub struct RelayEngine {
    config: Arc<Config>,
    events: EventSender,
    registry: SessionRegistry<RelaySession<Connection>>,
    callbacks: CallbackTable,
    options: SessionOptions,
    stats: Arc<EngineStats>,
    next_conn_id: u64,
    shutting_down: bool,
}

impl RelayEngine {
    /// `events` must feed the receiver later passed to [`run`](Self::run)
    pub fn new(config: Arc<Config>, events: EventSender, stats: Arc<EngineStats>) -> Self {
        let options = config.relay.session_options();
        Self {
            config,
            events,
            registry: SessionRegistry::new(),
            callbacks: CallbackTable::new(),
            options,
            stats,
            next_conn_id: 1,
            shutting_down: false,
        }
    }

    /// Process events until shutdown has drained every session or all senders are gone
    pub async fn run(mut self, mut events: EventReceiver) -> Result<()> {
        info!("Relay engine started, forwarding to {}", self.config.relay.backend_addr);

        while let Some(event) = events.recv().await {
            self.handle_event(event);
            if self.shutting_down && self.registry.is_empty() {
                break;
            }
        }

        info!("Relay engine stopped with {} sessions open", self.registry.len());
        Ok(())
    }

    pub fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Accepted(stream, addr) => self.on_accepted(stream, addr),
            LoopEvent::Conn(conn, event) => self.on_connection_event(conn, event),
            LoopEvent::Shutdown => self.on_shutdown(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Look up a session by its inbound connection
    pub fn session(&self, inbound: ConnId) -> Option<&RelaySession<Connection>> {
        self.registry
            .find_by_inbound(inbound)
            .and_then(|key| self.registry.get(key))
    }

    fn next_id(&mut self) -> ConnId {
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        id
    }

    fn on_accepted(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.shutting_down {
            debug!("Rejecting connection from {} due to shutdown", addr);
            return;
        }

        if self.registry.len() >= self.config.server.max_connections {
            warn!(
                "Connection limit reached ({}), rejecting connection from {}",
                self.config.server.max_connections, addr
            );
            self.stats.connection_rejected();
            return;
        }

        let read_buffer_size = self.config.server.read_buffer_size;
        let inbound_id = self.next_id();
        let name = format!("conn_{}", inbound_id);
        let inbound = Connection::accepted(inbound_id, name.clone(), stream, self.events.clone(), read_buffer_size);

        let outbound_id = self.next_id();
        let outbound = Connection::client(
            outbound_id,
            format!("{}:backend", name),
            self.config.relay.dial_target(read_buffer_size),
            self.events.clone(),
        );

        let session = RelaySession::new(self.config.relay.backend_addr.clone(), inbound, outbound, self.options);
        let key = self.registry.insert(inbound_id, session);

        // The engine's own callbacks on the client connection
        self.callbacks.set_connection_callback(inbound_id, key, Side::Inbound);
        self.callbacks.set_message_callback(inbound_id, key, Side::Inbound);

        if let Some(session) = self.registry.get_mut(key) {
            session.setup(key, &mut self.callbacks);
            session.connect();
        }
        self.stats.session_opened();
        info!("Accepted connection {} from {}", name, addr);
    }

    fn on_connection_event(&mut self, conn: ConnId, event: ConnEvent) {
        let kind = event.kind();
        let (key, side) = match self.callbacks.resolve(conn, kind) {
            Some(route) => route,
            None => {
                trace!("No {:?} callback on connection {}, dropping notification", kind, conn);
                return;
            }
        };

        let session = match self.registry.get_mut(key) {
            Some(session) => session,
            None => {
                trace!("Session {} already released, dropping {:?} notification", key, kind);
                return;
            }
        };

        if session.dispatch(side, event, &mut self.callbacks).is_some() {
            self.stats.backpressure_tripped();
        }
        if session.is_closed() {
            self.release(key);
        }
    }

    fn on_shutdown(&mut self) {
        self.shutting_down = true;
        info!("Disconnecting {} relay sessions", self.registry.len());

        for key in self.registry.keys() {
            let closed = match self.registry.get_mut(key) {
                Some(session) => {
                    session.terminate();
                    session.is_closed()
                }
                None => false,
            };
            if closed {
                self.release(key);
            }
        }
    }

    fn release(&mut self, key: SessionKey) {
        if let Some(mut session) = self.registry.remove(key) {
            let stats = session.release(&mut self.callbacks);
            stats.log();
            self.stats.session_closed(&stats);
        }
    }
}
