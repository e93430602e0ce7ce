//! Connection Manager Implementation
//!
//! Front-end listener: accepts client connections and hands them to the
//! relay engine, which pairs each one with a backend connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::event::{event_channel, EventSender, LoopEvent};
use crate::config::Config;
use crate::relay::stats::EngineStats;
use crate::relay::RelayEngine;
use crate::Result;

/// Accepts client connections and feeds them to the relay engine
pub struct ConnectionManager {
    listener: Option<TcpListener>,
    config: Arc<Config>,
    stats: Arc<EngineStats>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConnectionManager {
    /// Create a ConnectionManager that stops when `shutdown_tx` broadcasts.
    ///
    /// Subscribes immediately, so a signal sent before [`start`](Self::start) is not lost.
    pub fn with_shutdown(config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            listener: None,
            config,
            stats: Arc::new(EngineStats::new()),
            shutdown_rx: shutdown_tx.subscribe(),
        }
    }

    /// Bind the listener without accepting yet. Returns the bound address.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let bind_addr = self.config.server.bind_addr;
        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Successfully bound to {}", local_addr);
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Start the relay engine and accept connections until shutdown
    pub async fn start(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }

        let (events, rx) = event_channel();
        let engine = RelayEngine::new(Arc::clone(&self.config), events.clone(), Arc::clone(&self.stats));
        let engine_handle = tokio::spawn(async move {
            if let Err(e) = engine.run(rx).await {
                error!("Relay engine error: {}", e);
            }
        });

        self.accept_connections(&events).await?;

        // Stop the engine: disconnect every session and wait for them to drain
        let _ = events.send(LoopEvent::Shutdown);
        drop(events);
        let shutdown_timeout = self.config.server.shutdown_timeout;
        let abort_handle = engine_handle.abort_handle();
        match timeout(shutdown_timeout, engine_handle).await {
            Ok(Ok(())) => debug!("Relay engine finished"),
            Ok(Err(e)) if e.is_cancelled() => debug!("Relay engine cancelled"),
            Ok(Err(e)) => error!("Relay engine task failed: {}", e),
            Err(_) => {
                warn!("Relay engine still had {} sessions after {:?}, closing them",
                      self.stats.active_sessions(), shutdown_timeout);
                abort_handle.abort();
            }
        }
        Ok(())
    }

    /// Main connection acceptance loop
    async fn accept_connections(&mut self, events: &EventSender) -> Result<()> {
        let listener = self.listener.as_ref()
            .ok_or_else(|| anyhow::anyhow!("Listener not initialized"))?;

        info!("Starting connection acceptance loop, relaying to {}", self.config.relay.backend_addr);
        let shutdown_rx = &mut self.shutdown_rx;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            if events.send(LoopEvent::Accepted(stream, addr)).is_err() {
                                error!("Relay engine is gone, stopping connection acceptance");
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                        }
                    }
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    /// Shared counters, readable while [`start`](Self::start) runs
    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }
}
