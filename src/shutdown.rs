//! Graceful Shutdown Handling
//!
//! Listens for SIGTERM and SIGINT, tells the listener to stop accepting, and
//! waits for the open relay sessions to drain.

use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::signal;
use tracing::{debug, info, warn};

use crate::relay::EngineStats;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self { shutdown_tx, timeout }
    }

    /// Sender handed to the connection manager so it stops with the coordinator
    pub fn sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Broadcast shutdown without waiting for a signal
    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No shutdown subscribers: {}", e);
        }
    }

    /// Block until SIGTERM or SIGINT arrives, then broadcast shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal: {}", e);
        }

        Ok(())
    }

    /// Wait for active sessions to reach zero, bounded by the timeout
    pub async fn shutdown_connections(&self, stats: &EngineStats) -> Result<()> {
        let start_time = Instant::now();

        let mut last_count = stats.active_sessions();
        info!("Waiting for {} relay sessions to close (timeout: {:?})", last_count, self.timeout);

        while last_count > 0 && start_time.elapsed() < self.timeout {
            tokio::time::sleep(Duration::from_millis(100)).await;

            let current_count = stats.active_sessions();
            if current_count != last_count {
                debug!("Active sessions: {} -> {}", last_count, current_count);
                last_count = current_count;
            }
        }

        let elapsed = start_time.elapsed();
        if last_count == 0 {
            info!("All sessions closed gracefully in {:?}", elapsed);
        } else {
            warn!("Shutdown timeout reached after {:?} with {} sessions still active",
                  elapsed, last_count);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::config::Config;
    use crate::connection::ConnectionManager;

    #[tokio::test]
    async fn test_shutdown_signal_broadcast() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut receiver = coordinator.sender().subscribe();

        coordinator.trigger();

        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_connections_returns_when_idle() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let stats = EngineStats::new();

        let start = Instant::now();
        coordinator.shutdown_connections(&stats).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shutdown_connections_times_out() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(300));
        let stats = EngineStats::new();
        stats.session_opened();

        coordinator.shutdown_connections(&stats).await.unwrap();
        assert_eq!(stats.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_trigger_stops_connection_manager() {
        let mut config = Config::default();
        config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
        config.server.shutdown_timeout = Duration::from_secs(2);

        let coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
        let mut manager = ConnectionManager::with_shutdown(Arc::new(config), coordinator.sender());
        // Triggered before start(): the manager subscribed when it was built
        coordinator.trigger();

        let stats = manager.stats();
        tokio::time::timeout(Duration::from_secs(2), manager.start())
            .await
            .expect("manager did not stop")
            .unwrap();
        coordinator.shutdown_connections(&stats).await.unwrap();
        assert_eq!(stats.active_sessions(), 0);
    }
}
