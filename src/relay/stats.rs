//! Relay Statistics

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Byte counters for one relay session
#[derive(Debug)]
pub struct SessionStats {
    start_time: Instant,
    bytes_up: u64,
    bytes_down: u64,
}

/// Statistics of a completed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub session_name: String,
    pub client_addr: Option<std::net::SocketAddr>,
    pub backend: String,
    pub start_time: SystemTime,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    /// Bytes forwarded client to backend
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up
    }

    /// Bytes forwarded backend to client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes_up(&mut self, bytes: u64) {
        self.bytes_up += bytes;
    }

    pub fn add_bytes_down(&mut self, bytes: u64) {
        self.bytes_down += bytes;
    }

    pub fn to_stats(
        &self,
        session_name: &str,
        client_addr: Option<std::net::SocketAddr>,
        backend: &str,
    ) -> ConnectionStats {
        let duration = self.duration();
        ConnectionStats {
            session_name: session_name.to_string(),
            client_addr,
            backend: backend.to_string(),
            start_time: SystemTime::now() - duration,
            duration_ms: duration.as_millis() as u64,
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
            total_bytes: self.total_bytes(),
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStats {
    pub fn log(&self) {
        info!(
            session = %self.session_name,
            backend = %self.backend,
            duration_ms = self.duration_ms,
            bytes_up = self.bytes_up,
            bytes_down = self.bytes_down,
            total_bytes = self.total_bytes,
            "Relay session completed"
        );
    }
}

/// Process-wide counters shared between the relay loop, the listener and shutdown
#[derive(Debug, Default)]
pub struct EngineStats {
    active_sessions: AtomicUsize,
    total_sessions: AtomicU64,
    rejected_connections: AtomicU64,
    backpressure_trips: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatsSnapshot {
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub rejected_connections: u64,
    pub backpressure_trips: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self, stats: &ConnectionStats) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(stats.bytes_up, Ordering::Relaxed);
        self.bytes_down.fetch_add(stats.bytes_down, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backpressure_tripped(&self) {
        self.backpressure_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            backpressure_trips: self.backpressure_trips.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}
