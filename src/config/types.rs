//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::driver::DialTarget;
use crate::relay::backpressure::{BackpressureAction, BackpressurePolicy, DEFAULT_HIGH_WATER_MARK};
use crate::relay::session::{OrphanPolicy, SessionOptions};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

/// Front-end listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub read_buffer_size: usize,
}

/// Backend leg and session policy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Backend endpoint as `host:port`
    pub backend_addr: String,
    /// Unsent bytes on either leg above which the session is terminated
    pub high_water_mark: usize,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
    pub on_high_water_mark: BackpressureAction,
    pub orphaned_message: OrphanPolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 2000)),
            max_connections: 10000,
            shutdown_timeout: Duration::from_secs(30),
            read_buffer_size: 16 * 1024,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend_addr: "127.0.0.1:3000".to_string(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            on_high_water_mark: BackpressureAction::default(),
            orphaned_message: OrphanPolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl RelayConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            backpressure: BackpressurePolicy::new(self.high_water_mark, self.on_high_water_mark),
            tcp_nodelay: self.tcp_nodelay,
            orphaned_message: self.orphaned_message,
        }
    }

    pub fn dial_target(&self, read_buffer_size: usize) -> DialTarget {
        DialTarget {
            backend: self.backend_addr.clone(),
            connect_timeout: self.connect_timeout,
            read_buffer_size,
        }
    }
}
