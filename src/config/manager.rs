//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{Context, bail};
use std::path::Path;
use std::net::SocketAddr;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Build the configuration from defaults, then environment variables, then
    /// the values present in `path` (if the file exists).
    ///
    /// Nothing is validated here: CLI overrides are applied afterwards and the
    /// caller validates the final result once.
    pub fn load(path: &Path) -> Result<Config> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// [`load`](Self::load) with an explicit environment lookup
    pub fn load_with_env<F>(path: &Path, env: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        Self::apply_env(&mut config, env)?;

        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            config = Self::overlay_file(&config, path)?;
        } else {
            tracing::info!("Config file {} not found, using environment and defaults", path.display());
        }

        Ok(config)
    }

    fn apply_env<F>(config: &mut Config, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind_addr) = env("TCPRELAY_BIND_ADDR") {
            config.server.bind_addr = bind_addr.parse::<SocketAddr>()
                .with_context(|| format!("Invalid TCPRELAY_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(backend) = env("TCPRELAY_BACKEND_ADDR") {
            config.relay.backend_addr = backend;
        }

        if let Some(max_conn) = env("TCPRELAY_MAX_CONNECTIONS") {
            config.server.max_connections = max_conn.parse::<usize>()
                .with_context(|| format!("Invalid TCPRELAY_MAX_CONNECTIONS: {}", max_conn))?;
        }

        if let Some(hwm) = env("TCPRELAY_HIGH_WATER_MARK") {
            config.relay.high_water_mark = hwm.parse::<usize>()
                .with_context(|| format!("Invalid TCPRELAY_HIGH_WATER_MARK: {}", hwm))?;
        }

        if let Some(timeout) = env("TCPRELAY_CONNECT_TIMEOUT") {
            config.relay.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TCPRELAY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Some(log_level) = env("TCPRELAY_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        Ok(())
    }

    /// Keys set in the file replace the matching keys of `base`; the rest are kept
    fn overlay_file(base: &Config, path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let file: toml::Table = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        let mut merged = toml::Value::try_from(base)
            .context("Failed to serialize base configuration")?;
        if let toml::Value::Table(table) = &mut merged {
            merge_tables(table, file);
        }

        merged
            .try_into::<Config>()
            .with_context(|| format!("Invalid value in config file: {}", path.display()))
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(nested) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, nested);
                continue;
            }
            base.insert(key, toml::Value::Table(nested));
        } else {
            base.insert(key, value);
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if self.server.max_connections > 100000 {
            bail!("max_connections cannot exceed 100,000 for safety");
        }

        if self.server.read_buffer_size < 1024 {
            bail!("read_buffer_size must be at least 1024 bytes");
        }

        if self.server.read_buffer_size > 1048576 {
            bail!("read_buffer_size cannot exceed 1MB");
        }

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        validate_backend_addr(&self.relay.backend_addr)?;

        if self.relay.high_water_mark < self.server.read_buffer_size {
            bail!(
                "high_water_mark ({}) must be at least read_buffer_size ({})",
                self.relay.high_water_mark,
                self.server.read_buffer_size
            );
        }

        if self.relay.connect_timeout < Duration::from_millis(1) {
            bail!("connect_timeout must be greater than 0");
        }

        if self.relay.connect_timeout > Duration::from_secs(3600) {
            bail!("connect_timeout cannot exceed 1 hour");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        backend: Option<&str>,
        max_connections: Option<usize>,
        high_water_mark: Option<usize>,
        connect_timeout: Option<u64>,
    ) {
        if let Some(bind_str) = bind {
            if let Ok(addr) = bind_str.parse::<SocketAddr>() {
                self.server.bind_addr = addr;
                tracing::info!("CLI override: bind address set to {}", addr);
            } else {
                tracing::warn!("Invalid bind address provided: {}", bind_str);
            }
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(backend) = backend {
            self.relay.backend_addr = backend.to_string();
            tracing::info!("CLI override: backend set to {}", backend);
        }

        if let Some(max_conn) = max_connections {
            self.server.max_connections = max_conn;
            tracing::info!("CLI override: max connections set to {}", max_conn);
        }

        if let Some(hwm) = high_water_mark {
            self.relay.high_water_mark = hwm;
            tracing::info!("CLI override: high-water mark set to {} bytes", hwm);
        }

        if let Some(timeout_secs) = connect_timeout {
            self.relay.connect_timeout = Duration::from_secs(timeout_secs);
            tracing::info!("CLI override: connect timeout set to {}s", timeout_secs);
        }
    }
}

/// Accepts `host:port` with a non-zero port; IPv6 hosts use brackets
fn validate_backend_addr(addr: &str) -> Result<()> {
    let (host, port) = match addr.rsplit_once(':') {
        Some(parts) => parts,
        None => bail!("backend_addr '{}' must be in host:port form", addr),
    };

    if host.is_empty() || host == "[]" {
        bail!("backend_addr '{}' has an empty host", addr);
    }

    let port: u16 = port.parse()
        .with_context(|| format!("backend_addr '{}' has an invalid port", addr))?;
    if port == 0 {
        bail!("backend_addr '{}' has port 0", addr);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::backpressure::BackpressureAction;
    use crate::relay::session::OrphanPolicy;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.high_water_mark, 10 * 1024 * 1024);
        assert_eq!(config.relay.on_high_water_mark, BackpressureAction::Close);
        assert_eq!(config.relay.orphaned_message, OrphanPolicy::Abort);
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
bind_addr = "0.0.0.0:2200"

[relay]
backend_addr = "db.internal:5432"
high_water_mark = 65536
connect_timeout = "250ms"
on_high_water_mark = "shutdown"
orphaned_message = "discard"
"#
        )
        .unwrap();

        let config = ConfigManager::load_with_env(file.path(), no_env).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind_addr, "0.0.0.0:2200".parse().unwrap());
        assert_eq!(config.server.max_connections, 10000);
        assert_eq!(config.relay.backend_addr, "db.internal:5432");
        assert_eq!(config.relay.high_water_mark, 65536);
        assert_eq!(config.relay.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.relay.on_high_water_mark, BackpressureAction::Shutdown);
        assert_eq!(config.relay.orphaned_message, OrphanPolicy::Discard);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_fills_keys_the_file_omits() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nmax_connections = 5\n\n[logging]\nlevel = \"warn\"").unwrap();

        let env = |key: &str| match key {
            "TCPRELAY_BACKEND_ADDR" => Some("10.9.9.9:9999".to_string()),
            "TCPRELAY_CONNECT_TIMEOUT" => Some("3s".to_string()),
            "TCPRELAY_LOG_LEVEL" => Some("debug".to_string()),
            _ => None,
        };
        let config = ConfigManager::load_with_env(file.path(), env).unwrap();

        assert_eq!(config.server.max_connections, 5);
        assert_eq!(config.relay.backend_addr, "10.9.9.9:9999");
        assert_eq!(config.relay.connect_timeout, Duration::from_secs(3));
        // The file wins where both set a value
        assert_eq!(config.logging.level, "warn");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_env_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let env = |key: &str| (key == "TCPRELAY_MAX_CONNECTIONS").then(|| "42".to_string());
        let config = ConfigManager::load_with_env(&dir.path().join("absent.toml"), env).unwrap();
        assert_eq!(config.server.max_connections, 42);
        assert_eq!(config.relay.backend_addr, "127.0.0.1:3000");
    }

    #[test]
    fn test_invalid_env_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let env = |key: &str| (key == "TCPRELAY_HIGH_WATER_MARK").then(|| "lots".to_string());
        assert!(ConfigManager::load_with_env(&dir.path().join("absent.toml"), env).is_err());
    }

    #[test]
    fn test_cli_repairs_invalid_file_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nbackend_addr = \"no-port\"").unwrap();

        let mut config = ConfigManager::load_with_env(file.path(), no_env).unwrap();
        assert!(config.validate().is_err());

        config.merge_with_cli_args(None, None, Some("backend.local:8080"), None, None, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nhigh_water_mark = \"big\"").unwrap();
        assert!(ConfigManager::load_with_env(file.path(), no_env).is_err());
    }

    #[test]
    fn test_backend_addr_validation() {
        assert!(validate_backend_addr("127.0.0.1:80").is_ok());
        assert!(validate_backend_addr("[::1]:8080").is_ok());
        assert!(validate_backend_addr("backend.local:443").is_ok());
        assert!(validate_backend_addr("backend.local").is_err());
        assert!(validate_backend_addr(":80").is_err());
        assert!(validate_backend_addr("host:0").is_err());
        assert!(validate_backend_addr("host:http").is_err());
    }

    #[test]
    fn test_high_water_mark_below_read_buffer() {
        let mut config = Config::default();
        config.relay.high_water_mark = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = Config::default();
        config.merge_with_cli_args(
            Some("0.0.0.0:9000"),
            Some(9100),
            Some("10.0.0.5:6379"),
            Some(50),
            Some(1 << 20),
            Some(3),
        );
        assert_eq!(config.server.bind_addr, "0.0.0.0:9100".parse().unwrap());
        assert_eq!(config.relay.backend_addr, "10.0.0.5:6379");
        assert_eq!(config.server.max_connections, 50);
        assert_eq!(config.relay.high_water_mark, 1 << 20);
        assert_eq!(config.relay.connect_timeout, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }
}
