//! tcprelay Library
//!
//! Transparent TCP relay: every accepted client connection is paired with a
//! fresh connection to a fixed backend and bytes are spliced between the two
//! until either side goes away.

pub mod config;
pub mod connection;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use connection::ConnectionManager;
pub use relay::{RelayEngine, RelaySession};
pub use shutdown::ShutdownCoordinator;

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
