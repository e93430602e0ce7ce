//! Connection Management Module
//!
//! Sockets, their driver tasks, and the front-end listener.

pub mod driver;
pub mod event;
pub mod manager;
pub mod tcp;

pub use event::{ConnEvent, ConnId, LoopEvent};
pub use manager::ConnectionManager;
pub use tcp::{ConnState, Connection};
