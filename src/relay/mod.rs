//! Data Relay Module
//!
//! Relay sessions, their lifecycle and backpressure policy, and the event
//! loop that drives them.

pub mod backpressure;
pub mod engine;
pub mod leg;
pub mod registry;
pub mod session;
pub mod state;
pub mod stats;

pub use backpressure::{BackpressureAction, BackpressurePolicy};
pub use engine::RelayEngine;
pub use leg::{Leg, Side};
pub use registry::{CallbackTable, SessionKey, SessionRegistry};
pub use session::{OrphanPolicy, RelaySession, SessionOptions};
pub use state::SessionState;
pub use stats::{ConnectionStats, EngineStats};
