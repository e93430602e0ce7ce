//! Backpressure Policy
//!
//! A leg whose unsent bytes climb above the high-water mark has a peer that is
//! not draining. The relay never pauses reads or backs off: the offending leg
//! is disconnected and the session is torn down.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::leg::Side;

/// Default high-water mark: 10 MiB of unsent data
pub const DEFAULT_HIGH_WATER_MARK: usize = 10 * 1024 * 1024;

/// What happens to the leg that raised the high-water-mark notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureAction {
    /// Drop the socket and discard queued bytes
    Close,
    /// Half-close after queued bytes drain
    Shutdown,
}

impl Default for BackpressureAction {
    fn default() -> Self {
        BackpressureAction::Close
    }
}

/// Decision taken for a tripped leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trip {
    pub side: Side,
    pub pending: usize,
    pub action: BackpressureAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressurePolicy {
    threshold: usize,
    action: BackpressureAction,
}

impl BackpressurePolicy {
    pub fn new(threshold: usize, action: BackpressureAction) -> Self {
        Self { threshold, action }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn action(&self) -> BackpressureAction {
        self.action
    }

    pub fn is_exceeded(&self, pending: usize) -> bool {
        pending > self.threshold
    }

    /// Evaluate a high-water-mark notification raised by `side`
    pub fn on_high_water_mark(&self, name: &str, side: Side, pending: usize) -> Trip {
        info!(
            connection = %name,
            side = %side,
            pending_bytes = pending,
            threshold = self.threshold,
            "High-water mark reached on {} with {} bytes unsent", name, pending
        );
        Trip { side, pending, action: self.action }
    }
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATER_MARK, BackpressureAction::default())
    }
}

/// True when a queue that held `before` bytes and now holds `after` bytes just
/// climbed above `threshold`. Fires once per crossing, not once per send.
pub fn crosses_high_water_mark(before: usize, after: usize, threshold: usize) -> bool {
    before <= threshold && after > threshold
}
