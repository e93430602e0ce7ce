//! Session Lifecycle
//!
//! ```text
//! UNCONNECTED -> CONNECTING  connect()
//! UNCONNECTED -> CLOSING     inbound closed before connect()
//! CONNECTING  -> CONNECTED   outbound established, inbound alive
//! CONNECTING  -> CLOSING     outbound established, inbound gone
//! CONNECTING  -> CLOSING     outbound handshake failed
//! CONNECTED   -> CLOSING     either leg closed, or backpressure trip
//! CLOSING     -> CLOSED      both legs closed
//! ```

use std::fmt;
use tracing::trace;

use super::leg::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unconnected => "UNCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Session state plus which legs have finished closing
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: SessionState,
    inbound_closed: bool,
    outbound_closed: bool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: SessionState::Unconnected,
            inbound_closed: false,
            outbound_closed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns false if the session was not waiting to connect
    pub fn on_connect(&mut self) -> bool {
        if self.state == SessionState::Unconnected {
            self.set(SessionState::Connecting);
            true
        } else {
            false
        }
    }

    /// Outbound handshake finished. Returns true if forwarding may start.
    pub fn on_established(&mut self, inbound_alive: bool) -> bool {
        match self.state {
            SessionState::Connecting if inbound_alive && !self.inbound_closed => {
                self.set(SessionState::Connected);
                true
            }
            SessionState::Connecting => {
                self.set(SessionState::Closing);
                false
            }
            _ => false,
        }
    }

    /// A leg finished closing
    pub fn on_leg_closed(&mut self, side: Side) -> SessionState {
        match side {
            Side::Inbound => self.inbound_closed = true,
            Side::Outbound => self.outbound_closed = true,
        }

        match self.state {
            SessionState::Unconnected => {
                // Nothing was dialed, so the outbound leg has nothing left to close
                self.outbound_closed = true;
                self.set(SessionState::Closing);
            }
            // Inbound loss while dialing is settled once the handshake completes
            SessionState::Connecting if side == Side::Inbound => {}
            SessionState::Connecting | SessionState::Connected => self.set(SessionState::Closing),
            SessionState::Closing | SessionState::Closed => {}
        }

        self.settle()
    }

    /// Either leg tripped the high-water mark
    pub fn on_backpressure(&mut self) {
        if matches!(self.state, SessionState::Connecting | SessionState::Connected) {
            self.set(SessionState::Closing);
        }
    }

    /// Outbound leg will never be dialed
    pub fn abandon_outbound(&mut self) {
        if self.state == SessionState::Unconnected {
            self.outbound_closed = true;
            self.set(SessionState::Closing);
        }
    }

    fn settle(&mut self) -> SessionState {
        if self.state == SessionState::Closing && self.inbound_closed && self.outbound_closed {
            self.set(SessionState::Closed);
        }
        self.state
    }

    fn set(&mut self, next: SessionState) {
        trace!("Session state {} -> {}", self.state, next);
        self.state = next;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut lc = Lifecycle::new();
        assert!(lc.on_connect());
        assert!(!lc.on_connect());
        assert_eq!(lc.state(), SessionState::Connecting);
        assert!(lc.on_established(true));
        assert_eq!(lc.state(), SessionState::Connected);
        assert_eq!(lc.on_leg_closed(Side::Outbound), SessionState::Closing);
        assert_eq!(lc.on_leg_closed(Side::Inbound), SessionState::Closed);
    }

    #[test]
    fn test_inbound_gone_while_connecting() {
        let mut lc = Lifecycle::new();
        lc.on_connect();
        assert_eq!(lc.on_leg_closed(Side::Inbound), SessionState::Connecting);
        assert!(!lc.on_established(true));
        assert_eq!(lc.state(), SessionState::Closing);
        assert_eq!(lc.on_leg_closed(Side::Outbound), SessionState::Closed);
    }

    #[test]
    fn test_handshake_failure() {
        let mut lc = Lifecycle::new();
        lc.on_connect();
        assert_eq!(lc.on_leg_closed(Side::Outbound), SessionState::Closing);
        assert!(!lc.on_established(true));
        assert_eq!(lc.on_leg_closed(Side::Inbound), SessionState::Closed);
    }

    #[test]
    fn test_inbound_closed_before_connect() {
        let mut lc = Lifecycle::new();
        assert_eq!(lc.on_leg_closed(Side::Inbound), SessionState::Closed);
        assert!(!lc.on_connect());
    }

    #[test]
    fn test_backpressure_moves_to_closing() {
        let mut lc = Lifecycle::new();
        lc.on_connect();
        lc.on_established(true);
        lc.on_backpressure();
        assert_eq!(lc.state(), SessionState::Closing);
        assert_eq!(lc.on_leg_closed(Side::Inbound), SessionState::Closing);
        assert_eq!(lc.on_leg_closed(Side::Outbound), SessionState::Closed);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut lc = Lifecycle::new();
        lc.on_connect();
        lc.on_established(true);
        lc.on_leg_closed(Side::Inbound);
        lc.on_leg_closed(Side::Outbound);
        lc.on_backpressure();
        assert_eq!(lc.on_leg_closed(Side::Outbound), SessionState::Closed);
        assert!(!lc.on_established(true));
    }
}
