//! Session Registry and Callback Table
//!
//! Sessions live by value in a generational arena. Connections never hold a
//! session directly: their callbacks name a [`SessionKey`], and the key is
//! resolved against the registry when a notification is dispatched. A key
//! whose session was released (or whose slot now holds a newer session) no
//! longer resolves, so late notifications fall through as no-ops.

use std::collections::HashMap;
use std::fmt;

use super::leg::Side;
use crate::connection::event::{ConnId, EventKind};

/// Non-owning handle to a session in a [`SessionRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    index: u32,
    generation: u32,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Option<(ConnId, T)>,
}

/// Active sessions, indexed by key and by inbound connection
#[derive(Debug)]
pub struct SessionRegistry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    by_inbound: HashMap<ConnId, SessionKey>,
}

impl<T> SessionRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_inbound: HashMap::new(),
        }
    }

    /// Register a session under its inbound connection's identity
    pub fn insert(&mut self, inbound: ConnId, value: T) -> SessionKey {
        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some((inbound, value));
                SessionKey { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, entry: Some((inbound, value)) });
                SessionKey { index, generation: 0 }
            }
        };
        self.by_inbound.insert(inbound, key);
        key
    }

    pub fn get(&self, key: SessionKey) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entry.as_ref())
            .map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, key: SessionKey) -> Option<&mut T> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entry.as_mut())
            .map(|(_, value)| value)
    }

    pub fn find_by_inbound(&self, inbound: ConnId) -> Option<SessionKey> {
        self.by_inbound.get(&inbound).copied()
    }

    /// Release a session. Every outstanding copy of `key` goes stale.
    pub fn remove(&mut self, key: SessionKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let (inbound, value) = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.by_inbound.remove(&inbound);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.by_inbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_inbound.is_empty()
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.by_inbound.values().copied().collect()
    }
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Subscriptions {
    connection: bool,
    message: bool,
    high_water_mark: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Route {
    session: SessionKey,
    side: Side,
    subs: Subscriptions,
}

/// Which session, if any, each connection's notifications are delivered to
#[derive(Debug, Default)]
pub struct CallbackTable {
    routes: HashMap<ConnId, Route>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connection_callback(&mut self, conn: ConnId, session: SessionKey, side: Side) {
        self.route_mut(conn, session, side).subs.connection = true;
    }

    pub fn set_message_callback(&mut self, conn: ConnId, session: SessionKey, side: Side) {
        self.route_mut(conn, session, side).subs.message = true;
    }

    pub fn set_high_water_mark_callback(&mut self, conn: ConnId, session: SessionKey, side: Side) {
        self.route_mut(conn, session, side).subs.high_water_mark = true;
    }

    /// Restore the default connection and message callbacks (log and discard)
    pub fn reset_connection_and_message(&mut self, conn: ConnId) {
        if let Some(route) = self.routes.get_mut(&conn) {
            route.subs.connection = false;
            route.subs.message = false;
        }
    }

    /// True while connection or message notifications still reach a session
    pub fn is_attached(&self, conn: ConnId) -> bool {
        self.routes
            .get(&conn)
            .map(|route| route.subs.connection || route.subs.message)
            .unwrap_or(false)
    }

    /// Find the session subscribed to `kind` notifications from `conn`
    pub fn resolve(&self, conn: ConnId, kind: EventKind) -> Option<(SessionKey, Side)> {
        let route = self.routes.get(&conn)?;
        let subscribed = match kind {
            EventKind::Connection => route.subs.connection,
            EventKind::Message => route.subs.message,
            EventKind::HighWaterMark => route.subs.high_water_mark,
        };
        subscribed.then_some((route.session, route.side))
    }

    pub fn remove(&mut self, conn: ConnId) {
        self.routes.remove(&conn);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn route_mut(&mut self, conn: ConnId, session: SessionKey, side: Side) -> &mut Route {
        let route = self.routes.entry(conn).or_insert(Route {
            session,
            side,
            subs: Subscriptions::default(),
        });
        if route.session != session || route.side != side {
            *route = Route { session, side, subs: Subscriptions::default() };
        }
        route
    }
}
