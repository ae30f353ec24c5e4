use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    model::{Role, UserId},
    protocol::{self, ServerEvent},
};

/// An encoded outbound frame, shared between every recipient of a fan-out.
pub type Frame = Utf8Bytes;
pub type Outbox = mpsc::Sender<Frame>;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Identity a connection announced.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
    /// Whether the id matched a record in the Identity Store.
    pub verified: bool,
}

impl Identity {
    /// Admin rights only come from a stored record, never from the announcement.
    pub fn is_admin(&self) -> bool {
        self.verified && self.role.is_admin()
    }
}

struct Peer {
    outbox: Outbox,
    identity: Option<Identity>,
}

/// The gateway's table of live connections and their outbound queues.
#[derive(Default)]
pub struct Connections {
    peers: HashMap<ConnectionId, Peer>,
}

impl Connections {
    pub fn insert(&mut self, conn: ConnectionId, outbox: Outbox) {
        self.peers.insert(conn, Peer { outbox, identity: None });
    }

    pub fn remove(&mut self, conn: ConnectionId) -> Option<Identity> {
        self.peers.remove(&conn).and_then(|peer| peer.identity)
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.peers.contains_key(&conn)
    }

    /// Binds an identity, returning the one it replaces.
    pub fn identify(&mut self, conn: ConnectionId, identity: Identity) -> Option<Identity> {
        self.peers.get_mut(&conn)?.identity.replace(identity)
    }

    pub fn identity(&self, conn: ConnectionId) -> Option<&Identity> {
        self.peers.get(&conn)?.identity.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn send_to(&self, conn: ConnectionId, event: &ServerEvent) {
        let Some(frame) = encode(event) else {
            return;
        };
        if let Some(peer) = self.peers.get(&conn) {
            deliver(conn, peer, frame, event.name());
        }
    }

    pub fn broadcast(&self, event: &ServerEvent) {
        self.fan_out(event, None);
    }

    pub fn broadcast_except(&self, sender: ConnectionId, event: &ServerEvent) {
        self.fan_out(event, Some(sender));
    }

    fn fan_out(&self, event: &ServerEvent, skip: Option<ConnectionId>) {
        let Some(frame) = encode(event) else {
            return;
        };
        for (&conn, peer) in &self.peers {
            if Some(conn) != skip {
                deliver(conn, peer, frame.clone(), event.name());
            }
        }
    }
}

fn encode(event: &ServerEvent) -> Option<Frame> {
    match protocol::encode(event) {
        Ok(json) => Some(json.into()),
        Err(err) => {
            tracing::error!(event = event.name(), error = %err, "failed to encode outbound event");
            None
        }
    }
}

fn deliver(conn: ConnectionId, peer: &Peer, frame: Frame, event: &'static str) {
    match peer.outbox.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) if event == "user_typing" => {
            tracing::trace!(%conn, "outbound queue full, typing indicator dropped");
        }
        Err(TrySendError::Full(_)) => {
            tracing::warn!(%conn, event, "outbound queue full, frame dropped");
        }
        // writer already gone; the disconnect is on its way
        Err(TrySendError::Closed(_)) => {}
    }
}
