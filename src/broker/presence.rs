use std::collections::{HashMap, HashSet};

use crate::model::UserId;

use super::ConnectionId;

/// Which user ids currently have a live connection bound.
///
/// Last connection wins: binding a user that is already online replaces the
/// old entry, and a later unbind of the replaced connection is a no-op.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    by_user: HashMap<UserId, ConnectionId>,
    by_conn: HashMap<ConnectionId, UserId>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, user_id: &str, conn: ConnectionId) {
        if let Some(previous) = self.by_user.insert(user_id.to_owned(), conn) {
            if previous != conn {
                self.by_conn.remove(&previous);
            }
        }
        if let Some(old_user) = self.by_conn.insert(conn, user_id.to_owned()) {
            if old_user != user_id {
                self.by_user.remove(&old_user);
            }
        }
    }

    /// Removes the entry bound to `conn`, returning the user that went offline.
    pub fn unbind(&mut self, conn: ConnectionId) -> Option<UserId> {
        let user_id = self.by_conn.remove(&conn)?;
        self.by_user.remove(&user_id);
        Some(user_id)
    }

    /// Drops a user's entry regardless of which connection holds it.
    pub fn remove_user(&mut self, user_id: &str) -> Option<ConnectionId> {
        let conn = self.by_user.remove(user_id)?;
        self.by_conn.remove(&conn);
        Some(conn)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.by_user.contains_key(user_id)
    }

    pub fn connection_of(&self, user_id: &str) -> Option<ConnectionId> {
        self.by_user.get(user_id).copied()
    }

    pub fn snapshot_online_ids(&self) -> HashSet<UserId> {
        self.by_user.keys().cloned().collect()
    }
}
