use chrono::Utc;
use serde_json::Value;

use crate::{
    model::{Draft, RosterEntry, User, UserId},
    protocol::{ClientEvent, JoinPayload, LoginNotification, SendPayload, ServerEvent, StatusUpdate},
};

use super::{
    connections::{Connections, Identity, Outbox},
    ConnectionId, Directory, MessageLog, PresenceRegistry,
};

/// A `user_join` with its Identity Store lookups already done.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub identity: Identity,
    /// Fresh roster, when the store could be read.
    pub users: Option<Vec<User>>,
}

impl Arrival {
    /// The stored record wins over what the client claims, when there is one.
    pub async fn resolve(directory: &dyn Directory, join: JoinPayload) -> Arrival {
        let identity = match directory.find(&join.id).await {
            Ok(Some(user)) => Identity {
                user_id: user.id,
                username: user.username,
                role: user.role,
                verified: true,
            },
            Ok(None) => Arrival::claimed(join),
            Err(err) => {
                tracing::warn!(user_id = %join.id, error = %err, "identity lookup failed, trusting announcement");
                Arrival::claimed(join)
            }
        };

        let users = match directory.roster().await {
            Ok(users) => Some(users),
            Err(err) => {
                tracing::error!(error = %err, "failed to load roster");
                None
            }
        };
        Arrival { identity, users }
    }

    fn claimed(join: JoinPayload) -> Identity {
        Identity {
            user_id: join.id,
            username: join.username,
            role: join.role,
            verified: false,
        }
    }
}

/// An admin's delete, accepted by the router and waiting on the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    pub target: UserId,
    pub by: UserId,
}

/// Protocol state machine tying connection lifecycle events to presence,
/// the message log and outbound fan-out.
///
/// A connection is Unidentified until it sends `user_join`, Identified
/// afterwards, and Closed once [`Router::disconnect`] has run. All methods
/// take `&mut self` and never wait: the owner serializes every call, and
/// Identity Store work happens before ([`Arrival`]) or after ([`Removal`]).
#[derive(Default)]
pub struct Router {
    presence: PresenceRegistry,
    log: MessageLog,
    connections: Connections,
    users: Vec<User>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn connect(&mut self, conn: ConnectionId, outbox: Outbox) {
        tracing::debug!(%conn, "connection opened");
        self.connections.insert(conn, outbox);
    }

    /// Applies one client event. A returned [`Removal`] still has to be
    /// committed to the store and reported back through [`Router::user_removed`].
    pub fn handle(&mut self, conn: ConnectionId, event: ClientEvent) -> Option<Removal> {
        if !self.connections.contains(conn) {
            tracing::debug!(%conn, event = event.name(), "event for closed connection ignored");
            return None;
        }

        match event {
            ClientEvent::UserJoin(join) => {
                let identity = Arrival::claimed(join);
                self.announce(conn, Arrival { identity, users: None });
            }
            ClientEvent::SendMessage(payload) => {
                if let Some(identity) = self.identified(conn, "send_message") {
                    self.send(&identity, payload);
                }
            }
            ClientEvent::UserTyping(indicator) => {
                if self.identified(conn, "user_typing").is_some() {
                    self.typing(conn, indicator);
                }
            }
            ClientEvent::DeleteUser(target) => {
                let identity = self.identified(conn, "delete_user")?;
                return self.delete_user(conn, &identity, target);
            }
        }
        None
    }

    fn identified(&self, conn: ConnectionId, event: &'static str) -> Option<Identity> {
        let identity = self.connections.identity(conn).cloned();
        if identity.is_none() {
            tracing::warn!(%conn, event, "event before user_join dropped");
        }
        identity
    }

    pub fn announce(&mut self, conn: ConnectionId, arrival: Arrival) {
        if !self.connections.contains(conn) {
            tracing::debug!(%conn, "user_join for closed connection ignored");
            return;
        }
        let Arrival { identity, users } = arrival;
        if let Some(users) = users {
            self.users = users;
        }
        let user_id = identity.user_id.clone();

        if let Some(previous) = self.connections.identify(conn, identity.clone()) {
            if previous.user_id != user_id {
                if let Some(released) = self.presence.unbind(conn) {
                    self.broadcast_status(released, false);
                }
            }
        }
        self.presence.bind(&user_id, conn);

        self.connections
            .send_to(conn, &ServerEvent::LoadMessages(self.log.all().to_vec()));
        self.connections.broadcast(&ServerEvent::LoadUsers(self.roster()));
        self.broadcast_status(user_id.clone(), true);

        if !identity.role.is_admin() {
            self.connections
                .broadcast(&ServerEvent::UserLoginNotification(LoginNotification {
                    message: format!("{} has logged in and is ready to chat!", identity.username),
                    username: identity.username.clone(),
                    user_id: user_id.clone(),
                    timestamp: Utc::now(),
                }));
        }

        tracing::info!(
            %conn,
            %user_id,
            username = %identity.username,
            role = %identity.role,
            verified = identity.verified,
            "user joined"
        );
    }

    fn send(&mut self, identity: &Identity, payload: SendPayload) {
        let SendPayload { text, media, recipient_id, sender, sender_role } = payload;

        let stored = self
            .log
            .append(Draft {
                text: text.unwrap_or_default(),
                media,
                sender_id: sender.unwrap_or_else(|| identity.user_id.clone()),
                recipient_id,
                sender_role: sender_role.unwrap_or_default(),
                ..Default::default()
            })
            .clone();
        tracing::info!(
            id = %stored.id,
            sender_id = %stored.sender_id,
            recipient_id = %stored.recipient_id,
            total = self.log.len(),
            "message stored"
        );

        self.connections.broadcast(&ServerEvent::ReceiveMessage(stored));
    }

    fn typing(&self, conn: ConnectionId, indicator: Value) {
        self.connections
            .broadcast_except(conn, &ServerEvent::UserTyping(indicator));
    }

    fn delete_user(&mut self, conn: ConnectionId, identity: &Identity, target: UserId) -> Option<Removal> {
        if !identity.is_admin() {
            tracing::warn!(
                %conn,
                user_id = %identity.user_id,
                verified = identity.verified,
                %target,
                "delete_user without a stored admin record rejected"
            );
            return None;
        }
        Some(Removal { target, by: identity.user_id.clone() })
    }

    /// The store has dropped the user: take them offline and tell everyone.
    pub fn user_removed(&mut self, removal: Removal) {
        let Removal { target, by } = removal;
        self.presence.remove_user(&target);
        self.users.retain(|user| user.id != target);
        self.connections.broadcast(&ServerEvent::UserDeleted(target.clone()));

        tracing::info!(%target, %by, "user deleted");
    }

    pub fn disconnect(&mut self, conn: ConnectionId) {
        let identity = self.connections.remove(conn);

        // only the connection that currently holds the binding takes the user offline
        match self.presence.unbind(conn) {
            Some(user_id) => {
                tracing::info!(%conn, %user_id, "user disconnected");
                self.broadcast_status(user_id, false);
            }
            None => match identity {
                Some(identity) => {
                    tracing::debug!(%conn, user_id = %identity.user_id, "stale connection closed")
                }
                None => tracing::debug!(%conn, "unidentified connection closed"),
            },
        }
    }

    /// Every known user annotated with presence, as of the latest join.
    pub fn roster(&self) -> Vec<RosterEntry> {
        self.users
            .iter()
            .map(|user| RosterEntry {
                online: self.presence.is_online(&user.id),
                user: user.clone(),
            })
            .collect()
    }

    fn broadcast_status(&self, user_id: UserId, online: bool) {
        self.connections
            .broadcast(&ServerEvent::UserStatusUpdate(StatusUpdate { user_id, online }));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::{
        broker::connections::Frame,
        model::Role,
        protocol,
    };

    use super::*;

    #[derive(Default)]
    struct StubDirectory {
        users: Mutex<HashMap<UserId, User>>,
    }

    impl StubDirectory {
        fn with(users: &[(&str, &str, Role)]) -> Arc<Self> {
            let dir = Self::default();
            for (id, name, role) in users {
                dir.users.lock().unwrap().insert(
                    id.to_string(),
                    User {
                        id: id.to_string(),
                        username: name.to_string(),
                        email: format!("{id}@ypa.com"),
                        role: *role,
                        profile_picture: None,
                    },
                );
            }
            Arc::new(dir)
        }
    }

    #[async_trait]
    impl Directory for StubDirectory {
        async fn roster(&self) -> anyhow::Result<Vec<User>> {
            let mut users: Vec<_> = self.users.lock().unwrap().values().cloned().collect();
            users.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(users)
        }

        async fn find(&self, id: &str) -> anyhow::Result<Option<User>> {
            Ok(self.users.lock().unwrap().get(id).cloned())
        }

        async fn remove(&self, id: &str) -> anyhow::Result<bool> {
            Ok(self.users.lock().unwrap().remove(id).is_some())
        }
    }

    struct Client {
        conn: ConnectionId,
        rx: mpsc::Receiver<Frame>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                events.push(serde_json::from_str(frame.as_str()).unwrap());
            }
            events
        }
    }

    static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1000);

    fn open(router: &mut Router) -> Client {
        let conn = ConnectionId::from_raw(NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(64);
        router.connect(conn, tx);
        Client { conn, rx }
    }

    fn join(id: &str, role: Role) -> ClientEvent {
        ClientEvent::UserJoin(JoinPayload { id: id.into(), username: id.into(), role })
    }

    fn say(text: &str, to: &str) -> ClientEvent {
        protocol::decode(&json!({"event": "send_message", "data": {"text": text, "recipientId": to}}).to_string()).unwrap()
    }

    fn names(events: &[ServerEvent]) -> Vec<&'static str> {
        events.iter().map(ServerEvent::name).collect()
    }

    /// A router plus the store lookups the broker does around it.
    struct Relay {
        router: Router,
        directory: Arc<StubDirectory>,
    }

    impl Relay {
        async fn handle(&mut self, conn: ConnectionId, event: ClientEvent) {
            match event {
                ClientEvent::UserJoin(join) => {
                    let arrival = Arrival::resolve(self.directory.as_ref(), join).await;
                    self.router.announce(conn, arrival);
                }
                event => {
                    if let Some(removal) = self.router.handle(conn, event) {
                        self.directory.remove(&removal.target).await.unwrap();
                        self.router.user_removed(removal);
                    }
                }
            }
        }
    }

    fn relay() -> Relay {
        Relay {
            router: Router::new(),
            directory: StubDirectory::with(&[
                ("admin1", "Admin", Role::Admin),
                ("user1", "John Doe", Role::Member),
            ]),
        }
    }

    #[tokio::test]
    async fn join_replays_history_then_roster() {
        let mut relay = relay();
        let mut user1 = open(&mut relay.router);

        relay.handle(user1.conn, join("user1", Role::Member)).await;

        let events = user1.drain();
        assert_eq!(
            names(&events),
            ["load_messages", "load_users", "user_status_update", "user_login_notification"]
        );
        assert_eq!(events[0], ServerEvent::LoadMessages(vec![]));
        let ServerEvent::LoadUsers(roster) = &events[1] else { unreachable!() };
        let user1_entry = roster.iter().find(|e| e.user.id == "user1").unwrap();
        assert!(user1_entry.online);
        assert!(!roster.iter().find(|e| e.user.id == "admin1").unwrap().online);
        let ServerEvent::UserLoginNotification(note) = &events[3] else { unreachable!() };
        assert_eq!(note.username, "John Doe");
        assert_eq!(note.user_id, "user1");
    }

    #[tokio::test]
    async fn admin_join_sends_no_login_notification() {
        let mut relay = relay();
        let mut admin = open(&mut relay.router);
        let mut other = open(&mut relay.router);

        relay.handle(admin.conn, join("admin1", Role::Admin)).await;

        assert!(!names(&admin.drain()).contains(&"user_login_notification"));
        assert_eq!(names(&other.drain()), ["load_users", "user_status_update"]);
    }

    #[tokio::test]
    async fn stored_role_overrides_announced_role() {
        let mut relay = relay();
        let mut user1 = open(&mut relay.router);

        relay.handle(user1.conn, join("user1", Role::Admin)).await;
        user1.drain();
        relay.handle(user1.conn, ClientEvent::DeleteUser("admin1".into())).await;

        assert!(user1.drain().is_empty());
        assert!(relay.router.roster().iter().any(|e| e.user.id == "admin1"));
    }

    #[tokio::test]
    async fn send_is_logged_and_broadcast_to_everyone() {
        let mut relay = relay();
        let mut user1 = open(&mut relay.router);
        let mut admin = open(&mut relay.router);
        let mut bystander = open(&mut relay.router);
        relay.handle(user1.conn, join("user1", Role::Member)).await;
        relay.handle(admin.conn, join("admin1", Role::Admin)).await;
        for client in [&mut user1, &mut admin, &mut bystander] {
            client.drain();
        }

        relay.handle(user1.conn, say("hi", "admin1")).await;

        let stored = relay.router.log().all();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sender_id, "user1");
        assert_eq!(stored[0].recipient_id, "admin1");
        assert_eq!(stored[0].text, "hi");
        assert_eq!(stored[0].sender_role, Role::Member);

        let expected = ServerEvent::ReceiveMessage(stored[0].clone());
        for client in [&mut user1, &mut admin, &mut bystander] {
            assert_eq!(client.drain(), vec![expected.clone()]);
        }
    }

    #[tokio::test]
    async fn later_joiner_gets_full_history() {
        let mut relay = relay();
        let mut user1 = open(&mut relay.router);
        relay.handle(user1.conn, join("user1", Role::Member)).await;
        relay.handle(user1.conn, say("one", "admin1")).await;
        relay.handle(user1.conn, say("two", "admin1")).await;
        user1.drain();

        let mut admin = open(&mut relay.router);
        relay.handle(admin.conn, join("admin1", Role::Admin)).await;

        let ServerEvent::LoadMessages(history) = &admin.drain()[0] else {
            panic!("replay must come first");
        };
        assert_eq!(history.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(), ["one", "two"]);
        assert!(!names(&user1.drain()).contains(&"load_messages"));
    }

    #[tokio::test]
    async fn events_before_join_are_dropped() {
        let mut relay = relay();
        let mut anon = open(&mut relay.router);
        let mut watcher = open(&mut relay.router);

        relay.handle(anon.conn, say("hi", "admin1")).await;
        relay.handle(anon.conn, ClientEvent::DeleteUser("user1".into())).await;

        assert!(relay.router.log().is_empty());
        assert!(anon.drain().is_empty());
        assert!(watcher.drain().is_empty());
    }

    #[tokio::test]
    async fn typing_skips_the_sender() {
        let mut relay = relay();
        let mut user1 = open(&mut relay.router);
        let mut admin = open(&mut relay.router);
        relay.handle(user1.conn, join("user1", Role::Member)).await;
        relay.handle(admin.conn, join("admin1", Role::Admin)).await;
        user1.drain();
        admin.drain();

        let indicator = json!({"userId": "user1", "typing": true});
        relay.handle(user1.conn, ClientEvent::UserTyping(indicator.clone())).await;

        assert!(user1.drain().is_empty());
        assert_eq!(admin.drain(), vec![ServerEvent::UserTyping(indicator)]);
        assert!(relay.router.log().is_empty());
    }

    #[tokio::test]
    async fn admin_delete_keeps_messages() {
        let mut relay = relay();
        let mut user1 = open(&mut relay.router);
        let mut admin = open(&mut relay.router);
        relay.handle(user1.conn, join("user1", Role::Member)).await;
        relay.handle(admin.conn, join("admin1", Role::Admin)).await;
        relay.handle(user1.conn, say("bye", "admin1")).await;
        user1.drain();
        admin.drain();

        relay.handle(admin.conn, ClientEvent::DeleteUser("user1".into())).await;

        assert!(!relay.router.presence().is_online("user1"));
        assert_eq!(admin.drain(), vec![ServerEvent::UserDeleted("user1".into())]);
        assert_eq!(user1.drain(), vec![ServerEvent::UserDeleted("user1".into())]);
        assert_eq!(relay.router.log().all()[0].sender_id, "user1");
        assert!(relay.router.roster().iter().all(|e| e.user.id != "user1"));

        // the deleted user's socket closing later is not a presence change
        relay.router.disconnect(user1.conn);
        assert!(admin.drain().is_empty());
    }

    #[tokio::test]
    async fn member_cannot_delete() {
        let mut relay = relay();
        let mut user1 = open(&mut relay.router);
        relay.handle(user1.conn, join("user1", Role::Member)).await;
        user1.drain();

        relay.handle(user1.conn, ClientEvent::DeleteUser("admin1".into())).await;

        assert!(user1.drain().is_empty());
        assert_eq!(relay.router.roster().len(), 2);
    }

    #[tokio::test]
    async fn stale_duplicate_disconnect_is_silent() {
        let mut relay = relay();
        let mut first = open(&mut relay.router);
        let mut second = open(&mut relay.router);
        relay.handle(first.conn, join("dup1", Role::Member)).await;
        relay.handle(second.conn, join("dup1", Role::Member)).await;
        first.drain();
        second.drain();
        assert_eq!(relay.router.presence().connection_of("dup1"), Some(second.conn));

        relay.router.disconnect(first.conn);
        assert!(relay.router.presence().is_online("dup1"));
        assert!(second.drain().is_empty());

        let mut watcher = open(&mut relay.router);
        relay.router.disconnect(second.conn);
        assert!(!relay.router.presence().is_online("dup1"));
        assert_eq!(
            watcher.drain(),
            vec![ServerEvent::UserStatusUpdate(StatusUpdate { user_id: "dup1".into(), online: false })]
        );
    }

    #[tokio::test]
    async fn reannounce_releases_previous_identity() {
        let mut relay = relay();
        let conn = open(&mut relay.router);
        let mut watcher = open(&mut relay.router);
        relay.handle(conn.conn, join("user1", Role::Member)).await;
        watcher.drain();

        relay.handle(conn.conn, join("user2", Role::Member)).await;

        assert!(!relay.router.presence().is_online("user1"));
        assert!(relay.router.presence().is_online("user2"));
        assert_eq!(
            watcher.drain()[0],
            ServerEvent::UserStatusUpdate(StatusUpdate { user_id: "user1".into(), online: false })
        );
    }

    #[tokio::test]
    async fn disconnect_twice_is_noop() {
        let mut relay = relay();
        let user1 = open(&mut relay.router);
        let mut watcher = open(&mut relay.router);
        relay.handle(user1.conn, join("user1", Role::Member)).await;
        watcher.drain();

        relay.router.disconnect(user1.conn);
        relay.router.disconnect(user1.conn);

        assert_eq!(watcher.drain().len(), 1);
        relay.handle(user1.conn, say("ghost", "admin1")).await;
        assert!(relay.router.log().is_empty());
    }

    #[tokio::test]
    async fn unknown_id_claiming_admin_cannot_delete() {
        let mut relay = relay();
        let mut user1 = open(&mut relay.router);
        let mut ghost = open(&mut relay.router);
        relay.handle(user1.conn, join("user1", Role::Member)).await;
        relay.handle(ghost.conn, join("ghost", Role::Admin)).await;
        user1.drain();
        ghost.drain();

        assert_eq!(relay.router.handle(ghost.conn, ClientEvent::DeleteUser("user1".into())), None);

        assert!(user1.drain().is_empty());
        assert!(ghost.drain().is_empty());
        assert!(relay.router.presence().is_online("user1"));
        assert!(relay.directory.find("user1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stored_admin_delete_waits_for_the_store() {
        let mut relay = relay();
        let mut admin = open(&mut relay.router);
        relay.handle(admin.conn, join("admin1", Role::Admin)).await;
        admin.drain();

        let removal = relay.router.handle(admin.conn, ClientEvent::DeleteUser("user1".into()));
        assert_eq!(removal, Some(Removal { target: "user1".into(), by: "admin1".into() }));
        // nothing is announced until the store confirms
        assert!(admin.drain().is_empty());
    }
}
