//! The broker: presence, message history and routing, owned by one task.
//!
//! The gateway and HTTP handlers hold a cloneable [`Broker`] handle and talk
//! to the task over a command channel. Commands run one at a time, so two
//! `send_message` events are always appended in a single global order.
//! The task never waits on the Identity Store: joins are looked up by the
//! submitting connection, and deletes are committed by a spawned task that
//! reports back with another command.

mod connections;
mod log;
mod presence;
mod router;

use std::{collections::HashSet, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    model::{Message, User, UserId},
    protocol::ClientEvent,
};

pub use connections::{ConnectionId, Frame, Identity, Outbox};
pub use log::MessageLog;
pub use presence::PresenceRegistry;
pub use router::{Arrival, Removal, Router};

/// The slice of the Identity Store the broker consults.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Every known user.
    async fn roster(&self) -> anyhow::Result<Vec<User>>;
    async fn find(&self, id: &str) -> anyhow::Result<Option<User>>;
    /// Returns whether a record was removed.
    async fn remove(&self, id: &str) -> anyhow::Result<bool>;
}

enum Command {
    Connect { conn: ConnectionId, outbox: Outbox },
    Announce { conn: ConnectionId, arrival: Arrival },
    Inbound { conn: ConnectionId, event: ClientEvent },
    Removed(Removal),
    Disconnect { conn: ConnectionId },
    History { reply: oneshot::Sender<Vec<Message>> },
    Conversation { a: UserId, b: UserId, reply: oneshot::Sender<Vec<Message>> },
    Online { reply: oneshot::Sender<HashSet<UserId>> },
}

#[derive(Clone)]
pub struct Broker {
    tx: mpsc::UnboundedSender<Command>,
    directory: Arc<dyn Directory>,
}

impl Broker {
    pub fn spawn(directory: Arc<dyn Directory>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(Router::new(), directory.clone(), tx.downgrade(), rx));
        (Self { tx, directory }, task)
    }

    pub fn connect(&self, conn: ConnectionId, outbox: Outbox) {
        self.submit(Command::Connect { conn, outbox });
    }

    /// Submits a client event. A `user_join` is resolved against the
    /// Identity Store first, on the caller's task, so a later frame from the
    /// same connection can't overtake it.
    pub async fn inbound(&self, conn: ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::UserJoin(join) => {
                let arrival = Arrival::resolve(self.directory.as_ref(), join).await;
                self.submit(Command::Announce { conn, arrival });
            }
            event => self.submit(Command::Inbound { conn, event }),
        }
    }

    pub fn disconnect(&self, conn: ConnectionId) {
        self.submit(Command::Disconnect { conn });
    }

    /// Full message history in append order.
    pub async fn history(&self) -> anyhow::Result<Vec<Message>> {
        self.ask(|reply| Command::History { reply }).await
    }

    /// Messages exchanged between `a` and `b` in either direction.
    pub async fn conversation(&self, a: UserId, b: UserId) -> anyhow::Result<Vec<Message>> {
        self.ask(|reply| Command::Conversation { a, b, reply }).await
    }

    pub async fn online(&self) -> anyhow::Result<HashSet<UserId>> {
        self.ask(|reply| Command::Online { reply }).await
    }

    fn submit(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::error!("broker task is gone, command dropped");
        }
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> anyhow::Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| anyhow!("broker task is gone"))?;
        Ok(rx.await?)
    }
}

async fn run(
    mut router: Router,
    directory: Arc<dyn Directory>,
    feedback: mpsc::WeakUnboundedSender<Command>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    tracing::debug!("broker started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Connect { conn, outbox } => router.connect(conn, outbox),
            Command::Announce { conn, arrival } => router.announce(conn, arrival),
            Command::Inbound { conn, event } => {
                if let Some(removal) = router.handle(conn, event) {
                    tokio::spawn(commit_removal(directory.clone(), feedback.clone(), removal));
                }
            }
            Command::Removed(removal) => router.user_removed(removal),
            Command::Disconnect { conn } => router.disconnect(conn),
            Command::History { reply } => {
                let _ = reply.send(router.log().all().to_vec());
            }
            Command::Conversation { a, b, reply } => {
                let _ = reply.send(router.log().for_pair(&a, &b).cloned().collect());
            }
            Command::Online { reply } => {
                let _ = reply.send(router.presence().snapshot_online_ids());
            }
        }
    }

    tracing::debug!("broker stopped");
}

async fn commit_removal(
    directory: Arc<dyn Directory>,
    feedback: mpsc::WeakUnboundedSender<Command>,
    removal: Removal,
) {
    match directory.remove(&removal.target).await {
        Ok(found) => {
            if !found {
                tracing::debug!(user_id = %removal.target, "deleted user had no stored record");
            }
            match feedback.upgrade() {
                Some(tx) => {
                    let _ = tx.send(Command::Removed(removal));
                }
                None => tracing::debug!(user_id = %removal.target, "broker stopped before delete completed"),
            }
        }
        Err(err) => tracing::error!(user_id = %removal.target, error = %err, "failed to delete user"),
    }
}
