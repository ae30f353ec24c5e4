//! Wire vocabulary of the live channel.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": <payload>}`. Inbound
//! payloads are read leniently: optional fields default instead of rejecting
//! the frame. A frame that cannot be read at all becomes a [`TransportError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{Media, Message, Role, RosterEntry, UserId};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("undecodable frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("binary frame is not utf-8")]
    NotUtf8(#[from] std::str::Utf8Error),
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    UserJoin(JoinPayload),
    SendMessage(SendPayload),
    UserTyping(Value),
    DeleteUser(UserId),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::UserJoin(_) => "user_join",
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::UserTyping(_) => "user_typing",
            ClientEvent::DeleteUser(_) => "delete_user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JoinPayload {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPayload {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<Media>,
    pub recipient_id: UserId,
    #[serde(default)]
    pub sender: Option<UserId>,
    #[serde(default)]
    pub sender_role: Option<Role>,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    LoadMessages(Vec<Message>),
    LoadUsers(Vec<RosterEntry>),
    ReceiveMessage(Message),
    UserStatusUpdate(StatusUpdate),
    UserLoginNotification(LoginNotification),
    UserDeleted(UserId),
    UserTyping(Value),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::LoadMessages(_) => "load_messages",
            ServerEvent::LoadUsers(_) => "load_users",
            ServerEvent::ReceiveMessage(_) => "receive_message",
            ServerEvent::UserStatusUpdate(_) => "user_status_update",
            ServerEvent::UserLoginNotification(_) => "user_login_notification",
            ServerEvent::UserDeleted(_) => "user_deleted",
            ServerEvent::UserTyping(_) => "user_typing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub user_id: UserId,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginNotification {
    pub message: String,
    pub username: String,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
}

pub fn decode(frame: &str) -> Result<ClientEvent, TransportError> {
    Ok(serde_json::from_str(frame)?)
}

pub fn decode_bytes(frame: &[u8]) -> Result<ClientEvent, TransportError> {
    decode(std::str::from_utf8(frame)?)
}

pub fn encode(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
