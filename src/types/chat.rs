//! Chat-related types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consts::PROVISIONAL_PREFIX;
use crate::serde_utils::{deserialize_id, deserialize_opt_id};
use crate::sync::Entity;

/// Delivery status of a chat message.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Inserted locally, not yet acknowledged by the server
    Sending,
    #[default]
    Sent,
    Read,
}

/// A chat message.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(alias = "_id", alias = "messageId", deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, alias = "roomId", deserialize_with = "deserialize_opt_id")]
    pub chat_id: String,
    #[serde(default, alias = "sender", deserialize_with = "deserialize_opt_id")]
    pub sender_id: String,
    #[serde(default, alias = "receiver", deserialize_with = "deserialize_opt_id")]
    pub receiver_id: String,
    #[serde(alias = "message", alias = "content", alias = "text")]
    pub body: String,
    #[serde(default, alias = "createdAt", alias = "timestamp")]
    pub sent_at: Option<DateTime<Utc>>,
    /// Client correlation key echoed back by the server.
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl ChatMessage {
    /// Build a locally displayed message with a provisional identifier.
    ///
    /// The nonce doubles as the correlation key; the server echoes it on the
    /// stored message so the provisional copy can be swapped for the real one.
    pub fn provisional(
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let nonce = uuid::Uuid::new_v4().to_string();
        Self {
            id: format!("{PROVISIONAL_PREFIX}{nonce}"),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            body: body.into(),
            sent_at: Some(Utc::now()),
            nonce: Some(nonce),
            status: MessageStatus::Sending,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.id.starts_with(PROVISIONAL_PREFIX)
    }
}

impl Entity for ChatMessage {
    type Status = MessageStatus;
    const KIND: &'static str = "chat_message";

    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> MessageStatus {
        self.status
    }

    fn correlation_key(&self) -> Option<&str> {
        self.nonce.as_deref()
    }
}

/// Body of a send-message request.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub chat_id: String,
    pub receiver_id: String,
    pub body: String,
    pub nonce: String,
}

impl SendMessageRequest {
    pub fn from_provisional(message: &ChatMessage) -> Self {
        Self {
            chat_id: message.chat_id.clone(),
            receiver_id: message.receiver_id.clone(),
            body: message.body.clone(),
            nonce: message.nonce.clone().unwrap_or_default(),
        }
    }
}

/// A participant listed by the chat-user endpoint.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatUser {
    #[serde(alias = "_id", deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, alias = "username")]
    pub name: String,
    #[serde(default, alias = "isOnline")]
    pub online: bool,
}
