use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::serde_utils::{deserialize_id, deserialize_opt_id};
use crate::types::{OrderStatus, PaymentStatus};

/// One JSON text frame on the push channel, in either direction.
///
/// Frames carrying `ack` belong to a request/acknowledgement exchange; every
/// other inbound frame is a push event.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Server-assigned event identity, used for de-duplication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) const ACK_EVENT: &str = "ack";
pub(crate) const PING_EVENT: &str = "ping";
pub(crate) const PONG_EVENT: &str = "pong";

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            id: None,
            ack: None,
            error: None,
        }
    }

    pub(crate) fn ping() -> Self {
        Self::new(PING_EVENT, Value::Null)
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.event == ACK_EVENT && self.ack.is_some()
    }

    pub(crate) fn is_pong(&self) -> bool {
        self.event == PONG_EVENT
    }
}

/// Inbound push event as delivered to listeners: raw name plus untyped
/// payload. Typing and validation happen in the router.
#[derive(Clone, Debug, PartialEq)]
pub struct PushEvent {
    pub name: String,
    pub data: Value,
    pub id: Option<String>,
}

impl PushEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl From<Frame> for PushEvent {
    fn from(frame: Frame) -> Self {
        Self {
            name: frame.event,
            data: frame.data,
            id: frame.id,
        }
    }
}

/// Events the client sends.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundEvent {
    #[serde(rename_all = "camelCase")]
    JoinOrder { order_id: String },
    #[serde(rename_all = "camelCase")]
    JoinChat { chat_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveContext { room: String },
    #[serde(rename_all = "camelCase")]
    Typing { chat_id: String, user_id: String },
    #[serde(rename_all = "camelCase")]
    StopTyping { chat_id: String, user_id: String },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        chat_id: String,
        receiver_id: String,
        body: String,
        nonce: String,
    },
}

impl OutboundEvent {
    /// Room name for join events, `None` for everything else.
    pub fn room(&self) -> Option<String> {
        match self {
            OutboundEvent::JoinOrder { order_id } => Some(format!("order:{order_id}")),
            OutboundEvent::JoinChat { chat_id } => Some(format!("chat:{chat_id}")),
            _ => None,
        }
    }

    /// Matching leave event for a join.
    pub fn leave(&self) -> Option<OutboundEvent> {
        self.room().map(|room| OutboundEvent::LeaveContext { room })
    }

    pub(crate) fn into_frame(self, ack: Option<u64>) -> crate::prelude::Result<Frame> {
        let value = serde_json::to_value(&self).map_err(|e| crate::Error::JsonParse(e.to_string()))?;
        let mut frame: Frame =
            serde_json::from_value(value).map_err(|e| crate::Error::JsonParse(e.to_string()))?;
        frame.ack = ack;
        Ok(frame)
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusPayload {
    #[serde(alias = "_id", alias = "id", deserialize_with = "deserialize_id")]
    pub order_id: String,
    #[serde(alias = "orderStatus", alias = "newStatus")]
    pub status: OrderStatus,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusPayload {
    #[serde(alias = "_id", alias = "id", deserialize_with = "deserialize_id")]
    pub order_id: String,
    #[serde(alias = "status")]
    pub payment_status: PaymentStatus,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadPayload {
    #[serde(alias = "roomId", deserialize_with = "deserialize_id")]
    pub chat_id: String,
    #[serde(default)]
    pub message_ids: Vec<String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    #[serde(alias = "roomId", deserialize_with = "deserialize_id")]
    pub chat_id: String,
    #[serde(default, alias = "sender", deserialize_with = "deserialize_opt_id")]
    pub user_id: String,
}
