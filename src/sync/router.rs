//! Push event routing.
//!
//! Raw event names are resolved to a [`CanonicalEvent`] through a declarative
//! [`AliasTable`], payloads are validated by typed deserialization, and the
//! result is applied through the owning [`Reconciler`](super::Reconciler).
//! Unknown or malformed events are logged and dropped.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::dedup::RecencySet;
use super::entity::ApplyOutcome;
use super::notify::Notification;
use super::reconcile::{lock, SharedReconciler};
use crate::logging::targets;
use crate::prelude::Result;
use crate::types::{ChatMessage, MessageStatus, Order};
use crate::ws::{
    MessageReadPayload, OrderStatusPayload, PaymentStatusPayload, PushEvent, TypingPayload,
};
use crate::Error;

/// Logical event kinds, independent of the backend's naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalEvent {
    OrderStatusChanged,
    PaymentStatusChanged,
    OrderUpdated,
    NewChatMessage,
    MessageRead,
    TypingStarted,
    TypingStopped,
}

impl CanonicalEvent {
    pub const ALL: [CanonicalEvent; 7] = [
        CanonicalEvent::OrderStatusChanged,
        CanonicalEvent::PaymentStatusChanged,
        CanonicalEvent::OrderUpdated,
        CanonicalEvent::NewChatMessage,
        CanonicalEvent::MessageRead,
        CanonicalEvent::TypingStarted,
        CanonicalEvent::TypingStopped,
    ];

    /// Raw names the backend is known to use for this event.
    pub fn default_aliases(self) -> &'static [&'static str] {
        match self {
            CanonicalEvent::OrderStatusChanged => {
                &["orderStatusUpdated", "statusUpdated", "orderStatusChanged"]
            }
            CanonicalEvent::PaymentStatusChanged => &["paymentStatusUpdated", "paymentUpdated"],
            CanonicalEvent::OrderUpdated => &["orderUpdated", "orderCreated"],
            CanonicalEvent::NewChatMessage => &["newMessage", "receiveMessage", "messageReceived"],
            CanonicalEvent::MessageRead => &["messageRead", "messagesRead"],
            CanonicalEvent::TypingStarted => &["typing", "userTyping"],
            CanonicalEvent::TypingStopped => &["stopTyping", "userStoppedTyping"],
        }
    }
}

/// Raw event name → canonical event.
#[derive(Debug, Clone)]
pub struct AliasTable {
    by_raw: HashMap<String, CanonicalEvent>,
}

impl AliasTable {
    pub fn empty() -> Self {
        Self {
            by_raw: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        for canonical in CanonicalEvent::ALL {
            for raw in canonical.default_aliases() {
                table.by_raw.insert((*raw).to_string(), canonical);
            }
        }
        table
    }

    /// Bind `raw` to `canonical`. A name may map to only one canonical event.
    pub fn add(&mut self, canonical: CanonicalEvent, raw: impl Into<String>) -> Result<()> {
        let raw = raw.into();
        match self.by_raw.get(&raw) {
            Some(existing) if *existing != canonical => Err(Error::Config(format!(
                "event alias {raw} already bound to {existing:?}"
            ))),
            _ => {
                self.by_raw.insert(raw, canonical);
                Ok(())
            }
        }
    }

    pub fn resolve(&self, raw: &str) -> Option<CanonicalEvent> {
        self.by_raw.get(raw).copied()
    }

    /// Raw names bound to `canonical`, sorted.
    pub fn raw_names(&self, canonical: CanonicalEvent) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .by_raw
            .iter()
            .filter(|(_, c)| **c == canonical)
            .map(|(raw, _)| raw.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum remembered message identities (default: 2048)
    pub dedup_capacity: usize,
    /// How long an identity is remembered (default: 10min)
    pub dedup_retention: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 2048,
            dedup_retention: Duration::from_secs(600),
        }
    }
}

/// A push event after name resolution and payload validation.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedEvent {
    OrderStatus(OrderStatusPayload),
    PaymentStatus(PaymentStatusPayload),
    Order(Box<Order>),
    Message(Box<ChatMessage>),
    MessagesRead(MessageReadPayload),
    Typing { payload: TypingPayload, active: bool },
}

/// Stores a context routes into. Absent stores make their events no-ops.
#[derive(Clone, Default)]
pub struct RouteTargets {
    pub orders: Option<SharedReconciler<Order>>,
    pub messages: Option<SharedReconciler<ChatMessage>>,
}

/// Who is typing in which chat. Ephemeral: never persisted or polled.
#[derive(Debug, Default)]
pub struct TypingState {
    by_chat: HashMap<String, BTreeSet<String>>,
}

impl TypingState {
    /// Returns whether the state changed.
    pub fn set(&mut self, chat_id: &str, user_id: &str, active: bool) -> bool {
        if active {
            self.by_chat
                .entry(chat_id.to_string())
                .or_default()
                .insert(user_id.to_string())
        } else {
            let Some(users) = self.by_chat.get_mut(chat_id) else {
                return false;
            };
            let removed = users.remove(user_id);
            if users.is_empty() {
                self.by_chat.remove(chat_id);
            }
            removed
        }
    }

    pub fn typing_in(&self, chat_id: &str) -> Vec<String> {
        self.by_chat
            .get(chat_id)
            .map(|u| u.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.by_chat.clear();
    }
}

pub struct EventRouter {
    aliases: AliasTable,
    seen: RecencySet,
    typing: TypingState,
}

impl EventRouter {
    pub fn new(aliases: AliasTable, config: &RouterConfig) -> Self {
        Self {
            aliases,
            seen: RecencySet::new(config.dedup_capacity, config.dedup_retention),
            typing: TypingState::default(),
        }
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn typing(&self) -> &TypingState {
        &self.typing
    }

    /// Resolve the event name and type its payload.
    pub fn decode(&self, event: &PushEvent) -> Result<RoutedEvent> {
        let canonical = self
            .aliases
            .resolve(&event.name)
            .ok_or_else(|| Error::UnknownEvent(event.name.clone()))?;
        let data = event.data.clone();
        let routed = match canonical {
            CanonicalEvent::OrderStatusChanged => RoutedEvent::OrderStatus(typed(event, data)?),
            CanonicalEvent::PaymentStatusChanged => RoutedEvent::PaymentStatus(typed(event, data)?),
            CanonicalEvent::OrderUpdated => {
                RoutedEvent::Order(Box::new(typed(event, unwrap_single(data, "order"))?))
            }
            CanonicalEvent::NewChatMessage => {
                RoutedEvent::Message(Box::new(typed(event, unwrap_single(data, "message"))?))
            }
            CanonicalEvent::MessageRead => RoutedEvent::MessagesRead(typed(event, data)?),
            CanonicalEvent::TypingStarted => RoutedEvent::Typing {
                payload: typed(event, data)?,
                active: true,
            },
            CanonicalEvent::TypingStopped => RoutedEvent::Typing {
                payload: typed(event, data)?,
                active: false,
            },
        };
        Ok(routed)
    }

    /// Apply one push event and return the notifications it produced.
    pub fn route(&mut self, event: &PushEvent, targets: &RouteTargets) -> Vec<Notification> {
        if let Some(id) = &event.id {
            if !self.seen.insert(&format!("event:{id}")) {
                debug!(target: targets::ROUTER, event = %event.name, %id, "Duplicate push event dropped");
                return Vec::new();
            }
        }

        let routed = match self.decode(event) {
            Ok(routed) => routed,
            Err(Error::UnknownEvent(name)) => {
                debug!(target: targets::ROUTER, event = %name, "Unrecognized push event dropped");
                return Vec::new();
            }
            Err(e) => {
                warn!(target: targets::ROUTER, event = %event.name, error = %e, "Malformed push event dropped");
                return Vec::new();
            }
        };

        match routed {
            RoutedEvent::OrderStatus(p) => {
                let Some(orders) = &targets.orders else {
                    return Vec::new();
                };
                let outcome = lock(orders).apply_server_change(
                    &p.order_id,
                    || Order::placeholder(&p.order_id),
                    |o| o.status = p.status,
                );
                order_notifications(&p.order_id, outcome, &lock(orders))
            }
            RoutedEvent::PaymentStatus(p) => {
                let Some(orders) = &targets.orders else {
                    return Vec::new();
                };
                let outcome = lock(orders).apply_server_change(
                    &p.order_id,
                    || Order::placeholder(&p.order_id),
                    |o| o.payment_status = p.payment_status,
                );
                order_notifications(&p.order_id, outcome, &lock(orders))
            }
            RoutedEvent::Order(order) => {
                let Some(orders) = &targets.orders else {
                    return Vec::new();
                };
                let id = order.id.clone();
                let mut rec = lock(orders);
                let outcome = rec.apply_server(*order);
                order_notifications(&id, outcome, &rec)
            }
            RoutedEvent::Message(message) => {
                let Some(messages) = &targets.messages else {
                    return Vec::new();
                };
                if !self.seen.insert(&format!("message:{}", message.id)) {
                    debug!(target: targets::ROUTER, id = %message.id, "Duplicate chat message dropped");
                    return Vec::new();
                }
                let chat_id = message.chat_id.clone();
                let message_id = message.id.clone();
                match lock(messages).apply_server(*message) {
                    ApplyOutcome::Inserted => vec![Notification::MessageReceived {
                        chat_id,
                        message_id,
                    }],
                    ApplyOutcome::Updated { previous } if previous.is_provisional() => {
                        vec![Notification::MessageConfirmed {
                            chat_id,
                            provisional_id: previous.id,
                            message_id,
                        }]
                    }
                    _ => Vec::new(),
                }
            }
            RoutedEvent::MessagesRead(p) => {
                let Some(messages) = &targets.messages else {
                    return Vec::new();
                };
                let mut rec = lock(messages);
                let ids: Vec<String> = if p.message_ids.is_empty() {
                    rec.store()
                        .iter()
                        .filter(|m| {
                            m.chat_id == p.chat_id
                                && m.status != MessageStatus::Read
                                && !m.is_provisional()
                        })
                        .map(|m| m.id.clone())
                        .collect()
                } else {
                    p.message_ids.clone()
                };
                let mut count = 0;
                for id in ids {
                    let Some(current) = rec.confirmed(&id).cloned() else {
                        trace!(target: targets::ROUTER, %id, "Read receipt for unknown message");
                        continue;
                    };
                    let mut read = current;
                    read.status = MessageStatus::Read;
                    if rec.apply_server(read).changed() {
                        count += 1;
                    }
                }
                if count == 0 {
                    return Vec::new();
                }
                vec![Notification::MessagesRead {
                    chat_id: p.chat_id,
                    count,
                }]
            }
            RoutedEvent::Typing { payload, active } => {
                if !self.typing.set(&payload.chat_id, &payload.user_id, active) {
                    return Vec::new();
                }
                vec![Notification::TypingChanged {
                    chat_id: payload.chat_id,
                    user_id: payload.user_id,
                    typing: active,
                }]
            }
        }
    }
}

fn typed<T: serde::de::DeserializeOwned>(event: &PushEvent, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| Error::MalformedEvent {
        event: event.name.clone(),
        reason: e.to_string(),
    })
}

/// Accept both `{"order": {...}}` and a bare object.
fn unwrap_single(data: Value, key: &str) -> Value {
    match data {
        Value::Object(mut map) if map.len() == 1 && map.contains_key(key) => {
            map.remove(key).unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn order_notifications(
    order_id: &str,
    outcome: ApplyOutcome<Order>,
    rec: &super::Reconciler<Order>,
) -> Vec<Notification> {
    let Some(current) = rec.get(order_id) else {
        return Vec::new();
    };
    match outcome {
        ApplyOutcome::Inserted => vec![Notification::OrderStatusChanged {
            order_id: order_id.to_string(),
            previous: None,
            current: current.status,
        }],
        ApplyOutcome::Updated { previous } => {
            let mut out = Vec::new();
            if previous.status != current.status {
                out.push(Notification::OrderStatusChanged {
                    order_id: order_id.to_string(),
                    previous: Some(previous.status),
                    current: current.status,
                });
            }
            if previous.payment_status != current.payment_status {
                out.push(Notification::PaymentStatusChanged {
                    order_id: order_id.to_string(),
                    current: current.payment_status,
                });
            }
            if out.is_empty() {
                out.push(Notification::OrderUpdated {
                    order_id: order_id.to_string(),
                });
            }
            out
        }
        ApplyOutcome::Unchanged | ApplyOutcome::Detached => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Reconciler;
    use crate::types::{OrderStatus, PaymentStatus};
    use serde_json::json;

    fn router() -> EventRouter {
        EventRouter::new(AliasTable::with_defaults(), &RouterConfig::default())
    }

    fn order_targets() -> (RouteTargets, SharedReconciler<Order>) {
        let orders = Reconciler::shared();
        (
            RouteTargets {
                orders: Some(orders.clone()),
                messages: None,
            },
            orders,
        )
    }

    #[test]
    fn test_alias_table_defaults() {
        let table = AliasTable::with_defaults();
        assert_eq!(table.resolve("statusUpdated"), Some(CanonicalEvent::OrderStatusChanged));
        assert_eq!(table.resolve("receiveMessage"), Some(CanonicalEvent::NewChatMessage));
        assert_eq!(table.resolve("bogus"), None);
        assert_eq!(
            table.raw_names(CanonicalEvent::TypingStopped),
            vec!["stopTyping", "userStoppedTyping"]
        );
    }

    #[test]
    fn test_alias_conflict_rejected() {
        let mut table = AliasTable::with_defaults();
        assert!(table.add(CanonicalEvent::OrderUpdated, "orderShipped").is_ok());
        assert!(table.add(CanonicalEvent::OrderUpdated, "statusUpdated").is_err());
    }

    #[test]
    fn test_unknown_and_malformed_are_dropped() {
        let mut router = router();
        let (targets, orders) = order_targets();
        let unknown = PushEvent::new("confetti", json!({}));
        assert!(router.route(&unknown, &targets).is_empty());
        let malformed = PushEvent::new("statusUpdated", json!({"orderId": "A", "status": "Teleported"}));
        assert!(matches!(router.decode(&malformed), Err(Error::MalformedEvent { .. })));
        assert!(router.route(&malformed, &targets).is_empty());
        assert!(lock(&orders).store().is_empty());
    }

    #[test]
    fn test_status_event_creates_placeholder() {
        let mut router = router();
        let (targets, orders) = order_targets();
        let event = PushEvent::new("orderStatusUpdated", json!({"orderId": "A", "status": "Preparation"}));
        let notes = router.route(&event, &targets);
        assert_eq!(
            notes,
            vec![Notification::OrderStatusChanged {
                order_id: "A".into(),
                previous: None,
                current: OrderStatus::Preparation,
            }]
        );
        assert!(lock(&orders).get("A").unwrap().is_placeholder());
    }

    #[test]
    fn test_payment_event() {
        let mut router = router();
        let (targets, orders) = order_targets();
        lock(&orders).apply_server(Order::placeholder("A"));
        let event = PushEvent::new("paymentUpdated", json!({"orderId": "A", "paymentStatus": "paid"}));
        assert_eq!(
            router.route(&event, &targets),
            vec![Notification::PaymentStatusChanged {
                order_id: "A".into(),
                current: PaymentStatus::Paid,
            }]
        );
    }

    #[test]
    fn test_duplicate_event_id_dropped() {
        let mut router = router();
        let (targets, _orders) = order_targets();
        let event = PushEvent::new("statusUpdated", json!({"orderId": "A", "status": "Delivered"}))
            .with_id("evt-1");
        assert_eq!(router.route(&event, &targets).len(), 1);
        let replay = PushEvent::new("orderStatusChanged", json!({"orderId": "A", "status": "Cancelled"}))
            .with_id("evt-1");
        assert!(router.route(&replay, &targets).is_empty());
    }

    #[test]
    fn test_messages_deduplicated_by_id() {
        let mut router = router();
        let messages = Reconciler::shared();
        let targets = RouteTargets {
            orders: None,
            messages: Some(messages.clone()),
        };
        let payload = json!({"_id": "m1", "chatId": "c1", "senderId": "u2", "body": "hey"});
        let first = router.route(&PushEvent::new("newMessage", payload.clone()), &targets);
        assert_eq!(
            first,
            vec![Notification::MessageReceived {
                chat_id: "c1".into(),
                message_id: "m1".into(),
            }]
        );
        let second = router.route(&PushEvent::new("receiveMessage", json!({"message": payload})), &targets);
        assert!(second.is_empty());
        assert_eq!(lock(&messages).store().len(), 1);
    }

    #[test]
    fn test_message_without_store_keeps_dedup_slot() {
        let mut router = router();
        let (order_only, _) = order_targets();
        let event = PushEvent::new("newMessage", json!({"_id": "m1", "chatId": "c1", "body": "hey"}));
        assert!(router.route(&event, &order_only).is_empty());

        let messages = Reconciler::shared();
        let targets = RouteTargets {
            orders: None,
            messages: Some(messages.clone()),
        };
        assert_eq!(router.route(&event, &targets).len(), 1);
        assert_eq!(lock(&messages).store().len(), 1);
    }

    #[test]
    fn test_read_receipts() {
        let mut router = router();
        let messages = Reconciler::shared();
        let targets = RouteTargets {
            orders: None,
            messages: Some(messages.clone()),
        };
        router.route(
            &PushEvent::new("newMessage", json!({"_id": "m1", "chatId": "c1", "body": "a"})),
            &targets,
        );
        router.route(
            &PushEvent::new("newMessage", json!({"_id": "m2", "chatId": "c1", "body": "b"})),
            &targets,
        );
        let notes = router.route(&PushEvent::new("messagesRead", json!({"chatId": "c1"})), &targets);
        assert_eq!(
            notes,
            vec![Notification::MessagesRead {
                chat_id: "c1".into(),
                count: 2,
            }]
        );
        let again = router.route(&PushEvent::new("messageRead", json!({"chatId": "c1"})), &targets);
        assert!(again.is_empty());
    }

    #[test]
    fn test_typing_is_edge_triggered() {
        let mut router = router();
        let targets = RouteTargets::default();
        let start = PushEvent::new("typing", json!({"chatId": "c1", "userId": "u2"}));
        assert_eq!(router.route(&start, &targets).len(), 1);
        assert!(router.route(&start, &targets).is_empty());
        assert_eq!(router.typing().typing_in("c1"), vec!["u2".to_string()]);
        let stop = PushEvent::new("userStoppedTyping", json!({"chatId": "c1", "userId": "u2"}));
        assert_eq!(router.route(&stop, &targets).len(), 1);
        assert!(router.typing().typing_in("c1").is_empty());
    }
}
