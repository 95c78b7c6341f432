use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{broadcast, Semaphore};

use crate::auth::{Credentials, MemoryTokenStore};
use crate::prelude::Result;
use crate::rest::StorefrontApi;
use crate::session::{Session, SessionSettings};
use crate::sync::{ConnectionHealthMonitor, LinkEvent, Notification};
use crate::types::{
    AddToCart, Cart, ChatMessage, ChatUser, MessageStatus, Order, PlaceOrderRequest,
    SendMessageRequest,
};
use crate::ws::{Listener, ListenerId, OutboundEvent, PushChannel, PushEvent};
use crate::Error;

/// Scripted storefront backend. Every field is a knob a scenario can turn.
pub(super) struct MockApi {
    pub(super) orders: Mutex<Vec<Order>>,
    pub(super) list_error: Mutex<Option<Error>>,
    pub(super) messages: Mutex<Vec<ChatMessage>>,
    pub(super) cancel_result: Mutex<Result<Option<Order>>>,
    pub(super) place_result: Mutex<Result<Order>>,
    pub(super) send_error: Mutex<Option<Error>>,
    pub(super) server_cart: Mutex<Cart>,
    pub(super) add_requests: Mutex<Vec<AddToCart>>,
    /// When set, cancel and add-to-cart wait for a permit
    pub(super) gate: Option<Semaphore>,
    calls: Mutex<HashMap<&'static str, usize>>,
    next_message: AtomicU32,
}

impl MockApi {
    pub(super) fn new() -> Self {
        Self {
            orders: Mutex::new(Vec::new()),
            list_error: Mutex::new(None),
            messages: Mutex::new(Vec::new()),
            cancel_result: Mutex::new(Ok(None)),
            place_result: Mutex::new(Err(Error::server_error(500, "not scripted".into()))),
            send_error: Mutex::new(None),
            server_cart: Mutex::new(Cart::default()),
            add_requests: Mutex::new(Vec::new()),
            gate: None,
            calls: Mutex::new(HashMap::new()),
            next_message: AtomicU32::new(1),
        }
    }

    pub(super) fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub(super) fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn record(&self, name: &'static str) {
        *self.calls.lock().unwrap().entry(name).or_default() += 1;
    }

    async fn pass_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
    }

    fn stored_message(&self, prefix: &str, request: &SendMessageRequest) -> ChatMessage {
        let n = self.next_message.fetch_add(1, Ordering::SeqCst);
        ChatMessage {
            id: format!("{prefix}-{n}"),
            chat_id: request.chat_id.clone(),
            sender_id: "u1".into(),
            receiver_id: request.receiver_id.clone(),
            body: request.body.clone(),
            sent_at: None,
            nonce: Some(request.nonce.clone()),
            status: MessageStatus::Sent,
        }
    }
}

#[async_trait]
impl StorefrontApi for MockApi {
    async fn list_orders(&self) -> Result<Vec<Order>> {
        self.record("list_orders");
        if let Some(e) = self.list_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self.orders.lock().unwrap().clone())
    }

    async fn order_detail(&self, order_id: &str) -> Result<Order> {
        self.record("order_detail");
        self.orders
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.id == order_id)
            .cloned()
            .ok_or_else(|| Error::client_error(404, "Order not found".into(), None))
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<Option<Order>> {
        self.record("cancel_order");
        self.pass_gate().await;
        self.cancel_result.lock().unwrap().clone()
    }

    async fn place_order(&self, _request: &PlaceOrderRequest) -> Result<Order> {
        self.record("place_order");
        self.place_result.lock().unwrap().clone()
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        self.record("list_messages");
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<ChatMessage> {
        self.record("send_message");
        if let Some(e) = self.send_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self.stored_message("rest", request))
    }

    async fn chat_users(&self) -> Result<Vec<ChatUser>> {
        self.record("chat_users");
        Ok(Vec::new())
    }

    async fn cart(&self) -> Result<Cart> {
        self.record("cart");
        Ok(self.server_cart.lock().unwrap().clone())
    }

    async fn add_to_cart(&self, request: &AddToCart) -> Result<Cart> {
        self.record("add_to_cart");
        self.pass_gate().await;
        self.add_requests.lock().unwrap().push(request.clone());
        let mut cart = self.server_cart.lock().unwrap();
        cart.add(&request.product_id, request.quantity, request.unit_price);
        Ok(cart.clone())
    }

    async fn clear_cart(&self) -> Result<()> {
        self.record("clear_cart");
        self.server_cart.lock().unwrap().clear();
        Ok(())
    }
}

/// How the mock channel answers `request`.
#[derive(Debug, Clone)]
pub(super) enum AckMode {
    /// Acknowledge with the stored message built from the request
    Echo,
    /// Acknowledge without a body
    Bare,
    /// Acknowledge with a body that is not a message
    Garbled,
    /// Never acknowledge
    Timeout,
    Fail(Error),
}

/// In-memory push channel. Scenarios inject push events and link changes.
pub(super) struct MockChannel {
    health: ConnectionHealthMonitor,
    listeners: Mutex<HashMap<ListenerId, UnboundedSender<Arc<PushEvent>>>>,
    next_listener: AtomicU32,
    link_tx: broadcast::Sender<LinkEvent>,
    pub(super) joined: Mutex<Vec<OutboundEvent>>,
    pub(super) emitted: Mutex<Vec<OutboundEvent>>,
    pub(super) requests: Mutex<Vec<OutboundEvent>>,
    pub(super) ack: Mutex<AckMode>,
    pub(super) fail_connect: AtomicBool,
}

impl MockChannel {
    pub(super) fn new() -> Self {
        let (link_tx, _) = broadcast::channel(32);
        Self {
            health: ConnectionHealthMonitor::new(),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU32::new(1),
            link_tx,
            joined: Mutex::new(Vec::new()),
            emitted: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            ack: Mutex::new(AckMode::Echo),
            fail_connect: AtomicBool::new(false),
        }
    }

    /// Deliver a push event to every listener. Returns how many got it.
    pub(super) fn push(&self, event: PushEvent) -> usize {
        self.health.record_push();
        let event = Arc::new(event);
        self.listeners
            .lock()
            .unwrap()
            .values()
            .filter(|tx| tx.send(Arc::clone(&event)).is_ok())
            .count()
    }

    pub(super) fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Simulate the link dropping.
    pub(super) fn drop_link(&self) {
        self.health.record_lost();
        let _ = self.link_tx.send(LinkEvent::Disconnected);
    }

    pub(super) fn restore_link(&self) {
        self.health.record_connected();
        let _ = self.link_tx.send(LinkEvent::Connected);
    }
}

#[async_trait]
impl PushChannel for MockChannel {
    async fn connect(&self, _credentials: &Credentials) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::ws_connection("connection refused"));
        }
        self.health.record_connected();
        Ok(())
    }

    async fn disconnect(&self) {
        self.listeners.lock().unwrap().clear();
        self.joined.lock().unwrap().clear();
        self.health.mark_closed();
    }

    fn listen(&self) -> Listener {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let (tx, events) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().insert(id, tx);
        Listener { id, events }
    }

    fn release(&self, id: ListenerId) -> Result<()> {
        self.listeners
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::ListenerNotFound)
    }

    async fn emit(&self, event: OutboundEvent) -> Result<()> {
        self.emitted.lock().unwrap().push(event);
        Ok(())
    }

    async fn request(&self, event: OutboundEvent, timeout: Duration) -> Result<Value> {
        self.requests.lock().unwrap().push(event.clone());
        let mode = self.ack.lock().unwrap().clone();
        match (mode, event) {
            (
                AckMode::Echo,
                OutboundEvent::SendMessage {
                    chat_id,
                    receiver_id,
                    body,
                    nonce,
                },
            ) => Ok(json!({
                "message": {
                    "_id": format!("ws-{}", self.requests.lock().unwrap().len()),
                    "chatId": chat_id,
                    "senderId": "u1",
                    "receiverId": receiver_id,
                    "body": body,
                    "nonce": nonce,
                    "status": "sent"
                }
            })),
            (AckMode::Echo, _) | (AckMode::Bare, _) => Ok(json!({"ok": true})),
            (AckMode::Garbled, _) => Ok(json!({"message": {"text": 42}})),
            (AckMode::Timeout, _) => Err(Error::AckTimeout {
                request_id: 1,
                timeout_ms: timeout.as_millis() as u64,
            }),
            (AckMode::Fail(e), _) => Err(e),
        }
    }

    async fn join(&self, event: OutboundEvent) -> Result<()> {
        if !self.health.state().is_connected() {
            return Err(Error::NotConnected);
        }
        self.joined.lock().unwrap().push(event);
        Ok(())
    }

    fn forget(&self, event: &OutboundEvent) {
        self.joined.lock().unwrap().retain(|e| e != event);
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }

    fn health(&self) -> ConnectionHealthMonitor {
        self.health.clone()
    }
}

pub(super) struct Harness {
    pub(super) api: Arc<MockApi>,
    pub(super) channel: Arc<MockChannel>,
    pub(super) session: Session,
    pub(super) notifications: mpsc::UnboundedReceiver<Notification>,
}

impl Harness {
    pub(super) async fn open(api: MockApi, channel: MockChannel) -> Self {
        let api = Arc::new(api);
        let channel = Arc::new(channel);
        let (session, notifications) = Session::open(
            api.clone(),
            channel.clone(),
            Arc::new(MemoryTokenStore::new(Some("t0k3n".into()))),
            SessionSettings::default(),
        )
        .await
        .unwrap();
        Self {
            api,
            channel,
            session,
            notifications,
        }
    }

    pub(super) async fn connected() -> Self {
        Self::open(MockApi::new(), MockChannel::new()).await
    }

    /// Everything notified so far, minus push channel lifecycle.
    pub(super) fn drain(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            if !matches!(n, Notification::Link(_)) {
                out.push(n);
            }
        }
        out
    }
}

/// Let spawned tasks run.
pub(super) async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
