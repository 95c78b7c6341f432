//! Process-scoped sync session.
//!
//! One [`Session`] per signed-in user owns the entity stores, keeps the push
//! channel connected and exposes the user intents (cancel an order, send a
//! message, submit an order, add to cart) as optimistic operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc::UnboundedReceiver, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{Credentials, TokenStore};
use crate::config::SyncConfig;
use crate::consts::CART_ID;
use crate::logging::targets;
use crate::prelude::Result;
use crate::rest::{ChatSource, OrderDetailSource, OrderListSource, StorefrontApi};
use crate::serde_utils::entity_from_value;
use crate::sync::{
    lock, AliasTable, ApplyOutcome, Coalesce, Coalescer, Entity, IntentId, LinkEvent,
    LinkState, Notification, Notifier, PollPolicy, Reconciler, RouterConfig, SharedReconciler,
    Submitted, SyncContext,
};
use crate::types::{
    AddToCart, Cart, ChatMessage, ChatUser, Order, OrderStatus, PlaceOrderRequest,
    SendMessageRequest,
};
use crate::ws::{OutboundEvent, PushChannel};
use crate::Error;

/// Component settings shared by every context the session opens.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub aliases: AliasTable,
    pub router: RouterConfig,
    pub poll: PollPolicy,
    /// Wait for a channel acknowledgement before falling back to REST
    pub ack_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            aliases: AliasTable::with_defaults(),
            router: RouterConfig::default(),
            poll: PollPolicy::default(),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            aliases: config.router.alias_table()?,
            router: config.router.to_router_config(),
            poll: config.poller.to_poll_policy(),
            ack_timeout: Duration::from_millis(config.connection.ack_timeout_ms),
        })
    }
}

/// Add-to-cart clicks on one product waiting for a single request.
#[derive(Debug)]
struct CartBatch {
    request: AddToCart,
    intents: Vec<IntentId>,
}

impl Coalesce for CartBatch {
    fn absorb(&mut self, later: Self) {
        // batches are keyed by product, so the merge never hands one back
        if let Some(other) = self.request.merge(later.request) {
            warn!(target: targets::OPTIMISTIC, product = %other.product_id, "Cart batch for another product absorbed");
        }
        self.intents.extend(later.intents);
    }
}

/// Per-product add-to-cart dispatch. Owned by a spawned task while a
/// product has a request in flight, so a caller giving up on its future
/// never strands the clicks folded in behind it.
struct CartQueue {
    api: Arc<dyn StorefrontApi>,
    cart: SharedReconciler<Cart>,
    notifier: Notifier,
    batches: Mutex<HashMap<String, Coalescer<CartBatch>>>,
}

impl CartQueue {
    fn submit(&self, batch: CartBatch) -> Submitted<CartBatch> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(batch.request.product_id.clone())
            .or_default()
            .submit(batch)
    }

    /// Send `batch`, then every batch coalesced behind it, until the
    /// product's slot is empty. The first result goes to `first`.
    async fn drain(self: Arc<Self>, mut batch: CartBatch, first: oneshot::Sender<Result<()>>) {
        let product_id = batch.request.product_id.clone();
        let mut first = Some(first);
        loop {
            let result = self.dispatch(batch).await;
            if let Some(tx) = first.take() {
                if tx.send(result).is_err() {
                    debug!(target: targets::OPTIMISTIC, product_id = %product_id, "Add-to-cart caller gone, continuing");
                }
            }
            let next = {
                let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
                let next = batches.get_mut(&product_id).and_then(Coalescer::complete);
                if batches.get(&product_id).is_some_and(Coalescer::is_idle) {
                    batches.remove(&product_id);
                }
                next
            };
            match next {
                Some(n) => batch = n,
                None => break,
            }
        }
    }

    async fn dispatch(&self, batch: CartBatch) -> Result<()> {
        debug!(
            target: targets::OPTIMISTIC,
            product_id = %batch.request.product_id,
            quantity = batch.request.quantity,
            clicks = batch.intents.len(),
            "Sending add-to-cart"
        );
        match self.api.add_to_cart(&batch.request).await {
            Ok(server_cart) => {
                let mut cart = lock(&self.cart);
                for intent in &batch.intents {
                    cart.confirm(*intent, None);
                }
                cart.apply_server(server_cart);
                Ok(())
            }
            Err(e) => {
                let rolled_back = {
                    let mut cart = lock(&self.cart);
                    batch
                        .intents
                        .iter()
                        .filter(|intent| cart.reject(**intent).is_some())
                        .count()
                };
                if rolled_back == 0 {
                    return Err(e);
                }
                Err(rejected::<Cart>(&self.notifier, CART_ID, &e))
            }
        }
    }
}

pub struct Session {
    api: Arc<dyn StorefrontApi>,
    channel: Arc<dyn PushChannel>,
    tokens: Arc<dyn TokenStore>,
    notifier: Notifier,
    settings: SessionSettings,
    orders: SharedReconciler<Order>,
    messages: SharedReconciler<ChatMessage>,
    cart: SharedReconciler<Cart>,
    cart_queue: Arc<CartQueue>,
    next_cart_click: AtomicU64,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    /// Connect the push channel and start forwarding its lifecycle as
    /// notifications. A failed initial connect leaves the session degraded
    /// rather than failing; polling carries the contexts until it recovers.
    pub async fn open(
        api: Arc<dyn StorefrontApi>,
        channel: Arc<dyn PushChannel>,
        tokens: Arc<dyn TokenStore>,
        settings: SessionSettings,
    ) -> Result<(Self, UnboundedReceiver<Notification>)> {
        let (notifier, notifications) = Notifier::channel();
        let cart = Reconciler::shared();
        let cart_queue = Arc::new(CartQueue {
            api: Arc::clone(&api),
            cart: Arc::clone(&cart),
            notifier: notifier.clone(),
            batches: Mutex::new(HashMap::new()),
        });
        let session = Self {
            api,
            channel,
            tokens,
            notifier,
            settings,
            orders: Reconciler::shared(),
            messages: Reconciler::shared(),
            cart,
            cart_queue,
            next_cart_click: AtomicU64::new(1),
            forwarder: Mutex::new(None),
            closed: AtomicBool::new(false),
        };

        let link_events = session.channel.link_events();
        let forwarder = tokio::spawn(forward_link_events(link_events, session.notifier.clone()));
        *session.forwarder.lock().unwrap_or_else(PoisonError::into_inner) = Some(forwarder);

        session.connect().await?;
        Ok((session, notifications))
    }

    /// (Re)connect the push channel with the current token.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_open()?;
        let token = self.tokens.token()?.unwrap_or_default();
        if token.is_empty() {
            warn!(target: targets::CONNECTION, "No auth token, connecting anonymously");
        }
        if let Err(e) = self.channel.connect(&Credentials::new(token)).await {
            warn!(target: targets::CONNECTION, error = %e, "Push channel unavailable, polling only");
            let health = self.channel.health();
            // a channel retrying on its own reports Connected or Degraded later
            if health.state() != LinkState::Reconnecting {
                health.mark_degraded();
            }
            self.notifier.notify(Notification::Link(LinkEvent::Degraded));
        }
        Ok(())
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn channel(&self) -> &Arc<dyn PushChannel> {
        &self.channel
    }

    pub fn orders(&self) -> SharedReconciler<Order> {
        Arc::clone(&self.orders)
    }

    pub fn messages(&self) -> SharedReconciler<ChatMessage> {
        Arc::clone(&self.messages)
    }

    pub fn cart(&self) -> SharedReconciler<Cart> {
        Arc::clone(&self.cart)
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        lock(&self.orders).get(order_id).cloned()
    }

    /// Orders, newest first.
    pub fn order_list(&self) -> Vec<Order> {
        let mut orders = lock(&self.orders).snapshot();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        orders
    }

    /// One chat's messages in send order.
    pub fn chat_messages(&self, chat_id: &str) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = lock(&self.messages)
            .store()
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
        messages
    }

    pub fn cart_snapshot(&self) -> Cart {
        lock(&self.cart).get(CART_ID).cloned().unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ContextClosed);
        }
        Ok(())
    }

    fn context(&self, name: String) -> crate::sync::ContextBuilder {
        SyncContext::builder(name, Arc::clone(&self.channel), self.notifier.clone())
            .aliases(self.settings.aliases.clone())
            .router_config(self.settings.router.clone())
            .poll_policy(self.settings.poll.clone())
    }

    /// The order list view: every order of the user, polled authoritatively.
    pub async fn orders_context(&self) -> Result<SyncContext> {
        self.ensure_open()?;
        self.context("orders".to_string())
            .orders(self.orders())
            .poll_orders(Arc::new(OrderListSource::new(Arc::clone(&self.api))))
            .start()
            .await
    }

    /// One order's tracking view.
    pub async fn order_context(&self, order_id: &str) -> Result<SyncContext> {
        self.ensure_open()?;
        self.context(format!("order:{order_id}"))
            .orders(self.orders())
            .join(OutboundEvent::JoinOrder {
                order_id: order_id.to_string(),
            })
            .poll_orders(Arc::new(OrderDetailSource::new(Arc::clone(&self.api), order_id)))
            .start()
            .await
    }

    /// One chat conversation.
    pub async fn chat_context(&self, chat_id: &str) -> Result<SyncContext> {
        self.ensure_open()?;
        self.context(format!("chat:{chat_id}"))
            .messages(self.messages())
            .join(OutboundEvent::JoinChat {
                chat_id: chat_id.to_string(),
            })
            .poll_messages(Arc::new(ChatSource::new(Arc::clone(&self.api), chat_id)))
            .start()
            .await
    }

    pub async fn chat_users(&self) -> Result<Vec<ChatUser>> {
        self.api.chat_users().await
    }

    pub async fn refresh_cart(&self) -> Result<Cart> {
        self.ensure_open()?;
        let cart = self.api.cart().await?;
        lock(&self.cart).apply_server(cart.clone());
        Ok(self.cart_snapshot())
    }

    /// Announce typing state in a chat. Best effort.
    pub async fn set_typing(&self, chat_id: &str, user_id: &str, typing: bool) -> Result<()> {
        self.ensure_open()?;
        let (chat_id, user_id) = (chat_id.to_string(), user_id.to_string());
        let event = if typing {
            OutboundEvent::Typing { chat_id, user_id }
        } else {
            OutboundEvent::StopTyping { chat_id, user_id }
        };
        self.channel.emit(event).await
    }

    /// Show the order as cancelled right away, then ask the backend.
    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.ensure_open()?;
        let recorded = lock(&self.orders).apply_optimistic(
            order_id,
            "status",
            Arc::new(|o: &mut Order| o.status = OrderStatus::Cancelled),
        )?;
        debug!(target: targets::OPTIMISTIC, order_id, intent = %recorded.intent, "Cancel requested");

        match self.api.cancel_order(order_id).await {
            Ok(server) => {
                lock(&self.orders).confirm(recorded.intent, server);
                info!(target: targets::OPTIMISTIC, order_id, "Cancel confirmed");
                Ok(())
            }
            Err(e) => {
                if lock(&self.orders).reject(recorded.intent).is_none() {
                    debug!(target: targets::OPTIMISTIC, order_id, error = %e, "Superseded cancel refused, newer intent stands");
                    return Err(e);
                }
                Err(rejected::<Order>(&self.notifier, order_id, &e))
            }
        }
    }

    /// Insert the message under a provisional id and send it over the push
    /// channel, falling back to REST when the channel cannot deliver. The
    /// provisional copy is swapped for the server's as soon as either path,
    /// a push event or a poll carries it back.
    pub async fn send_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
    ) -> Result<ChatMessage> {
        self.ensure_open()?;
        let provisional = ChatMessage::provisional(chat_id, sender_id, receiver_id, body);
        let intent = lock(&self.messages).insert_provisional(provisional.clone())?;
        let request = SendMessageRequest::from_provisional(&provisional);

        let event = OutboundEvent::SendMessage {
            chat_id: request.chat_id.clone(),
            receiver_id: request.receiver_id.clone(),
            body: request.body.clone(),
            nonce: request.nonce.clone(),
        };
        let sent = match self.channel.request(event, self.settings.ack_timeout).await {
            // acknowledged without a body: the push event will swap it
            Ok(ack) if is_bare_ack(&ack) => Ok(None),
            Ok(ack) => match entity_from_value::<ChatMessage>(ack, "message") {
                Ok(mut message) => {
                    fill_message(&mut message, &request);
                    Ok(Some(message))
                }
                Err(e) => {
                    warn!(target: targets::OPTIMISTIC, error = %e, "Unreadable send ack, using REST");
                    self.api.send_message(&request).await.map(Some)
                }
            },
            Err(e) if e.is_transient() => {
                debug!(target: targets::OPTIMISTIC, error = %e, "Channel send failed, using REST");
                self.api.send_message(&request).await.map(Some)
            }
            Err(e) => Err(e),
        };

        match sent {
            Ok(Some(message)) => {
                let outcome = lock(&self.messages).confirm(intent, Some(message.clone()));
                if let ApplyOutcome::Updated { previous } = outcome {
                    if previous.is_provisional() {
                        self.notifier.notify(Notification::MessageConfirmed {
                            chat_id: message.chat_id.clone(),
                            provisional_id: previous.id,
                            message_id: message.id.clone(),
                        });
                    }
                }
                Ok(message)
            }
            Ok(None) => Ok(provisional),
            Err(e) => {
                if lock(&self.messages).reject(intent).is_none() {
                    // an echo already confirmed it
                    return Err(e);
                }
                Err(rejected::<ChatMessage>(&self.notifier, &provisional.id, &e))
            }
        }
    }

    fn ensure_cart(&self) -> Result<()> {
        let mut cart = lock(&self.cart);
        if cart.is_closed() {
            return Err(Error::ContextClosed);
        }
        if cart.confirmed(CART_ID).is_none() {
            cart.apply_server(Cart::default());
        }
        Ok(())
    }

    /// Empty the cart right away and place the order. The cart comes back if
    /// the backend refuses.
    pub async fn submit_order(&self, request: &PlaceOrderRequest) -> Result<Order> {
        self.ensure_open()?;
        self.ensure_cart()?;
        let recorded = lock(&self.cart).apply_optimistic(
            CART_ID,
            "lines",
            Arc::new(|c: &mut Cart| c.clear()),
        )?;

        match self.api.place_order(request).await {
            Ok(order) => {
                lock(&self.cart).confirm(recorded.intent, None);
                let outcome = lock(&self.orders).apply_server(order.clone());
                if outcome == ApplyOutcome::Inserted {
                    self.notifier.notify(Notification::OrderStatusChanged {
                        order_id: order.id.clone(),
                        previous: None,
                        current: order.status,
                    });
                }
                info!(target: targets::OPTIMISTIC, order_id = %order.id, "Order placed");
                Ok(order)
            }
            Err(e) => {
                if lock(&self.cart).reject(recorded.intent).is_none() {
                    return Err(e);
                }
                Err(rejected::<Cart>(&self.notifier, CART_ID, &e))
            }
        }
    }

    /// Add to the cart right away. Clicks on a product while its request is
    /// in flight are folded into one follow-up request, sent even if the
    /// caller that started the first one stops waiting.
    pub async fn add_to_cart(&self, product_id: &str, quantity: u32, unit_price: f64) -> Result<()> {
        self.ensure_open()?;
        self.ensure_cart()?;

        let click = self.next_cart_click.fetch_add(1, Ordering::Relaxed);
        let pid = product_id.to_string();
        let recorded = lock(&self.cart).apply_optimistic(
            CART_ID,
            &format!("line:{product_id}:{click}"),
            Arc::new(move |c: &mut Cart| c.add(&pid, quantity, unit_price)),
        )?;

        let batch = CartBatch {
            request: AddToCart {
                product_id: product_id.to_string(),
                quantity,
                unit_price,
            },
            intents: vec![recorded.intent],
        };
        let Submitted::Dispatch(batch) = self.cart_queue.submit(batch) else {
            debug!(target: targets::OPTIMISTIC, product_id, "Add-to-cart coalesced");
            return Ok(());
        };

        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(Arc::clone(&self.cart_queue).drain(batch, first_tx));
        first_rx
            .await
            .unwrap_or_else(|_| Err(Error::GenericRequest("add-to-cart task ended without a result".to_string())))
    }

    /// Roll back every intent still unconfirmed after `max_age`.
    pub fn expire_pending(&self, max_age: Duration) -> usize {
        let mut expired = 0;
        expired += expire(&self.orders, max_age, &self.notifier);
        expired += expire(&self.messages, max_age, &self.notifier);
        expired += expire(&self.cart, max_age, &self.notifier);
        expired
    }

    /// Close every store, stop forwarding and disconnect the channel.
    /// Contexts still open stop applying anything.
    pub async fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.orders).close();
        lock(&self.messages).close();
        lock(&self.cart).close();
        if let Some(forwarder) = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            forwarder.abort();
        }
        self.channel.disconnect().await;
        info!(target: targets::CONTEXT, "Session torn down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(forwarder) = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            forwarder.abort();
        }
    }
}

/// Roll-back notice for an optimistic change the server refused.
fn rejected<E: Entity>(notifier: &Notifier, entity_id: &str, error: &Error) -> Error {
    let reason = error.user_message();
    warn!(
        target: targets::OPTIMISTIC,
        kind = E::KIND,
        entity_id,
        reason = %reason,
        "Optimistic change rolled back"
    );
    notifier.notify(Notification::MutationRejected {
        entity_kind: E::KIND,
        entity_id: entity_id.to_string(),
        reason: reason.clone(),
    });
    Error::MutationRejected {
        entity_id: entity_id.to_string(),
        reason,
    }
}

/// `null`, `{}` and `{"ok": true}` acknowledge without carrying the stored
/// message.
fn is_bare_ack(ack: &Value) -> bool {
    match ack {
        Value::Null => true,
        Value::Object(fields) => fields
            .iter()
            .all(|(key, value)| key == "ok" && *value == Value::Bool(true)),
        _ => false,
    }
}

fn fill_message(message: &mut ChatMessage, request: &SendMessageRequest) {
    if message.chat_id.is_empty() {
        message.chat_id = request.chat_id.clone();
    }
    if message.nonce.is_none() {
        message.nonce = Some(request.nonce.clone());
    }
}

fn expire<E: Entity>(target: &SharedReconciler<E>, max_age: Duration, notifier: &Notifier) -> usize {
    let mut rec = lock(target);
    let intents = rec.expired(max_age);
    let mut count = 0;
    for intent in intents {
        let Some(rollback) = rec.reject(intent) else {
            continue;
        };
        count += 1;
        let entity_id = rollback.entity().id().to_string();
        warn!(target: targets::OPTIMISTIC, kind = E::KIND, %entity_id, "Unconfirmed change expired");
        notifier.notify(Notification::MutationRejected {
            entity_kind: E::KIND,
            entity_id,
            reason: "No confirmation from the server".to_string(),
        });
    }
    count
}

async fn forward_link_events(mut events: broadcast::Receiver<LinkEvent>, notifier: Notifier) {
    loop {
        match events.recv().await {
            Ok(event) => notifier.notify(Notification::Link(event)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(target: targets::CONNECTION, skipped = n, "Link notifications lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
