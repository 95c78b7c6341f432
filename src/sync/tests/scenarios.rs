use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;

use super::support::{settle, AckMode, Harness, MockApi, MockChannel};
use crate::auth::MemoryTokenStore;
use crate::consts::{CART_ID, PROVISIONAL_PREFIX};
use crate::session::{Session, SessionSettings};
use crate::sync::{
    lock, ApplyOutcome, ContextState, LinkEvent, LinkState, MergePolicy, Notification,
    ReconnectionConfig, Reconciler, SyncContext,
};
use crate::types::{
    Cart, ChatMessage, MessageStatus, Order, OrderStatus, PaymentStatus, PlaceOrderRequest,
};
use crate::ws::{ConnectionConfig, ConnectionManager, OutboundEvent, PushChannel, PushEvent};
use crate::Error;

fn order(id: &str, status: OrderStatus) -> Order {
    Order::placeholder(id).with_status(status)
}

fn message(id: &str, chat_id: &str) -> ChatMessage {
    ChatMessage {
        id: id.into(),
        chat_id: chat_id.into(),
        sender_id: "u2".into(),
        receiver_id: "u1".into(),
        body: format!("body of {id}"),
        sent_at: None,
        nonce: None,
        status: MessageStatus::Sent,
    }
}

fn status_event(name: &str, order_id: &str, status: &str) -> PushEvent {
    PushEvent::new(name, json!({"orderId": order_id, "status": status}))
}

// ----------------------------------------------------------------------------
// Push routing
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_replayed_push_applies_once() {
    let mut h = Harness::connected().await;
    let orders = h.session.orders();
    lock(&orders).apply_server(order("A", OrderStatus::Pending));
    let mut ctx = SyncContext::builder("orders", h.channel.clone(), h.session.notifier().clone())
        .orders(orders.clone())
        .start()
        .await
        .unwrap();

    let event = status_event("orderStatusUpdated", "A", "Preparation");
    assert_eq!(h.channel.push(event.clone()), 1);
    assert_eq!(h.channel.push(event), 1);
    settle().await;

    assert_eq!(
        h.drain(),
        vec![Notification::OrderStatusChanged {
            order_id: "A".into(),
            previous: Some(OrderStatus::Pending),
            current: OrderStatus::Preparation,
        }]
    );
    assert_eq!(lock(&orders).store().len(), 1);
    assert_eq!(h.session.order("A").unwrap().status, OrderStatus::Preparation);
    ctx.close();
}

#[tokio::test]
async fn test_aliased_events_collapse_to_one_notification() {
    let mut h = Harness::connected().await;
    let orders = h.session.orders();
    lock(&orders).apply_server(order("A", OrderStatus::Preparation));
    let _ctx = SyncContext::builder("orders", h.channel.clone(), h.session.notifier().clone())
        .orders(orders)
        .start()
        .await
        .unwrap();

    // one transition announced under two names with distinct event ids
    h.channel
        .push(status_event("statusUpdated", "A", "Ontheway").with_id("e-1"));
    h.channel
        .push(status_event("orderStatusChanged", "A", "Ontheway").with_id("e-2"));
    settle().await;

    assert_eq!(
        h.drain(),
        vec![Notification::OrderStatusChanged {
            order_id: "A".into(),
            previous: Some(OrderStatus::Preparation),
            current: OrderStatus::Ontheway,
        }]
    );
}

#[tokio::test]
async fn test_typing_is_tracked_per_context() {
    let mut h = Harness::connected().await;
    let ctx = h.session.chat_context("c1").await.unwrap();
    settle().await;
    h.drain();

    h.channel
        .push(PushEvent::new("typing", json!({"chatId": "c1", "userId": "u2"})));
    h.channel
        .push(PushEvent::new("userTyping", json!({"chatId": "c1", "userId": "u2"})));
    settle().await;
    assert_eq!(ctx.typing_in("c1"), vec!["u2".to_string()]);
    assert_eq!(
        h.drain(),
        vec![Notification::TypingChanged {
            chat_id: "c1".into(),
            user_id: "u2".into(),
            typing: true,
        }]
    );

    h.channel
        .push(PushEvent::new("stopTyping", json!({"chatId": "c1", "userId": "u2"})));
    settle().await;
    assert!(ctx.typing_in("c1").is_empty());

    h.session.set_typing("c1", "u1", true).await.unwrap();
    assert!(h.channel.emitted.lock().unwrap().contains(&OutboundEvent::Typing {
        chat_id: "c1".into(),
        user_id: "u1".into(),
    }));
}

// ----------------------------------------------------------------------------
// Merging
// ----------------------------------------------------------------------------

#[test]
fn test_partial_merge_keeps_absent_entities() {
    let mut rec = Reconciler::new();
    rec.apply_server(order("A", OrderStatus::Pending));
    rec.apply_server(order("B", OrderStatus::Pending));

    let report = rec.apply_batch(
        vec![order("A", OrderStatus::Delivered)],
        MergePolicy::Partial,
        |_| true,
    );
    assert_eq!(report.updated, 1);
    assert!(report.removed.is_empty());
    assert_eq!(rec.store().len(), 2);
    assert_eq!(rec.get("A").unwrap().status, OrderStatus::Delivered);
}

#[test]
fn test_authoritative_merge_removes_absent_but_protects_pending() {
    let mut rec = Reconciler::new();
    for id in ["A", "B", "C"] {
        rec.apply_server(order(id, OrderStatus::Pending));
    }
    rec.apply_optimistic(
        "C",
        "status",
        Arc::new(|o: &mut Order| o.status = OrderStatus::Cancelled),
    )
    .unwrap();

    let report = rec.apply_batch(
        vec![order("A", OrderStatus::Pending), order("D", OrderStatus::Pending)],
        MergePolicy::Authoritative,
        |_| true,
    );
    assert_eq!(report.inserted, 1);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.removed, vec!["B".to_string()]);
    assert_eq!(report.protected, 1);
    assert!(rec.get("C").is_some());
    assert!(rec.get("B").is_none());
}

#[test]
fn test_authoritative_merge_respects_scope() {
    let mut rec = Reconciler::new();
    rec.apply_server(message("m1", "c1"));
    rec.apply_server(message("m2", "c2"));

    let report = rec.apply_batch(Vec::new(), MergePolicy::Authoritative, |m: &ChatMessage| {
        m.chat_id == "c1"
    });
    assert_eq!(report.removed, vec!["m1".to_string()]);
    assert!(rec.get("m2").is_some());
}

#[tokio::test]
async fn test_order_list_poll_replaces_stale_orders() {
    let api = MockApi::new();
    *api.orders.lock().unwrap() = vec![order("A", OrderStatus::Delivered)];
    let mut h = Harness::open(api, MockChannel::new()).await;
    let orders = h.session.orders();
    lock(&orders).apply_server(order("A", OrderStatus::Ontheway));
    lock(&orders).apply_server(order("GONE", OrderStatus::Pending));

    let _ctx = h.session.orders_context().await.unwrap();
    settle().await;

    assert_eq!(h.api.calls("list_orders"), 1);
    let ids: Vec<String> = h.session.order_list().into_iter().map(|o| o.id).collect();
    assert_eq!(ids, vec!["A".to_string()]);
    assert_eq!(h.session.order("A").unwrap().status, OrderStatus::Delivered);
    h.drain();
}

#[tokio::test]
async fn test_order_detail_poll_leaves_other_orders() {
    let api = MockApi::new();
    *api.orders.lock().unwrap() = vec![order("A", OrderStatus::Preparation)];
    let h = Harness::open(api, MockChannel::new()).await;
    let orders = h.session.orders();
    lock(&orders).apply_server(order("B", OrderStatus::Pending));

    let _ctx = h.session.order_context("A").await.unwrap();
    settle().await;

    assert_eq!(h.api.calls("order_detail"), 1);
    assert_eq!(lock(&orders).store().len(), 2);
    assert_eq!(
        h.channel.joined.lock().unwrap().clone(),
        vec![OutboundEvent::JoinOrder {
            order_id: "A".into()
        }]
    );
}

// ----------------------------------------------------------------------------
// Optimistic mutations
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_order_confirmed() {
    let mut h = Harness::connected().await;
    lock(&h.session.orders()).apply_server(order("A", OrderStatus::Pending));
    *h.api.cancel_result.lock().unwrap() = Ok(Some(order("A", OrderStatus::Cancelled)));

    h.session.cancel_order("A").await.unwrap();

    assert_eq!(h.session.order("A").unwrap().status, OrderStatus::Cancelled);
    assert_eq!(lock(&h.session.orders()).pending_count(), 0);
    assert_eq!(h.api.calls("cancel_order"), 1);
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_cancel_order_without_body_keeps_patch() {
    let h = Harness::connected().await;
    lock(&h.session.orders()).apply_server(order("A", OrderStatus::Preparation));

    h.session.cancel_order("A").await.unwrap();

    let orders = h.session.orders();
    let rec = lock(&orders);
    assert_eq!(rec.get("A").unwrap().status, OrderStatus::Cancelled);
    assert_eq!(rec.confirmed("A").unwrap().status, OrderStatus::Cancelled);
    assert_eq!(rec.pending_count(), 0);
}

#[tokio::test]
async fn test_cancel_order_rejected_restores_exact_value() {
    let mut h = Harness::connected().await;
    let original = Order {
        payment_status: PaymentStatus::Paid,
        total_amount: 12.5,
        shipping_address: Some("1 Main St".into()),
        ..order("A", OrderStatus::Ontheway)
    };
    lock(&h.session.orders()).apply_server(original.clone());
    *h.api.cancel_result.lock().unwrap() =
        Err(Error::client_error(409, "Order already shipped".into(), None));

    let err = h.session.cancel_order("A").await.unwrap_err();

    assert!(matches!(err, Error::MutationRejected { ref reason, .. } if reason == "Order already shipped"));
    assert_eq!(h.session.order("A").unwrap(), original);
    assert_eq!(lock(&h.session.orders()).pending_count(), 0);
    assert_eq!(
        h.drain(),
        vec![Notification::MutationRejected {
            entity_kind: "order",
            entity_id: "A".into(),
            reason: "Order already shipped".into(),
        }]
    );
}

#[tokio::test]
async fn test_superseded_cancel_refusal_stays_quiet() {
    let mut h = Harness::open(MockApi::gated(), MockChannel::new()).await;
    let orders = h.session.orders();
    lock(&orders).apply_server(order("A", OrderStatus::Pending));
    *h.api.cancel_result.lock().unwrap() = Err(Error::client_error(409, "Too late".into(), None));

    let newer = async {
        tokio::task::yield_now().await;
        // a newer intent on the same field lands while the cancel is in flight
        lock(&orders)
            .apply_optimistic(
                "A",
                "status",
                Arc::new(|o: &mut Order| o.status = OrderStatus::Preparation),
            )
            .unwrap();
        h.api.gate.as_ref().unwrap().add_permits(1);
    };
    let (cancelled, ()) = tokio::join!(h.session.cancel_order("A"), newer);

    assert!(cancelled.is_err());
    assert_eq!(h.session.order("A").unwrap().status, OrderStatus::Preparation);
    assert_eq!(lock(&orders).pending_count(), 1);
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_cancel_unknown_order_never_reaches_backend() {
    let h = Harness::connected().await;
    let err = h.session.cancel_order("NOPE").await.unwrap_err();
    assert!(matches!(err, Error::EntityNotFound(id) if id == "NOPE"));
    assert_eq!(h.api.calls("cancel_order"), 0);
}

#[tokio::test]
async fn test_rejection_lands_on_pushed_value() {
    let mut h = Harness::connected().await;
    let orders = h.session.orders();
    lock(&orders).apply_server(order("A", OrderStatus::Pending));
    let _ctx = SyncContext::builder("order:A", h.channel.clone(), h.session.notifier().clone())
        .orders(orders.clone())
        .start()
        .await
        .unwrap();

    let recorded = lock(&orders)
        .apply_optimistic(
            "A",
            "status",
            Arc::new(|o: &mut Order| o.status = OrderStatus::Cancelled),
        )
        .unwrap();
    h.channel.push(PushEvent::new(
        "paymentStatusUpdated",
        json!({"orderId": "A", "paymentStatus": "paid"}),
    ));
    settle().await;
    {
        let rec = lock(&orders);
        let shown = rec.get("A").unwrap();
        assert_eq!(shown.status, OrderStatus::Cancelled);
        assert_eq!(shown.payment_status, PaymentStatus::Paid);
    }

    lock(&orders).reject(recorded.intent);
    let shown = h.session.order("A").unwrap();
    assert_eq!(shown.status, OrderStatus::Pending);
    assert_eq!(shown.payment_status, PaymentStatus::Paid);
    h.drain();
}

#[tokio::test]
async fn test_expired_intent_rolls_back() {
    let mut h = Harness::connected().await;
    let orders = h.session.orders();
    lock(&orders).apply_server(order("A", OrderStatus::Pending));
    lock(&orders)
        .apply_optimistic(
            "A",
            "status",
            Arc::new(|o: &mut Order| o.status = OrderStatus::Cancelled),
        )
        .unwrap();

    assert_eq!(h.session.expire_pending(Duration::ZERO), 1);
    assert_eq!(h.session.order("A").unwrap().status, OrderStatus::Pending);
    assert_eq!(
        h.drain(),
        vec![Notification::MutationRejected {
            entity_kind: "order",
            entity_id: "A".into(),
            reason: "No confirmation from the server".into(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_intent_expires_once_max_age_elapses() {
    let mut h = Harness::connected().await;
    let orders = h.session.orders();
    lock(&orders).apply_server(order("A", OrderStatus::Pending));
    lock(&orders)
        .apply_optimistic(
            "A",
            "status",
            Arc::new(|o: &mut Order| o.status = OrderStatus::Cancelled),
        )
        .unwrap();
    let max_age = Duration::from_secs(30);

    tokio::time::advance(Duration::from_secs(29)).await;
    assert_eq!(h.session.expire_pending(max_age), 0);
    assert_eq!(h.session.order("A").unwrap().status, OrderStatus::Cancelled);
    assert!(h.drain().is_empty());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(h.session.expire_pending(max_age), 1);
    assert_eq!(h.session.order("A").unwrap().status, OrderStatus::Pending);
    assert_eq!(
        h.drain(),
        vec![Notification::MutationRejected {
            entity_kind: "order",
            entity_id: "A".into(),
            reason: "No confirmation from the server".into(),
        }]
    );
}

#[tokio::test]
async fn test_send_message_confirmed_by_ack() {
    let mut h = Harness::connected().await;

    let sent = h.session.send_message("c1", "u1", "u2", "hello").await.unwrap();

    assert_eq!(sent.id, "ws-1");
    let chat = h.session.chat_messages("c1");
    assert_eq!(chat.len(), 1);
    assert_eq!(chat[0].id, "ws-1");
    assert_eq!(h.api.calls("send_message"), 0);
    let notes = h.drain();
    assert!(matches!(
        &notes[..],
        [Notification::MessageConfirmed { provisional_id, message_id, .. }]
            if provisional_id.starts_with(PROVISIONAL_PREFIX) && message_id == "ws-1"
    ));
}

#[tokio::test]
async fn test_send_message_falls_back_to_rest() {
    let mut h = Harness::connected().await;
    *h.channel.ack.lock().unwrap() = AckMode::Timeout;

    let sent = h.session.send_message("c1", "u1", "u2", "hello").await.unwrap();

    assert_eq!(sent.id, "rest-1");
    assert_eq!(h.channel.requests.lock().unwrap().len(), 1);
    assert_eq!(h.api.calls("send_message"), 1);
    let chat = h.session.chat_messages("c1");
    assert_eq!(chat.len(), 1);
    assert!(!chat[0].is_provisional());
    assert_eq!(lock(&h.session.messages()).pending_count(), 0);
    assert_eq!(h.drain().len(), 1);
}

#[tokio::test]
async fn test_unreadable_ack_falls_back_to_rest() {
    let mut h = Harness::connected().await;
    *h.channel.ack.lock().unwrap() = AckMode::Garbled;

    let sent = h.session.send_message("c1", "u1", "u2", "hello").await.unwrap();

    assert_eq!(sent.id, "rest-1");
    assert_eq!(h.api.calls("send_message"), 1);
    let chat = h.session.chat_messages("c1");
    assert_eq!(chat.len(), 1);
    assert_eq!(chat[0].id, "rest-1");
    assert_eq!(lock(&h.session.messages()).pending_count(), 0);
    assert!(matches!(
        &h.drain()[..],
        [Notification::MessageConfirmed { message_id, .. }] if message_id == "rest-1"
    ));
}

#[tokio::test]
async fn test_bare_ack_waits_for_push_to_swap() {
    let mut h = Harness::connected().await;
    let _ctx = h.session.chat_context("c1").await.unwrap();
    settle().await;
    *h.channel.ack.lock().unwrap() = AckMode::Bare;

    let provisional = h.session.send_message("c1", "u1", "u2", "hi").await.unwrap();
    assert!(provisional.is_provisional());
    assert_eq!(h.session.chat_messages("c1"), vec![provisional.clone()]);

    h.channel.push(PushEvent::new(
        "newMessage",
        json!({"message": {
            "_id": "srv-9",
            "chatId": "c1",
            "senderId": "u1",
            "receiverId": "u2",
            "body": "hi",
            "nonce": provisional.nonce.clone(),
        }}),
    ));
    settle().await;

    let chat = h.session.chat_messages("c1");
    assert_eq!(chat.len(), 1);
    assert_eq!(chat[0].id, "srv-9");
    assert_eq!(lock(&h.session.messages()).pending_count(), 0);
    assert!(h.drain().contains(&Notification::MessageConfirmed {
        chat_id: "c1".into(),
        provisional_id: provisional.id.clone(),
        message_id: "srv-9".into(),
    }));
}

#[tokio::test]
async fn test_send_message_refused_removes_provisional() {
    let mut h = Harness::connected().await;
    *h.channel.ack.lock().unwrap() =
        AckMode::Fail(Error::client_error(422, "Chat closed".into(), None));

    let err = h.session.send_message("c1", "u1", "u2", "hello").await.unwrap_err();

    assert!(matches!(err, Error::MutationRejected { .. }));
    assert!(h.session.chat_messages("c1").is_empty());
    assert_eq!(h.api.calls("send_message"), 0);
    let notes = h.drain();
    assert!(matches!(
        &notes[..],
        [Notification::MutationRejected { entity_kind: "chat_message", reason, .. }] if reason == "Chat closed"
    ));
}

#[tokio::test]
async fn test_submit_order_clears_cart_and_adds_order() {
    let api = MockApi::new();
    api.server_cart.lock().unwrap().add("p1", 2, 3.0);
    *api.place_result.lock().unwrap() = Ok(order("N1", OrderStatus::Pending));
    let mut h = Harness::open(api, MockChannel::new()).await;
    h.session.refresh_cart().await.unwrap();

    let placed = h.session.submit_order(&PlaceOrderRequest::default()).await.unwrap();

    assert_eq!(placed.id, "N1");
    assert!(h.session.cart_snapshot().lines.is_empty());
    assert!(h.session.order("N1").is_some());
    assert_eq!(
        h.drain(),
        vec![Notification::OrderStatusChanged {
            order_id: "N1".into(),
            previous: None,
            current: OrderStatus::Pending,
        }]
    );
}

#[tokio::test]
async fn test_submit_order_refused_restores_cart() {
    let api = MockApi::new();
    api.server_cart.lock().unwrap().add("p1", 2, 3.0);
    *api.place_result.lock().unwrap() = Err(Error::client_error(400, "Out of stock".into(), None));
    let mut h = Harness::open(api, MockChannel::new()).await;
    let before = h.session.refresh_cart().await.unwrap();

    assert!(h.session.submit_order(&PlaceOrderRequest::default()).await.is_err());

    assert_eq!(h.session.cart_snapshot(), before);
    assert_eq!(
        h.drain(),
        vec![Notification::MutationRejected {
            entity_kind: "cart",
            entity_id: CART_ID.into(),
            reason: "Out of stock".into(),
        }]
    );
}

#[tokio::test]
async fn test_add_to_cart_clicks_coalesce() {
    let h = Harness::open(MockApi::gated(), MockChannel::new()).await;
    let gate = async {
        tokio::task::yield_now().await;
        // the first click is in flight, the other two are folded
        let cart = h.session.cart_snapshot();
        assert_eq!(cart.lines[0].quantity, 6);
        h.api.gate.as_ref().unwrap().add_permits(2);
    };

    let (a, b, c, ()) = tokio::join!(
        h.session.add_to_cart("p1", 1, 2.0),
        h.session.add_to_cart("p1", 2, 2.0),
        h.session.add_to_cart("p1", 3, 2.0),
        gate,
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    // the follow-up request runs on its own task
    settle().await;

    let quantities: Vec<u32> = h
        .api
        .add_requests
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.quantity)
        .collect();
    assert_eq!(quantities, vec![1, 5]);
    let cart: Cart = h.session.cart_snapshot();
    assert_eq!(cart.lines.len(), 1);
    assert_eq!(cart.lines[0].quantity, 6);
    assert_eq!(lock(&h.session.cart()).pending_count(), 0);
}

#[tokio::test]
async fn test_abandoned_add_to_cart_still_sends_later_clicks() {
    let h = Harness::open(MockApi::gated(), MockChannel::new()).await;

    let first = tokio::time::timeout(
        Duration::from_millis(20),
        h.session.add_to_cart("p1", 1, 2.0),
    )
    .await;
    assert!(first.is_err());

    h.api.gate.as_ref().unwrap().add_permits(2);
    h.session.add_to_cart("p1", 2, 2.0).await.unwrap();
    settle().await;

    let quantities: Vec<u32> = h
        .api
        .add_requests
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.quantity)
        .collect();
    assert_eq!(quantities, vec![1, 2]);
    assert_eq!(lock(&h.session.cart()).pending_count(), 0);
    assert_eq!(h.session.cart_snapshot().lines[0].quantity, 3);
}

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_closed_context_stops_applying() {
    let h = Harness::connected().await;
    let orders = h.session.orders();
    lock(&orders).apply_server(order("A", OrderStatus::Pending));
    let mut ctx = h.session.order_context("A").await.unwrap();
    settle().await;
    assert_eq!(h.channel.listener_count(), 1);

    ctx.close();
    ctx.close();
    settle().await;

    assert_eq!(ctx.state(), ContextState::Closed);
    assert_eq!(h.channel.listener_count(), 0);
    assert!(h.channel.joined.lock().unwrap().is_empty());
    assert!(h.channel.emitted.lock().unwrap().contains(&OutboundEvent::LeaveContext {
        room: "order:A".into()
    }));

    assert_eq!(h.channel.push(status_event("statusUpdated", "A", "Delivered")), 0);
    settle().await;
    assert_eq!(h.session.order("A").unwrap().status, OrderStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_detaches_everything() {
    let h = Harness::connected().await;
    let _ctx = h.session.orders_context().await.unwrap();
    settle().await;
    let polls = h.api.calls("list_orders");
    assert_eq!(polls, 1);

    h.session.teardown().await;
    h.session.teardown().await;

    assert!(h.session.is_closed());
    assert_eq!(h.channel.listener_count(), 0);
    assert_eq!(h.channel.health().state(), LinkState::Closed);
    assert_eq!(
        lock(&h.session.orders()).apply_server(order("A", OrderStatus::Pending)),
        ApplyOutcome::Detached
    );
    assert!(h.session.order("A").is_none());
    assert!(matches!(h.session.cancel_order("A").await, Err(Error::ContextClosed)));
    assert!(matches!(h.session.orders_context().await, Err(Error::ContextClosed)));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.api.calls("list_orders"), polls);
}

#[tokio::test(start_paused = true)]
async fn test_context_state_follows_link_and_polls() {
    let api = MockApi::new();
    *api.list_error.lock().unwrap() = Some(Error::server_error(503, "busy".into()));
    let h = Harness::open(api, MockChannel::new()).await;
    let mut ctx = h.session.orders_context().await.unwrap();
    let mut states = ctx.subscribe();
    assert_eq!(ctx.state(), ContextState::Live);

    settle().await;
    h.channel.drop_link();
    settle().await;
    assert_eq!(ctx.state(), ContextState::Degraded);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ContextState::Degraded);

    // next poll confirms the backend is reachable
    *h.api.list_error.lock().unwrap() = None;
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(ctx.state(), ContextState::Live);

    h.channel.restore_link();
    settle().await;
    assert_eq!(ctx.state(), ContextState::Live);

    ctx.close();
    assert_eq!(ctx.state(), ContextState::Closed);
    assert!(ctx.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_poll_interval_tracks_link() {
    let mut h = Harness::connected().await;
    let _ctx = h.session.orders_context().await.unwrap();
    settle().await;
    assert_eq!(h.api.calls("list_orders"), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.api.calls("list_orders"), 1);

    // lost at ~10s: the 3s cadence is already overdue
    h.channel.drop_link();
    settle().await;
    assert_eq!(h.api.calls("list_orders"), 2);
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(h.api.calls("list_orders"), 3);

    // back at ~13.5s: next poll 15s after the last one
    h.channel.restore_link();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.api.calls("list_orders"), 3);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.api.calls("list_orders"), 4);

    let links: Vec<Notification> = std::iter::from_fn(|| h.notifications.try_recv().ok())
        .filter(|n| matches!(n, Notification::Link(_)))
        .collect();
    assert_eq!(
        links,
        vec![
            Notification::Link(crate::sync::LinkEvent::Disconnected),
            Notification::Link(crate::sync::LinkEvent::Connected),
        ]
    );
}

#[tokio::test]
async fn test_failed_connect_degrades_instead_of_failing() {
    let channel = MockChannel::new();
    channel.fail_connect.store(true, Ordering::SeqCst);
    let mut h = Harness::open(MockApi::new(), channel).await;

    assert_eq!(h.channel.health().state(), LinkState::Degraded);
    assert_eq!(
        h.notifications.try_recv().unwrap(),
        Notification::Link(crate::sync::LinkEvent::Degraded)
    );

    // joining fails, the context runs on polling alone
    let ctx = h.session.order_context("A").await.unwrap();
    settle().await;
    assert_eq!(ctx.state(), ContextState::Degraded);
    assert_eq!(h.api.calls("order_detail"), 1);

    h.channel.fail_connect.store(false, Ordering::SeqCst);
    h.session.connect().await.unwrap();
    assert_eq!(h.channel.health().state(), LinkState::Connected);
}

#[tokio::test]
async fn test_push_channel_recovers_without_manual_connect() {
    let reserve = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserve.local_addr().unwrap();
    drop(reserve);

    let channel = ConnectionManager::with_config(
        format!("ws://{addr}"),
        ConnectionConfig {
            reconnection: ReconnectionConfig {
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
                max_reconnect_attempts: 0,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    let (session, mut notifications) = Session::open(
        Arc::new(MockApi::new()),
        Arc::new(channel),
        Arc::new(MemoryTokenStore::new(Some("t0k3n".into()))),
        SessionSettings::default(),
    )
    .await
    .unwrap();
    assert_eq!(
        notifications.recv().await,
        Some(Notification::Link(LinkEvent::Degraded))
    );
    assert_eq!(session.channel().health().state(), LinkState::Reconnecting);

    let server = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let (tcp, _) = server.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let recovered = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(n) = notifications.recv().await {
            if n == Notification::Link(LinkEvent::Connected) {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(recovered, Ok(true));
    assert!(session.channel().health().state().is_connected());
    session.teardown().await;
}
