//! User-visible notifications.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::types::{OrderStatus, PaymentStatus};

/// Push channel lifecycle, broadcast by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    /// Reconnect attempts exhausted
    Degraded,
}

/// One user-visible state change. Aliased or replayed events carrying the
/// same change produce a single notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    OrderStatusChanged {
        order_id: String,
        previous: Option<OrderStatus>,
        current: OrderStatus,
    },
    PaymentStatusChanged {
        order_id: String,
        current: PaymentStatus,
    },
    /// Order payload changed without a status change.
    OrderUpdated {
        order_id: String,
    },
    MessageReceived {
        chat_id: String,
        message_id: String,
    },
    /// A provisional message was replaced by the server's copy.
    MessageConfirmed {
        chat_id: String,
        provisional_id: String,
        message_id: String,
    },
    MessagesRead {
        chat_id: String,
        count: usize,
    },
    TypingChanged {
        chat_id: String,
        user_id: String,
        typing: bool,
    },
    /// An optimistic change was rolled back.
    MutationRejected {
        entity_kind: &'static str,
        entity_id: String,
        reason: String,
    },
    /// Polling failed repeatedly; sync with the backend is lost.
    SyncLost {
        context: String,
        consecutive_failures: u32,
    },
    SyncRestored {
        context: String,
    },
    Link(LinkEvent),
}

/// Sending half of the notification stream. Closed receivers are tolerated.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: UnboundedSender<Notification>,
}

impl Notifier {
    pub fn channel() -> (Self, UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn notify(&self, notification: Notification) {
        if let Err(e) = self.tx.send(notification) {
            trace!(dropped = ?e.0, "Notification receiver gone");
        }
    }
}
