//! Order-related types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::serde_utils::{deserialize_id, deserialize_opt_id};
use crate::sync::Entity;

/// Order lifecycle status.
///
/// `Pending → Preparation → Ontheway → Delivered`, with `Cancelled` reachable
/// from any non-terminal state. The synchronizer trusts the server and does
/// not enforce these transitions.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    #[default]
    #[serde(alias = "pending")]
    Pending,
    #[serde(alias = "preparation", alias = "Processing", alias = "processing")]
    Preparation,
    #[serde(alias = "ontheway", alias = "OnTheWay", alias = "Shipped", alias = "shipped")]
    Ontheway,
    #[serde(alias = "delivered")]
    Delivered,
    #[serde(alias = "cancelled", alias = "Canceled", alias = "canceled")]
    Cancelled,
}

impl OrderStatus {
    /// Delivered and Cancelled accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Whether a cancel request may be sent from this status. The server has
    /// the final word; this only gates the optimistic path.
    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }

    /// Position in the forward lifecycle, `None` for Cancelled.
    pub fn progress(&self) -> Option<u8> {
        match self {
            OrderStatus::Pending => Some(0),
            OrderStatus::Preparation => Some(1),
            OrderStatus::Ontheway => Some(2),
            OrderStatus::Delivered => Some(3),
            OrderStatus::Cancelled => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "Pending"),
            OrderStatus::Preparation => write!(f, "Preparation"),
            OrderStatus::Ontheway => write!(f, "Ontheway"),
            OrderStatus::Delivered => write!(f, "Delivered"),
            OrderStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Payment status. A failed payment leaves the order unpaid.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    #[serde(alias = "Unpaid", alias = "failed", alias = "pending")]
    Unpaid,
    #[serde(alias = "Paid", alias = "succeeded", alias = "success")]
    Paid,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Unpaid => write!(f, "unpaid"),
            PaymentStatus::Paid => write!(f, "paid"),
        }
    }
}

/// Line item of an order.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    #[serde(default, alias = "productId", deserialize_with = "deserialize_opt_id")]
    pub product_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default)]
    pub price: f64,
}

/// An order as returned by the backend.
///
/// Only `id` is required on the wire; every other field defaults so partial
/// payloads and locally created placeholders share one shape.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(alias = "_id", alias = "orderId", deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub user_id: String,
    #[serde(default, alias = "orderStatus")]
    pub status: OrderStatus,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default, alias = "totalPrice")]
    pub total_amount: f64,
    #[serde(default)]
    pub shipping_address: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Minimal local copy for an order first seen through a push event.
    /// The poller fills in the rest on its next tick.
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: String::new(),
            status: OrderStatus::default(),
            payment_status: PaymentStatus::default(),
            items: Vec::new(),
            total_amount: 0.0,
            shipping_address: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether this copy came from a push event and lacks the full payload.
    pub fn is_placeholder(&self) -> bool {
        self.items.is_empty() && self.created_at.is_none()
    }
}

impl Entity for Order {
    type Status = OrderStatus;
    const KIND: &'static str = "order";

    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> OrderStatus {
        self.status
    }
}

/// Body of a place-order request.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub items: Vec<OrderItem>,
    pub shipping_address: String,
    pub payment_method: String,
}
