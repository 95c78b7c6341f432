//! Storefront REST API.

mod rest_client;
mod sources;

use async_trait::async_trait;

pub use rest_client::RestClient;
pub use sources::{ChatSource, OrderDetailSource, OrderListSource};

use crate::prelude::Result;
use crate::types::{
    AddToCart, Cart, ChatMessage, ChatUser, Order, PlaceOrderRequest, SendMessageRequest,
};

/// Request/response operations against the storefront backend.
#[async_trait]
pub trait StorefrontApi: Send + Sync {
    async fn list_orders(&self) -> Result<Vec<Order>>;

    async fn order_detail(&self, order_id: &str) -> Result<Order>;

    /// Returns the updated order when the backend sends one back.
    async fn cancel_order(&self, order_id: &str) -> Result<Option<Order>>;

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<Order>;

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>>;

    async fn send_message(&self, request: &SendMessageRequest) -> Result<ChatMessage>;

    async fn chat_users(&self) -> Result<Vec<ChatUser>>;

    async fn cart(&self) -> Result<Cart>;

    async fn add_to_cart(&self, request: &AddToCart) -> Result<Cart>;

    async fn clear_cart(&self) -> Result<()>;
}
