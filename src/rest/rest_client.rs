use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::StorefrontApi;
use crate::{
    auth::TokenStore,
    prelude::*,
    req::HttpClient,
    serde_utils::{entities_from_value, entity_from_value},
    types::{AddToCart, Cart, ChatMessage, ChatUser, Order, PlaceOrderRequest, SendMessageRequest},
    Error,
};

/// REST paths, relative to the base URL.
mod paths {
    pub(super) const ORDERS: &str = "/orders";
    pub(super) const CHAT_USERS: &str = "/chats/users";
    pub(super) const CART: &str = "/cart";
    pub(super) const CART_ITEMS: &str = "/cart/items";

    pub(super) fn order(id: &str) -> String {
        format!("/orders/{id}")
    }

    pub(super) fn cancel_order(id: &str) -> String {
        format!("/orders/{id}/cancel")
    }

    pub(super) fn chat_messages(chat_id: &str) -> String {
        format!("/chats/{chat_id}/messages")
    }
}

/// The storefront backend over HTTP.
pub struct RestClient {
    http_client: HttpClient,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, tokens: Arc<dyn TokenStore>) -> Result<Self> {
        Ok(Self {
            http_client: HttpClient::new(base_url, timeout, tokens)?,
        })
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            http_client: HttpClient::with_client(client, base_url, tokens),
        }
    }

    pub fn base_url(&self) -> &str {
        self.http_client.base_url()
    }

    async fn get_list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let value = self.http_client.get(path).await?;
        entities_from_value(value)
    }

    async fn get_one<T: DeserializeOwned>(&self, path: &str, key: &str) -> Result<T> {
        let value = self.http_client.get(path).await?;
        entity_from_value(value, key)
    }

    async fn post_one<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B, key: &str) -> Result<T> {
        let body = serde_json::to_value(body).map_err(|e| Error::JsonParse(e.to_string()))?;
        let value = self.http_client.post(path, &body).await?;
        entity_from_value(value, key)
    }
}

#[async_trait]
impl StorefrontApi for RestClient {
    async fn list_orders(&self) -> Result<Vec<Order>> {
        self.get_list(paths::ORDERS).await
    }

    async fn order_detail(&self, order_id: &str) -> Result<Order> {
        self.get_one(&paths::order(order_id), "order").await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Option<Order>> {
        let value = self.http_client.put(&paths::cancel_order(order_id), None).await?;
        if value.is_null() {
            return Ok(None);
        }
        // some deployments answer with a bare acknowledgement
        Ok(entity_from_value(value, "order").ok())
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<Order> {
        self.post_one(paths::ORDERS, request, "order").await
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        let mut messages: Vec<ChatMessage> = self.get_list(&paths::chat_messages(chat_id)).await?;
        for m in messages.iter_mut().filter(|m| m.chat_id.is_empty()) {
            m.chat_id = chat_id.to_string();
        }
        Ok(messages)
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<ChatMessage> {
        let mut message: ChatMessage = self
            .post_one(&paths::chat_messages(&request.chat_id), request, "message")
            .await?;
        if message.chat_id.is_empty() {
            message.chat_id = request.chat_id.clone();
        }
        if message.nonce.is_none() {
            message.nonce = Some(request.nonce.clone());
        }
        Ok(message)
    }

    async fn chat_users(&self) -> Result<Vec<ChatUser>> {
        self.get_list(paths::CHAT_USERS).await
    }

    async fn cart(&self) -> Result<Cart> {
        self.get_one(paths::CART, "cart").await
    }

    async fn add_to_cart(&self, request: &AddToCart) -> Result<Cart> {
        self.post_one(paths::CART_ITEMS, request, "cart").await
    }

    async fn clear_cart(&self) -> Result<()> {
        self.http_client.delete(paths::CART).await.map(|_| ())
    }
}
