//! Poll sources backed by the REST API.

use std::sync::Arc;

use async_trait::async_trait;

use super::StorefrontApi;
use crate::prelude::Result;
use crate::sync::{MergePolicy, SnapshotSource};
use crate::types::{ChatMessage, Order};

/// The signed-in user's full order list. Orders missing from it are gone.
pub struct OrderListSource {
    api: Arc<dyn StorefrontApi>,
}

impl OrderListSource {
    pub fn new(api: Arc<dyn StorefrontApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl SnapshotSource<Order> for OrderListSource {
    fn name(&self) -> String {
        "orders".to_string()
    }

    async fn fetch(&self) -> Result<Vec<Order>> {
        self.api.list_orders().await
    }

    fn policy(&self) -> MergePolicy {
        MergePolicy::Authoritative
    }
}

/// One order's detail. Says nothing about other orders.
pub struct OrderDetailSource {
    api: Arc<dyn StorefrontApi>,
    order_id: String,
}

impl OrderDetailSource {
    pub fn new(api: Arc<dyn StorefrontApi>, order_id: impl Into<String>) -> Self {
        Self {
            api,
            order_id: order_id.into(),
        }
    }
}

#[async_trait]
impl SnapshotSource<Order> for OrderDetailSource {
    fn name(&self) -> String {
        format!("order:{}", self.order_id)
    }

    async fn fetch(&self) -> Result<Vec<Order>> {
        Ok(vec![self.api.order_detail(&self.order_id).await?])
    }

    fn policy(&self) -> MergePolicy {
        MergePolicy::Partial
    }
}

/// One chat's message history, authoritative for that chat only.
pub struct ChatSource {
    api: Arc<dyn StorefrontApi>,
    chat_id: String,
}

impl ChatSource {
    pub fn new(api: Arc<dyn StorefrontApi>, chat_id: impl Into<String>) -> Self {
        Self {
            api,
            chat_id: chat_id.into(),
        }
    }
}

#[async_trait]
impl SnapshotSource<ChatMessage> for ChatSource {
    fn name(&self) -> String {
        format!("chat:{}", self.chat_id)
    }

    async fn fetch(&self) -> Result<Vec<ChatMessage>> {
        self.api.list_messages(&self.chat_id).await
    }

    fn policy(&self) -> MergePolicy {
        MergePolicy::Authoritative
    }

    fn in_scope(&self, message: &ChatMessage) -> bool {
        message.chat_id == self.chat_id
    }
}
