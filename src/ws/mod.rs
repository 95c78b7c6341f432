mod message_types;
mod ws_manager;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc::UnboundedReceiver};

pub use message_types::{
    Frame, MessageReadPayload, OrderStatusPayload, OutboundEvent, PaymentStatusPayload, PushEvent,
    TypingPayload,
};
pub use ws_manager::{ConnectionConfig, ConnectionManager};

use crate::auth::Credentials;
use crate::prelude::Result;
use crate::sync::{ConnectionHealthMonitor, LinkEvent};

pub type ListenerId = u32;

/// A registered push event listener. Dropping the receiver does not
/// unregister it; call [`PushChannel::release`].
#[derive(Debug)]
pub struct Listener {
    pub id: ListenerId,
    pub events: UnboundedReceiver<Arc<PushEvent>>,
}

/// The persistent bidirectional connection to the backend.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Open the channel unless it is already open.
    async fn connect(&self, credentials: &Credentials) -> Result<()>;

    /// Tear the channel down and release every listener.
    async fn disconnect(&self);

    fn listen(&self) -> Listener;

    fn release(&self, id: ListenerId) -> Result<()>;

    /// Fire-and-forget outbound event.
    async fn emit(&self, event: OutboundEvent) -> Result<()>;

    /// Send an event and wait for its acknowledgement payload.
    async fn request(&self, event: OutboundEvent, timeout: Duration) -> Result<Value>;

    /// Emit a join event and replay it after every reconnect.
    async fn join(&self, event: OutboundEvent) -> Result<()>;

    /// Stop replaying a join event.
    fn forget(&self, event: &OutboundEvent);

    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;

    fn health(&self) -> ConnectionHealthMonitor;
}
