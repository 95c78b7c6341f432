#![deny(unreachable_pub)]

//! Client-side real-time synchronization for a storefront.
//!
//! Orders, chat messages and the cart are kept in session-scoped stores fed
//! by three sources: push events over a WebSocket channel, REST polling, and
//! local optimistic intents. See [`session::Session`] for the entry point.

// Core modules
mod consts;
mod errors;
pub mod helpers;
mod prelude;
pub mod req;

// Shared utilities
pub mod auth;
pub mod config;
pub mod logging;
pub mod serde_utils;
pub mod types;

// Feature modules
pub mod rest;
pub mod session;
pub mod sync;
pub mod ws;

// Re-exports
pub use auth::{Credentials, FileTokenStore, MemoryTokenStore, TokenStore};
pub use config::SyncConfig;
pub use consts::{CART_ID, DEFAULT_API_URL, DEFAULT_WS_URL, PROVISIONAL_PREFIX};
pub use errors::{Error, HttpErrorKind};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use rest::{RestClient, StorefrontApi};
pub use session::{Session, SessionSettings};
pub use sync::{ContextState, LinkEvent, Notification, SyncContext};
pub use types::*;
pub use ws::{ConnectionConfig, ConnectionManager, PushChannel};
