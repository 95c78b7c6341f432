//! Storefront entity and payload types.
//!
//! These are the shapes consumed from REST responses and push events; the
//! backend owns everything else about them.

mod cart;
mod chat;
mod orders;

pub use cart::*;
pub use chat::*;
pub use orders::*;
