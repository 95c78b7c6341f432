//! Live entity synchronization.
//!
//! Push events, poll responses and local optimistic intents all reach an
//! [`EntityStore`] through one [`Reconciler`] per entity kind.

mod coalescer;
mod context;
mod dedup;
mod entity;
mod notify;
mod optimistic;
mod poller;
mod reconcile;
mod reconnection;
mod router;
mod state;
mod store;

#[cfg(test)]
mod tests;

pub use coalescer::{Coalesce, Coalescer, Submitted};
pub use context::{ContextBuilder, SyncContext};
pub use dedup::RecencySet;
pub use entity::{ApplyOutcome, Entity, MergePolicy, MergeReport};
pub use notify::{LinkEvent, Notification, Notifier};
pub use optimistic::{IntentId, OptimisticLedger, Patch, PatchKey, Recorded, Settled};
pub use poller::{FallbackPoller, PollOutcome, PollPolicy, SnapshotSource};
pub use reconcile::{lock, Reconciler, Rollback, SharedReconciler};
pub use reconnection::{
    calculate_backoff_delay, reconnect_with_backoff, ConnectionHealthMonitor, HealthSummary,
    LinkState, ReconnectionConfig,
};
pub use router::{
    AliasTable, CanonicalEvent, EventRouter, RouteTargets, RoutedEvent, RouterConfig, TypingState,
};
pub use state::{ContextEvent, ContextState};
pub use store::EntityStore;
