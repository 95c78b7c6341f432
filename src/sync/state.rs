//! Sync context lifecycle.

use std::fmt;

use crate::prelude::Result;
use crate::Error;

/// Lifecycle of one sync context.
///
/// `Uninitialized -> Syncing -> Live <-> Degraded`, with any state able to
/// reach the terminal `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    Uninitialized,
    /// Channel join and first poll in progress
    Syncing,
    /// Push channel connected and delivering
    Live,
    /// Push channel down, polling carries the context
    Degraded,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    Start,
    ConnectSucceeded,
    TransportFailed,
    PollSucceeded,
    Teardown,
}

impl ContextState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ContextState::Closed)
    }

    /// Whether fresh data is currently flowing into the context.
    pub fn is_synced(&self) -> bool {
        matches!(self, ContextState::Live)
    }

    /// Next state for `event`.
    ///
    /// Repeated events that leave the state unchanged are accepted, so link
    /// notifications can be forwarded without filtering.
    pub fn on(self, event: ContextEvent) -> Result<ContextState> {
        use ContextEvent::*;
        use ContextState::*;

        let next = match (self, event) {
            (Closed, Teardown) => Closed,
            (Closed, _) => return Err(Error::ContextClosed),
            (_, Teardown) => Closed,

            (Uninitialized, Start) => Syncing,

            (Syncing, ConnectSucceeded) | (Syncing, PollSucceeded) => Live,
            (Syncing, TransportFailed) => Degraded,

            (Live, ConnectSucceeded) | (Live, PollSucceeded) => Live,
            (Live, TransportFailed) => Degraded,

            (Degraded, ConnectSucceeded) | (Degraded, PollSucceeded) => Live,
            (Degraded, TransportFailed) => Degraded,

            (from, event) => {
                return Err(Error::InvalidTransition {
                    from: from.to_string(),
                    event: format!("{event:?}"),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Uninitialized => "uninitialized",
            ContextState::Syncing => "syncing",
            ContextState::Live => "live",
            ContextState::Degraded => "degraded",
            ContextState::Closed => "closed",
        };
        f.write_str(name)
    }
}
