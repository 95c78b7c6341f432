//! The entity abstraction shared by every synchronized type.

use std::fmt;

/// A synchronized domain object: stable identifier, enumerated status,
/// mutable payload.
///
/// There is no version marker beyond the payload itself, so payload
/// equality is what distinguishes a real change from a replayed one.
pub trait Entity: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    type Status: Copy + Eq + fmt::Debug + Send + Sync;

    /// Short name used in logs and notifications.
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn status(&self) -> Self::Status;

    /// Client-side correlation key, present on entities the client created
    /// optimistically and the server echoed back.
    fn correlation_key(&self) -> Option<&str> {
        None
    }
}

/// Result of applying one value to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome<E> {
    /// New identifier
    Inserted,
    /// Existing identifier with a different payload
    Updated { previous: E },
    /// Identical payload already present
    Unchanged,
    /// Store is closed; nothing was applied
    Detached,
}

impl<E> ApplyOutcome<E> {
    /// Whether the store's visible state changed.
    pub fn changed(&self) -> bool {
        matches!(self, ApplyOutcome::Inserted | ApplyOutcome::Updated { .. })
    }

    pub fn previous(&self) -> Option<&E> {
        match self {
            ApplyOutcome::Updated { previous } => Some(previous),
            _ => None,
        }
    }
}

/// How a list response is merged into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Merge by identifier; entities absent from the response are kept.
    Partial,
    /// The response is the full set for its scope; in-scope entities absent
    /// from it are removed unless a pending optimistic operation protects them.
    Authoritative,
}

/// Counts from one batch merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: Vec<String>,
    /// Entities kept despite being absent because an optimistic operation
    /// is still pending on them
    pub protected: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.updated > 0 || !self.removed.is_empty()
    }
}
