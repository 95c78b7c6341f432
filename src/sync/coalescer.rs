//! Single-slot request coalescing.
//!
//! While one request is in flight, later intents fold into a single pending
//! slot instead of queuing. When the in-flight request completes the slot is
//! handed back for dispatch.

/// A value that can absorb a later value of the same kind.
pub trait Coalesce {
    fn absorb(&mut self, later: Self);
}

/// Outcome of submitting an intent.
#[derive(Debug, PartialEq)]
pub enum Submitted<T> {
    /// Nothing in flight: the caller dispatches this now.
    Dispatch(T),
    /// Folded into the pending slot; whoever owns the in-flight request
    /// dispatches it later.
    Coalesced,
}

#[derive(Debug)]
pub struct Coalescer<T> {
    in_flight: bool,
    pending: Option<T>,
}

impl<T: Coalesce> Coalescer<T> {
    pub fn new() -> Self {
        Self {
            in_flight: false,
            pending: None,
        }
    }

    pub fn submit(&mut self, intent: T) -> Submitted<T> {
        if !self.in_flight {
            self.in_flight = true;
            return Submitted::Dispatch(intent);
        }
        match &mut self.pending {
            Some(pending) => pending.absorb(intent),
            None => self.pending = Some(intent),
        }
        Submitted::Coalesced
    }

    /// Mark the in-flight request done. Returns the coalesced intent to
    /// dispatch next, which is then considered in flight.
    pub fn complete(&mut self) -> Option<T> {
        match self.pending.take() {
            Some(next) => Some(next),
            None => {
                self.in_flight = false;
                None
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.in_flight
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl<T: Coalesce> Default for Coalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}
