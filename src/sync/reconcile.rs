//! Single reconciliation path for one entity type.
//!
//! Push events, poll results and request responses all funnel through a
//! [`Reconciler`]. It owns both the store and the optimistic ledger so that a
//! server value can never be written without pending patches being rebased on
//! top of it, and a rollback can never land on a stale baseline.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use super::entity::{ApplyOutcome, Entity, MergePolicy, MergeReport};
use super::optimistic::{IntentId, OptimisticLedger, Patch, PatchKey, Recorded, Settled};
use super::store::EntityStore;
use crate::prelude::Result;
use crate::Error;

/// Reconciler shared between a session, its contexts and their tasks.
pub type SharedReconciler<E> = Arc<Mutex<Reconciler<E>>>;

/// Lock a shared reconciler. A panic while holding the lock cannot leave
/// the store half-written (every write is a single map operation), so a
/// poisoned lock is recovered rather than propagated.
pub fn lock<E: Entity>(shared: &SharedReconciler<E>) -> MutexGuard<'_, Reconciler<E>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a rejected intent did to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Rollback<E> {
    /// The entity was restored to its baseline (plus other pending patches).
    Restored(E),
    /// A provisional entity was removed.
    Removed(E),
}

impl<E: Entity> Rollback<E> {
    pub fn entity(&self) -> &E {
        match self {
            Rollback::Restored(e) | Rollback::Removed(e) => e,
        }
    }
}

pub struct Reconciler<E: Entity> {
    store: EntityStore<E>,
    ledger: OptimisticLedger<E>,
}

impl<E: Entity> Reconciler<E> {
    pub fn new() -> Self {
        Self {
            store: EntityStore::new(),
            ledger: OptimisticLedger::new(),
        }
    }

    pub fn shared() -> SharedReconciler<E> {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn store(&self) -> &EntityStore<E> {
        &self.store
    }

    pub fn get(&self, id: &str) -> Option<&E> {
        self.store.get(id)
    }

    pub fn snapshot(&self) -> Vec<E> {
        self.store.snapshot()
    }

    pub fn pending_count(&self) -> usize {
        self.ledger.pending_count()
    }

    pub fn is_pending(&self, intent: IntentId) -> bool {
        self.ledger.is_pending(intent)
    }

    pub fn is_closed(&self) -> bool {
        self.store.is_closed()
    }

    /// Last server-confirmed value, ignoring optimistic patches.
    pub fn confirmed(&self, id: &str) -> Option<&E> {
        self.ledger.baseline(id).or_else(|| self.store.get(id))
    }

    /// Apply a server-originated value.
    ///
    /// Replaying the same value is a no-op. A value carrying the correlation
    /// key of a provisional entity replaces that entity; the outcome is then
    /// `Updated` with the provisional copy as `previous`.
    pub fn apply_server(&mut self, incoming: E) -> ApplyOutcome<E> {
        if self.store.is_closed() {
            return ApplyOutcome::Detached;
        }

        let mut replaced = None;
        if let Some(key) = incoming.correlation_key() {
            if let Some((intent, local_id)) = self.ledger.provisional_for(key) {
                if local_id != incoming.id() {
                    let local_id = local_id.to_string();
                    self.ledger.confirm(intent, None);
                    replaced = self.store.remove(&local_id);
                    debug!(kind = E::KIND, provisional = %local_id, id = incoming.id(), "Provisional entity confirmed");
                }
            }
        }

        let view = self.ledger.rebase(incoming);
        match (replaced, self.store.upsert(view)) {
            (Some(previous), ApplyOutcome::Inserted | ApplyOutcome::Unchanged) => {
                ApplyOutcome::Updated { previous }
            }
            (_, outcome) => outcome,
        }
    }

    /// Apply a server change expressed as a mutation of the confirmed value.
    /// Entities not yet known are created with `create` first.
    pub fn apply_server_change(
        &mut self,
        id: &str,
        create: impl FnOnce() -> E,
        change: impl FnOnce(&mut E),
    ) -> ApplyOutcome<E> {
        let mut value = self.confirmed(id).cloned().unwrap_or_else(create);
        change(&mut value);
        self.apply_server(value)
    }

    /// Merge a list response. `in_scope` limits which local entities an
    /// authoritative response may remove.
    pub fn apply_batch(
        &mut self,
        batch: Vec<E>,
        policy: MergePolicy,
        in_scope: impl Fn(&E) -> bool,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        if self.store.is_closed() {
            return report;
        }

        let seen: HashSet<String> = batch.iter().map(|e| e.id().to_string()).collect();
        for entity in batch {
            match self.apply_server(entity) {
                ApplyOutcome::Inserted => report.inserted += 1,
                ApplyOutcome::Updated { .. } => report.updated += 1,
                ApplyOutcome::Unchanged => report.unchanged += 1,
                ApplyOutcome::Detached => {}
            }
        }

        if policy == MergePolicy::Authoritative {
            let absent: Vec<String> = self
                .store
                .iter()
                .filter(|e| in_scope(e) && !seen.contains(e.id()))
                .map(|e| e.id().to_string())
                .collect();
            for id in absent {
                if self.ledger.protects(&id) {
                    report.protected += 1;
                } else if self.store.remove(&id).is_some() {
                    report.removed.push(id);
                }
            }
        }

        trace!(kind = E::KIND, ?policy, ?report, "Batch merged");
        report
    }

    /// Apply a local patch immediately and remember how to undo it.
    pub fn apply_optimistic(
        &mut self,
        id: &str,
        field: &str,
        patch: Patch<E>,
    ) -> Result<Recorded> {
        if self.store.is_closed() {
            return Err(Error::ContextClosed);
        }
        let current = self
            .confirmed(id)
            .cloned()
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;

        let recorded = self.ledger.record(PatchKey::new(id, field), &current, patch);
        if let Some(view) = self.ledger.view(id) {
            self.store.upsert(view);
        }
        debug!(kind = E::KIND, id, field, intent = %recorded.intent, superseded = ?recorded.superseded, "Optimistic patch applied");
        Ok(recorded)
    }

    /// Insert a locally created entity ahead of server confirmation.
    pub fn insert_provisional(&mut self, entity: E) -> Result<IntentId> {
        if self.store.is_closed() {
            return Err(Error::ContextClosed);
        }
        let intent = self.ledger.record_provisional(&entity);
        self.store.upsert(entity);
        Ok(intent)
    }

    /// Settle an intent as accepted.
    ///
    /// A superseded intent's response carries no authority over the pending
    /// patch; its payload, if any, is treated as an ordinary server update.
    pub fn confirm(&mut self, intent: IntentId, server: Option<E>) -> ApplyOutcome<E> {
        match self.ledger.confirm(intent, server.clone()) {
            Settled::Patch { view, .. } => self.store.upsert(view),
            Settled::Provisional { entity_id } => match server {
                Some(real) => {
                    let provisional = self.store.remove(&entity_id);
                    match (provisional, self.apply_server(real)) {
                        (Some(previous), ApplyOutcome::Inserted | ApplyOutcome::Unchanged) => {
                            ApplyOutcome::Updated { previous }
                        }
                        (_, outcome) => outcome,
                    }
                }
                None => ApplyOutcome::Unchanged,
            },
            Settled::Stale => match server {
                Some(value) => self.apply_server(value),
                None => ApplyOutcome::Unchanged,
            },
        }
    }

    /// Settle an intent as refused and roll the store back. `None` when the
    /// intent was already superseded or resolved.
    pub fn reject(&mut self, intent: IntentId) -> Option<Rollback<E>> {
        match self.ledger.reject(intent) {
            Settled::Patch { view, .. } => {
                self.store.upsert(view.clone());
                Some(Rollback::Restored(view))
            }
            Settled::Provisional { entity_id } => {
                self.store.remove(&entity_id).map(Rollback::Removed)
            }
            Settled::Stale => None,
        }
    }

    /// Intents pending for longer than `max_age`.
    pub fn expired(&self, max_age: Duration) -> Vec<IntentId> {
        self.ledger.expired(max_age)
    }

    /// Detach: pending operations are dropped and every later write is ignored.
    pub fn close(&mut self) {
        self.ledger.clear();
        self.store.close();
    }
}

impl<E: Entity> Default for Reconciler<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, MessageStatus, Order, OrderStatus};

    fn cancel() -> Patch<Order> {
        Arc::new(|o: &mut Order| o.status = OrderStatus::Cancelled)
    }

    #[test]
    fn test_apply_server_is_idempotent() {
        let mut rec = Reconciler::new();
        let order = Order::placeholder("A").with_status(OrderStatus::Preparation);
        assert_eq!(rec.apply_server(order.clone()), ApplyOutcome::Inserted);
        assert_eq!(rec.apply_server(order.clone()), ApplyOutcome::Unchanged);
        assert_eq!(rec.snapshot(), vec![order]);
    }

    #[test]
    fn test_server_update_during_pending_patch_rebases() {
        let mut rec = Reconciler::new();
        rec.apply_server(Order::placeholder("A"));
        let recorded = rec.apply_optimistic("A", "status", cancel()).unwrap();
        assert_eq!(rec.get("A").unwrap().status, OrderStatus::Cancelled);

        let mut moved = Order::placeholder("A").with_status(OrderStatus::Preparation);
        moved.total_amount = 3.0;
        rec.apply_server(moved.clone());
        // the optimistic status survives the server update
        assert_eq!(rec.get("A").unwrap().status, OrderStatus::Cancelled);
        assert_eq!(rec.get("A").unwrap().total_amount, 3.0);

        let rollback = rec.reject(recorded.intent).unwrap();
        assert_eq!(rollback, Rollback::Restored(moved.clone()));
        assert_eq!(rec.get("A"), Some(&moved));
    }

    #[test]
    fn test_status_change_applies_to_confirmed_value() {
        let mut rec = Reconciler::new();
        rec.apply_server(Order::placeholder("A"));
        rec.apply_optimistic("A", "status", cancel()).unwrap();
        rec.apply_server_change("A", || Order::placeholder("A"), |o| {
            o.shipping_address = Some("road".into())
        });
        assert_eq!(rec.confirmed("A").unwrap().status, OrderStatus::Pending);
        assert_eq!(rec.get("A").unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_unknown_entity_created_by_change() {
        let mut rec = Reconciler::new();
        let outcome = rec.apply_server_change(
            "B",
            || Order::placeholder("B"),
            |o| o.status = OrderStatus::Ontheway,
        );
        assert_eq!(outcome, ApplyOutcome::Inserted);
        assert_eq!(rec.get("B").unwrap().status, OrderStatus::Ontheway);
    }

    #[test]
    fn test_merge_policies() {
        let build = || {
            let mut rec = Reconciler::new();
            rec.apply_server(Order::placeholder("A"));
            rec.apply_server(Order::placeholder("B"));
            rec.apply_server(Order::placeholder("C"));
            rec
        };
        let batch = vec![
            Order::placeholder("A").with_status(OrderStatus::Preparation),
            Order::placeholder("B"),
        ];

        let mut partial = build();
        let report = partial.apply_batch(batch.clone(), MergePolicy::Partial, |_| true);
        assert_eq!(report.updated, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(partial.store().ids(), vec!["A", "B", "C"]);

        let mut authoritative = build();
        let report = authoritative.apply_batch(batch, MergePolicy::Authoritative, |_| true);
        assert_eq!(report.removed, vec!["C".to_string()]);
        assert_eq!(authoritative.store().ids(), vec!["A", "B"]);
    }

    #[test]
    fn test_authoritative_merge_keeps_protected_entities() {
        let mut rec = Reconciler::new();
        let local = ChatMessage::provisional("c1", "u1", "u2", "hi");
        rec.insert_provisional(local.clone()).unwrap();
        let report = rec.apply_batch(Vec::new(), MergePolicy::Authoritative, |_| true);
        assert_eq!(report.protected, 1);
        assert!(rec.get(&local.id).is_some());
    }

    #[test]
    fn test_authoritative_merge_respects_scope() {
        let mut rec = Reconciler::new();
        let mut other = ChatMessage::provisional("c2", "u1", "u2", "elsewhere");
        other.id = "m-other".into();
        other.nonce = None;
        rec.apply_server(other);
        let report = rec.apply_batch(Vec::new(), MergePolicy::Authoritative, |m| m.chat_id == "c1");
        assert!(report.removed.is_empty());
        assert_eq!(rec.store().len(), 1);
    }

    #[test]
    fn test_provisional_swapped_by_echo() {
        let mut rec = Reconciler::new();
        let local = ChatMessage::provisional("c1", "u1", "u2", "hi");
        let intent = rec.insert_provisional(local.clone()).unwrap();

        let mut echoed = local.clone();
        echoed.id = "m-1".into();
        echoed.status = MessageStatus::Sent;
        let outcome = rec.apply_server(echoed.clone());
        assert_eq!(outcome.previous(), Some(&local));
        assert_eq!(rec.snapshot(), vec![echoed.clone()]);

        // the request response arriving afterwards changes nothing
        assert_eq!(rec.confirm(intent, Some(echoed)), ApplyOutcome::Unchanged);
        assert_eq!(rec.store().len(), 1);
    }

    #[test]
    fn test_provisional_rejected_is_removed() {
        let mut rec = Reconciler::new();
        let local = ChatMessage::provisional("c1", "u1", "u2", "hi");
        let intent = rec.insert_provisional(local.clone()).unwrap();
        assert_eq!(rec.reject(intent), Some(Rollback::Removed(local)));
        assert!(rec.store().is_empty());
        assert_eq!(rec.reject(intent), None);
    }

    #[test]
    fn test_optimistic_requires_known_entity() {
        let mut rec: Reconciler<Order> = Reconciler::new();
        assert!(matches!(
            rec.apply_optimistic("missing", "status", cancel()),
            Err(Error::EntityNotFound(_))
        ));
    }

    #[test]
    fn test_closed_reconciler_is_detached() {
        let mut rec = Reconciler::new();
        rec.apply_server(Order::placeholder("A"));
        rec.close();
        assert_eq!(rec.apply_server(Order::placeholder("B")), ApplyOutcome::Detached);
        assert!(matches!(
            rec.apply_optimistic("A", "status", cancel()),
            Err(Error::ContextClosed)
        ));
        assert_eq!(rec.store().len(), 1);
    }
}
