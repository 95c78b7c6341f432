//! Canonical in-memory copy of synchronized entities.

use std::collections::{BTreeMap, HashMap};

use super::entity::{ApplyOutcome, Entity};

/// Holds exactly one copy per identifier.
///
/// The store only knows how to replace, remove and look up. Everything that
/// decides *what* to write (optimistic rebasing, provisional swaps, merge
/// policy) lives in [`Reconciler`](super::Reconciler), which is the only
/// writer.
#[derive(Debug)]
pub struct EntityStore<E: Entity> {
    entities: BTreeMap<String, E>,
    /// correlation key → identifier
    correlation: HashMap<String, String>,
    closed: bool,
}

impl<E: Entity> EntityStore<E> {
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            correlation: HashMap::new(),
            closed: false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&E> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.entities.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    /// Cloned copy of every entity, ordered by identifier.
    pub fn snapshot(&self) -> Vec<E> {
        self.entities.values().cloned().collect()
    }

    /// Identifier of the entity carrying `key` as its correlation key.
    pub fn find_by_correlation(&self, key: &str) -> Option<&str> {
        self.correlation.get(key).map(String::as_str)
    }

    /// Insert or replace the entity with the same identifier.
    pub fn upsert(&mut self, entity: E) -> ApplyOutcome<E> {
        if self.closed {
            return ApplyOutcome::Detached;
        }
        if let Some(existing) = self.entities.get(entity.id()) {
            if *existing == entity {
                return ApplyOutcome::Unchanged;
            }
        }

        let id = entity.id().to_string();
        if let Some(key) = entity.correlation_key() {
            self.correlation.insert(key.to_string(), id.clone());
        }
        match self.entities.insert(id, entity) {
            Some(previous) => {
                self.forget_correlation_if_moved(&previous);
                ApplyOutcome::Updated { previous }
            }
            None => ApplyOutcome::Inserted,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<E> {
        if self.closed {
            return None;
        }
        let removed = self.entities.remove(id)?;
        if let Some(key) = removed.correlation_key() {
            if self.correlation.get(key).map(String::as_str) == Some(id) {
                self.correlation.remove(key);
            }
        }
        Some(removed)
    }

    /// Detach the store: every later write is a no-op.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn forget_correlation_if_moved(&mut self, previous: &E) {
        let Some(old_key) = previous.correlation_key() else {
            return;
        };
        let still_present = self
            .entities
            .get(previous.id())
            .and_then(|e| e.correlation_key())
            == Some(old_key);
        if !still_present && self.correlation.get(old_key).map(String::as_str) == Some(previous.id())
        {
            self.correlation.remove(old_key);
        }
    }
}

impl<E: Entity> Default for EntityStore<E> {
    fn default() -> Self {
        Self::new()
    }
}
