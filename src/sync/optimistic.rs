//! Ledger of optimistic operations awaiting a server response.
//!
//! Every pending operation is identified by an [`IntentId`]. A field patch
//! remembers the last server-confirmed value of its entity (the baseline) so
//! it can be rolled back; a provisional insert remembers the locally assigned
//! identifier so it can be swapped for the server's copy or removed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::entity::Entity;

/// Identifier of one optimistic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntentId(u64);

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "intent-{}", self.0)
    }
}

/// Entity field targeted by a patch. At most one patch is pending per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchKey {
    pub entity_id: String,
    pub field: String,
}

impl PatchKey {
    pub fn new(entity_id: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            field: field.into(),
        }
    }
}

/// Local change applied on top of a server value.
pub type Patch<E> = Arc<dyn Fn(&mut E) + Send + Sync>;

struct PendingPatch<E> {
    intent: IntentId,
    field: String,
    patch: Patch<E>,
    created_at: Instant,
}

/// Pending patches on one entity, in application order.
struct EntityPatches<E> {
    baseline: E,
    patches: Vec<PendingPatch<E>>,
}

impl<E: Entity> EntityPatches<E> {
    fn view(&self) -> E {
        let mut value = self.baseline.clone();
        for p in &self.patches {
            (p.patch)(&mut value);
        }
        value
    }
}

struct Provisional {
    entity_id: String,
    correlation: Option<String>,
    created_at: Instant,
}

enum IntentTarget {
    Patch(PatchKey),
    Provisional(String),
}

/// Outcome of recording a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub intent: IntentId,
    /// Earlier intent on the same field, now stale
    pub superseded: Option<IntentId>,
}

/// What resolving an intent did to the ledger.
pub enum Settled<E> {
    /// A patch was removed; `view` is the entity with the remaining patches
    /// applied over the (possibly advanced) baseline.
    Patch { entity_id: String, view: E },
    /// A provisional insert was resolved.
    Provisional { entity_id: String },
    /// The intent was superseded or already resolved.
    Stale,
}

impl<E> fmt::Debug for Settled<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Settled::Patch { entity_id, .. } => write!(f, "Patch({entity_id})"),
            Settled::Provisional { entity_id } => write!(f, "Provisional({entity_id})"),
            Settled::Stale => write!(f, "Stale"),
        }
    }
}

pub struct OptimisticLedger<E: Entity> {
    entities: HashMap<String, EntityPatches<E>>,
    provisional: HashMap<IntentId, Provisional>,
    intents: HashMap<IntentId, IntentTarget>,
    next_intent: u64,
}

impl<E: Entity> OptimisticLedger<E> {
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            provisional: HashMap::new(),
            intents: HashMap::new(),
            next_intent: 1,
        }
    }

    fn allocate(&mut self) -> IntentId {
        let id = IntentId(self.next_intent);
        self.next_intent += 1;
        id
    }

    /// Record a patch on `key`. `current` is the server-confirmed value, used
    /// as the baseline only when nothing is pending on the entity yet.
    /// A patch already pending on the same field is superseded; the baseline
    /// stays the one captured by the first patch.
    pub fn record(&mut self, key: PatchKey, current: &E, patch: Patch<E>) -> Recorded {
        let intent = self.allocate();
        let entry = self
            .entities
            .entry(key.entity_id.clone())
            .or_insert_with(|| EntityPatches {
                baseline: current.clone(),
                patches: Vec::new(),
            });

        let mut superseded = None;
        if let Some(pos) = entry.patches.iter().position(|p| p.field == key.field) {
            let old = entry.patches.remove(pos);
            superseded = Some(old.intent);
        }
        entry.patches.push(PendingPatch {
            intent,
            field: key.field.clone(),
            patch,
            created_at: Instant::now(),
        });

        if let Some(old) = superseded {
            self.intents.remove(&old);
        }
        self.intents.insert(intent, IntentTarget::Patch(key));
        Recorded { intent, superseded }
    }

    /// Record a locally created entity awaiting server confirmation.
    pub fn record_provisional(&mut self, entity: &E) -> IntentId {
        let intent = self.allocate();
        self.provisional.insert(
            intent,
            Provisional {
                entity_id: entity.id().to_string(),
                correlation: entity.correlation_key().map(str::to_string),
                created_at: Instant::now(),
            },
        );
        self.intents
            .insert(intent, IntentTarget::Provisional(entity.id().to_string()));
        intent
    }

    /// Whether a pending operation keeps `id` out of authoritative removal.
    pub fn protects(&self, id: &str) -> bool {
        self.entities.contains_key(id)
            || self.provisional.values().any(|p| p.entity_id == id)
    }

    pub fn is_pending(&self, intent: IntentId) -> bool {
        self.intents.contains_key(&intent)
    }

    pub fn pending_count(&self) -> usize {
        self.intents.len()
    }

    /// Last server-confirmed value of an entity with pending patches.
    pub fn baseline(&self, id: &str) -> Option<&E> {
        self.entities.get(id).map(|e| &e.baseline)
    }

    /// Baseline with every pending patch applied, for entities that have any.
    pub fn view(&self, id: &str) -> Option<E> {
        self.entities.get(id).map(EntityPatches::view)
    }

    /// Provisional intent waiting on `correlation`.
    pub fn provisional_for(&self, correlation: &str) -> Option<(IntentId, &str)> {
        self.provisional.iter().find_map(|(intent, p)| {
            (p.correlation.as_deref() == Some(correlation)).then_some((*intent, p.entity_id.as_str()))
        })
    }

    /// Move the baseline of `incoming`'s entity to the new server value and
    /// return what should be displayed: the server value with every pending
    /// patch re-applied.
    pub fn rebase(&mut self, incoming: E) -> E {
        match self.entities.get_mut(incoming.id()) {
            Some(entry) => {
                entry.baseline = incoming;
                entry.view()
            }
            None => incoming,
        }
    }

    /// Settle an intent as accepted. `server` is the server's copy when the
    /// response carried one; otherwise the patch itself becomes part of the
    /// baseline.
    pub fn confirm(&mut self, intent: IntentId, server: Option<E>) -> Settled<E> {
        match self.intents.remove(&intent) {
            Some(IntentTarget::Patch(key)) => {
                let Some(entry) = self.entities.get_mut(&key.entity_id) else {
                    return Settled::Stale;
                };
                let Some(pos) = entry.patches.iter().position(|p| p.intent == intent) else {
                    return Settled::Stale;
                };
                let done = entry.patches.remove(pos);
                match server {
                    Some(value) => entry.baseline = value,
                    None => (done.patch)(&mut entry.baseline),
                }
                let view = entry.view();
                if entry.patches.is_empty() {
                    self.entities.remove(&key.entity_id);
                }
                Settled::Patch {
                    entity_id: key.entity_id,
                    view,
                }
            }
            Some(IntentTarget::Provisional(entity_id)) => {
                self.provisional.remove(&intent);
                Settled::Provisional { entity_id }
            }
            None => Settled::Stale,
        }
    }

    /// Settle an intent as refused: drop its patch (or provisional entry) so
    /// the view falls back to the baseline plus whatever else is pending.
    pub fn reject(&mut self, intent: IntentId) -> Settled<E> {
        match self.intents.remove(&intent) {
            Some(IntentTarget::Patch(key)) => {
                let Some(entry) = self.entities.get_mut(&key.entity_id) else {
                    return Settled::Stale;
                };
                entry.patches.retain(|p| p.intent != intent);
                let view = entry.view();
                if entry.patches.is_empty() {
                    self.entities.remove(&key.entity_id);
                }
                Settled::Patch {
                    entity_id: key.entity_id,
                    view,
                }
            }
            Some(IntentTarget::Provisional(entity_id)) => {
                self.provisional.remove(&intent);
                Settled::Provisional { entity_id }
            }
            None => Settled::Stale,
        }
    }

    /// Intents older than `max_age`, oldest first.
    pub fn expired(&self, max_age: Duration) -> Vec<IntentId> {
        let now = Instant::now();
        let mut out: Vec<(Instant, IntentId)> = self
            .entities
            .values()
            .flat_map(|e| e.patches.iter().map(|p| (p.created_at, p.intent)))
            .chain(self.provisional.iter().map(|(id, p)| (p.created_at, *id)))
            .filter(|(created, _)| now.duration_since(*created) >= max_age)
            .collect();
        out.sort();
        out.into_iter().map(|(_, id)| id).collect()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.provisional.clear();
        self.intents.clear();
    }
}

impl<E: Entity> Default for OptimisticLedger<E> {
    fn default() -> Self {
        Self::new()
    }
}
