//! Dirty-Tracking Store: a global, sharded, bounded LRU of
//! entity-identity → original field snapshot, used to compute
//! changed-field sets for partial updates.

use crate::ast::Value;
use crate::schema::Schema;
use lru_cache::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_SHARDS: usize = 256;

/// Opaque per-entity identity the caller derives when an entity is
/// loaded — typically the entity's memory address or its primary-key
/// value tagged with its type.
pub type Identity = u64;

type Snapshot = HashMap<String, Value>;

struct Shard {
    map: Mutex<LruCache<Identity, (Snapshot, Option<ScopeId>)>>,
}

pub type ScopeId = u64;

/// A sharded, bounded LRU recording each tracked entity's original
/// field values as of the last `track`/`sync` call.
pub struct DirtyTracker {
    shards: Vec<Shard>,
}

impl DirtyTracker {
    pub fn new(capacity: usize, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard = (capacity / shard_count).max(1);
        let shards = (0..shard_count).map(|_| Shard { map: Mutex::new(LruCache::new(per_shard)) }).collect();
        Self { shards }
    }

    fn shard_for(&self, identity: Identity) -> &Shard {
        &self.shards[(identity as usize) % self.shards.len()]
    }

    fn snapshot_of(entity: &impl crate::schema::Entity, schema: &Schema) -> Snapshot {
        schema
            .fields
            .iter()
            .filter_map(|f| entity.get_field(&f.column_name).map(|v| (f.column_name.clone(), v)))
            .collect()
    }

    /// Snapshot `entity`'s current field values under `identity`,
    /// optionally registering it with `scope` for bulk cleanup later.
    /// Re-tracking an already-tracked identity refreshes the snapshot
    /// and moves it to MRU.
    pub fn track(&self, identity: Identity, entity: &impl crate::schema::Entity, schema: &Schema, scope: Option<ScopeId>) {
        let snapshot = Self::snapshot_of(entity, schema);
        self.shard_for(identity).map.lock().insert(identity, (snapshot, scope));
    }

    /// Whether `column` differs from its tracked original.
    /// Untracked entities, or columns absent from the snapshot, are
    /// always dirty.
    pub fn dirty(&self, identity: Identity, column: &str, entity: &impl crate::schema::Entity) -> bool {
        let mut guard = self.shard_for(identity).map.lock();
        let Some((snapshot, _)) = guard.get_mut(&identity) else {
            return true;
        };
        let Some(original) = snapshot.get(column) else {
            return true;
        };
        let Some(current) = entity.get_field(column) else {
            return true;
        };
        !values_equal(original, &current)
    }

    /// The set of non-primary-key columns that differ from the
    /// tracked original. An untracked entity reports every non-primary
    /// column as dirty.
    pub fn dirty_fields(&self, identity: Identity, entity: &impl crate::schema::Entity, schema: &Schema) -> HashMap<String, Value> {
        let mut guard = self.shard_for(identity).map.lock();
        let tracked = guard.get_mut(&identity).map(|(snapshot, _)| snapshot.clone());
        drop(guard);

        let mut out = HashMap::new();
        for field in &schema.fields {
            if field.is_primary {
                continue;
            }
            let Some(current) = entity.get_field(&field.column_name) else { continue };
            let is_dirty = match &tracked {
                None => true,
                Some(snapshot) => match snapshot.get(&field.column_name) {
                    Some(original) => !values_equal(original, &current),
                    None => true,
                },
            };
            if is_dirty {
                out.insert(field.column_name.clone(), current);
            }
        }
        out
    }

    /// Replace the tracked snapshot with the entity's current values
    /// (used after a successful update).
    pub fn sync(&self, identity: Identity, entity: &impl crate::schema::Entity, schema: &Schema) {
        self.track(identity, entity, schema, self.scope_of(identity));
    }

    fn scope_of(&self, identity: Identity) -> Option<ScopeId> {
        self.shard_for(identity).map.lock().get_mut(&identity).and_then(|(_, scope)| *scope)
    }

    /// Drop the tracked snapshot for `identity`.
    pub fn clear(&self, identity: Identity) {
        self.shard_for(identity).map.lock().remove(&identity);
    }

    pub fn is_tracked(&self, identity: Identity) -> bool {
        self.shard_for(identity).map.lock().get_mut(&identity).is_some()
    }

    /// Drop every snapshot registered under `scope` in one pass.
    pub fn close_scope(&self, scope: ScopeId) {
        for shard in &self.shards {
            let mut guard = shard.map.lock();
            let dead: Vec<Identity> = guard
                .iter()
                .filter(|(_, (_, s))| *s == Some(scope))
                .map(|(id, _)| *id)
                .collect();
            for id in dead {
                guard.remove(&id);
            }
        }
    }
}

impl Default for DirtyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_SHARDS)
    }
}

/// A handle grouping a batch of tracked identities for bulk cleanup.
/// Closing is idempotent: subsequent operations on an already-closed
/// scope are no-ops because its identities are simply no longer
/// present in the tracker.
pub struct Scope {
    id: ScopeId,
    tracker: Arc<DirtyTracker>,
    closed: bool,
}

impl Scope {
    pub fn new(id: ScopeId, tracker: Arc<DirtyTracker>) -> Self {
        Self { id, tracker, closed: false }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.tracker.close_scope(self.id);
        self.closed = true;
    }
}

/// Fast-path equality for primitives (NaN-strict, nil-matched), deep
/// equality for everything else.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Double(Some(x)), Value::Double(Some(y))) => x.to_bits() == y.to_bits(),
        (Value::Float(Some(x)), Value::Float(Some(y))) => x.to_bits() == y.to_bits(),
        _ => a == b,
    }
}
