//! The bounded, sharded column-mapping cache.

use lru_cache::LruCache;
use parking_lot::Mutex;
use std::any::TypeId;

const DEFAULT_CAPACITY: usize = 1024;
const SHARD_COUNT: usize = 64;

/// `column_ref = None` marks a result column with no matching field.
pub type ColumnMapping = Vec<Option<usize>>;

struct Shard {
    map: Mutex<LruCache<(TypeId, String), ColumnMapping>>,
}

/// A sharded, bounded LRU mapping `(type, "col,col,...") → field-index
/// vector`, computed lazily from the [`crate::schema::Schema`] on miss.
pub struct ColumnMapCache {
    shards: Vec<Shard>,
    per_shard_capacity: usize,
}

impl ColumnMapCache {
    pub fn new(capacity: usize, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard_capacity = (capacity / shard_count).max(1);
        let shards = (0..shard_count)
            .map(|_| Shard {
                map: Mutex::new(LruCache::new(per_shard_capacity)),
            })
            .collect();
        Self { shards, per_shard_capacity }
    }

    pub fn per_shard_capacity(&self) -> usize {
        self.per_shard_capacity
    }

    fn shard_for(&self, type_id: TypeId, key: &str) -> &Shard {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        type_id.hash(&mut hasher);
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Fetch the cached mapping, or compute it from `schema` and cache it.
    pub fn get_or_compute(
        &self,
        type_id: TypeId,
        schema: &crate::schema::Schema,
        column_names: &[String],
    ) -> ColumnMapping {
        let key = column_names.join(",");
        let shard = self.shard_for(type_id, &key);

        {
            let mut guard = shard.map.lock();
            if let Some(existing) = guard.get_mut(&(type_id, key.clone())) {
                return existing.clone();
            }
        }

        let mapping: ColumnMapping = column_names
            .iter()
            .map(|col| schema.column_index.get(col).copied())
            .collect();

        shard.map.lock().insert((type_id, key), mapping.clone());
        mapping
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.map.lock().clear();
        }
    }
}

impl Default for ColumnMapCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, SHARD_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Entity, FieldDef, SchemaBuilder};

    struct T;
    impl Entity for T {
        fn describe() -> SchemaBuilder {
            SchemaBuilder::new().field(FieldDef::new("id").primary())
        }
        fn get_field(&self, _: &str) -> Option<crate::ast::Value> {
            None
        }
        fn set_field(&mut self, _: &str, _: crate::ast::Value) -> crate::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unmapped_columns_are_none() {
        let schema = crate::schema::Schema::of::<T>().unwrap();
        let cache = ColumnMapCache::default();
        let mapping = cache.get_or_compute(TypeId::of::<T>(), &schema, &["id".into(), "nope".into()]);
        assert_eq!(mapping, vec![Some(0), None]);
    }

    #[test]
    fn repeated_lookup_hits_cache() {
        let schema = crate::schema::Schema::of::<T>().unwrap();
        let cache = ColumnMapCache::default();
        let cols = vec!["id".to_string()];
        let first = cache.get_or_compute(TypeId::of::<T>(), &schema, &cols);
        let second = cache.get_or_compute(TypeId::of::<T>(), &schema, &cols);
        assert_eq!(first, second);
    }

    #[test]
    fn minimum_per_shard_capacity_is_one() {
        let cache = ColumnMapCache::new(1, 64);
        assert_eq!(cache.per_shard_capacity(), 1);
    }
}
